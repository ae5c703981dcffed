//! Chunkserver connection handling.
//!
//! The pool is process-wide and keyed by address. A connection handed out to
//! an operation is owned exclusively by it; well-behaved operations return
//! the connection afterwards so later reads of the same chunk skip the TCP
//! handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{format_err, Context, Error};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use lfs_protocol::{ChunkserverAddress, PacketCodec};

use crate::chunkserver_stats::ChunkserverStats;

/// How long an idle pooled connection stays usable.
const IDLE_CONNECTION_TTL: Duration = Duration::from_secs(3);

pub type ChunkserverConnection = Framed<TcpStream, PacketCodec>;

struct IdleConnection {
    connection: ChunkserverConnection,
    idle_since: Instant,
}

/// Pool of idle chunkserver connections.
#[derive(Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<ChunkserverAddress, Vec<IdleConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, address: ChunkserverAddress) -> Option<ChunkserverConnection> {
        let mut idle = self.idle.lock().unwrap();
        let connections = idle.get_mut(&address)?;
        while let Some(candidate) = connections.pop() {
            if candidate.idle_since.elapsed() < IDLE_CONNECTION_TTL {
                return Some(candidate.connection);
            }
        }
        None
    }

    /// Return a healthy connection for reuse.
    pub fn give_back(&self, address: ChunkserverAddress, connection: ChunkserverConnection) {
        let mut idle = self.idle.lock().unwrap();
        idle.entry(address).or_default().push(IdleConnection {
            connection,
            idle_since: Instant::now(),
        });
    }
}

/// Opens (or reuses) connections to chunkservers and keeps score of how the
/// servers behave.
pub struct ChunkConnector {
    pool: ConnectionPool,
    stats: Arc<ChunkserverStats>,
}

impl ChunkConnector {
    pub fn new(stats: Arc<ChunkserverStats>) -> Self {
        ChunkConnector {
            pool: ConnectionPool::new(),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ChunkserverStats> {
        &self.stats
    }

    pub async fn connect(
        &self,
        address: ChunkserverAddress,
        connect_timeout: Duration,
    ) -> Result<ChunkserverConnection, Error> {
        if let Some(connection) = self.pool.take(address) {
            return Ok(connection);
        }

        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect(address.to_socket_addr()),
        )
        .await
        .map_err(|_| {
            self.stats.register_defect(address);
            format_err!("connecting to chunkserver {} timed out", address)
        })?
        .map_err(|err| {
            self.stats.register_defect(address);
            Error::new(err)
        })
        .with_context(|| format!("connecting to chunkserver {}", address))?;

        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, PacketCodec))
    }

    pub fn give_back(&self, address: ChunkserverAddress, connection: ChunkserverConnection) {
        self.pool.give_back(address, connection);
    }
}

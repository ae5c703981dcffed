//! Client session with the metadata master.
//!
//! One TCP connection, shared by all threads of the mount. Each
//! request/response round is atomic on the socket: the connection mutex is
//! held across send and receive, and message ids guard against stray
//! replies. A broken connection is dropped and transparently reopened on
//! the next request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use lfs_api_types::{FlockWrapper, InterruptData, LizError, StatusCode};
use lfs_protocol::packet::Message;
use lfs_protocol::{cltoma, matocl, Packet, PacketCodec, PartLocation};

/// Everything the master tells a client about one chunk. Valid only for the
/// duration of the current attempt; reacquire after any failure.
#[derive(Clone, Debug)]
pub struct ChunkLocation {
    pub file_length: u64,
    pub chunk_id: u64,
    pub chunk_version: u32,
    pub locations: Vec<PartLocation>,
}

/// A granted write lease on one chunk.
#[derive(Clone, Debug)]
pub struct WriteGrant {
    pub file_length: u64,
    pub chunk_id: u64,
    pub chunk_version: u32,
    pub lock_id: u32,
    pub locations: Vec<PartLocation>,
}

pub struct MasterSessionOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for MasterSessionOptions {
    fn default() -> Self {
        MasterSessionOptions {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl MasterSessionOptions {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

pub struct MasterSession {
    address: SocketAddr,
    options: MasterSessionOptions,
    connection: Mutex<Option<Framed<TcpStream, PacketCodec>>>,
    message_id: AtomicU32,
}

impl MasterSession {
    pub fn new(address: SocketAddr, options: MasterSessionOptions) -> Self {
        MasterSession {
            address,
            options,
            connection: Mutex::new(None),
            message_id: AtomicU32::new(1),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn next_message_id(&self) -> u32 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// One atomic request/response round.
    pub async fn request(&self, packet: Packet, reply_type: u32) -> Result<Packet, Error> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            let stream = tokio::time::timeout(
                self.options.connect_timeout,
                TcpStream::connect(self.address),
            )
            .await
            .map_err(|_| format_err!("connecting to master {} timed out", self.address))?
            .with_context(|| format!("connecting to master {}", self.address))?;
            stream.set_nodelay(true)?;
            *guard = Some(Framed::new(stream, PacketCodec));
        }
        let connection = guard.as_mut().unwrap();

        let round = async {
            connection.send(packet).await?;
            match connection.next().await {
                Some(reply) => Ok(reply?),
                None => bail!("master {} closed the connection", self.address),
            }
        };
        let reply: Result<Packet, Error> =
            match tokio::time::timeout(self.options.request_timeout, round).await {
                Ok(reply) => reply,
                Err(_) => Err(LizError::Timeout.into()),
            };

        match reply {
            Ok(reply) => {
                if reply.ptype != reply_type {
                    *guard = None;
                    bail!(
                        "unexpected reply type {:#06x} from master (expected {:#06x})",
                        reply.ptype,
                        reply_type
                    );
                }
                Ok(reply)
            }
            Err(err) => {
                // any failure poisons the connection; reconnect next time
                *guard = None;
                Err(err)
            }
        }
    }

    /// Resolve `(inode, chunk_index)` to chunk id, version and the current
    /// part locations.
    pub async fn read_chunk(&self, inode: u32, chunk_index: u32) -> Result<ChunkLocation, Error> {
        let message_id = self.next_message_id();
        let request = cltoma::FuseReadChunk {
            message_id,
            inode,
            chunk_index,
        };
        let reply = self
            .request(request.to_packet(), matocl::MATOCL_FUSE_READ_CHUNK)
            .await?;
        match matocl::FuseReadChunkReply::from_packet(&reply)? {
            matocl::FuseReadChunkReply::Status {
                message_id: reply_id,
                status,
            } => {
                check_message_id(message_id, reply_id)?;
                status.into_result()?;
                bail!("master sent OK status without chunk location");
            }
            matocl::FuseReadChunkReply::Response {
                message_id: reply_id,
                file_length,
                chunk_id,
                chunk_version,
                locations,
            } => {
                check_message_id(message_id, reply_id)?;
                Ok(ChunkLocation {
                    file_length,
                    chunk_id,
                    chunk_version,
                    locations,
                })
            }
        }
    }

    /// Open a chunk for writing. Passing the lock id of a failed attempt
    /// makes the call idempotent: the same grant comes back as long as the
    /// master still holds the lock.
    pub async fn write_chunk(
        &self,
        inode: u32,
        chunk_index: u32,
        lock_id: u32,
    ) -> Result<WriteGrant, Error> {
        let message_id = self.next_message_id();
        let request = cltoma::FuseWriteChunk {
            message_id,
            inode,
            chunk_index,
            lock_id,
        };
        let reply = self
            .request(request.to_packet(), matocl::MATOCL_FUSE_WRITE_CHUNK)
            .await?;
        match matocl::FuseWriteChunkReply::from_packet(&reply)? {
            matocl::FuseWriteChunkReply::Status {
                message_id: reply_id,
                status,
            } => {
                check_message_id(message_id, reply_id)?;
                status.into_result()?;
                bail!("master sent OK status without write grant");
            }
            matocl::FuseWriteChunkReply::Response {
                message_id: reply_id,
                file_length,
                chunk_id,
                chunk_version,
                lock_id,
                locations,
            } => {
                check_message_id(message_id, reply_id)?;
                Ok(WriteGrant {
                    file_length,
                    chunk_id,
                    chunk_version,
                    lock_id,
                    locations,
                })
            }
        }
    }

    /// Commit a write: persist the new file length and release the lock.
    pub async fn write_chunk_end(
        &self,
        chunk_id: u64,
        lock_id: u32,
        inode: u32,
        file_length: u64,
    ) -> Result<(), Error> {
        let message_id = self.next_message_id();
        let request = cltoma::FuseWriteChunkEnd {
            message_id,
            chunk_id,
            lock_id,
            inode,
            file_length,
        };
        let reply = self
            .request(request.to_packet(), matocl::MATOCL_FUSE_WRITE_CHUNK_END)
            .await?;
        let reply = matocl::FuseWriteChunkEndReply::from_packet(&reply)?;
        check_message_id(message_id, reply.message_id)?;
        reply.status.into_result()?;
        Ok(())
    }

    /// Acquire or release a POSIX lock. Blocking acquires keep the round
    /// open until the master grants, refuses or interrupts the request.
    pub async fn setlk(
        &self,
        inode: u32,
        owner: u64,
        request_id: u32,
        lock: FlockWrapper,
    ) -> Result<StatusCode, Error> {
        let message_id = self.next_message_id();
        let request = cltoma::FuseSetlk {
            message_id,
            inode,
            owner,
            request_id,
            lock,
        };
        let reply = self
            .request(request.to_packet(), matocl::MATOCL_FUSE_SETLK)
            .await?;
        let reply = matocl::FuseSetlkReply::from_packet(&reply)?;
        check_message_id(message_id, reply.message_id)?;
        Ok(reply.status)
    }

    pub async fn getlk(
        &self,
        inode: u32,
        owner: u64,
        lock: FlockWrapper,
    ) -> Result<FlockWrapper, Error> {
        let message_id = self.next_message_id();
        let request = cltoma::FuseGetlk {
            message_id,
            inode,
            owner,
            lock,
        };
        let reply = self
            .request(request.to_packet(), matocl::MATOCL_FUSE_GETLK)
            .await?;
        let reply = matocl::FuseGetlkReply::from_packet(&reply)?;
        check_message_id(message_id, reply.message_id)?;
        reply.status.into_result()?;
        Ok(reply.lock)
    }

    /// Cancel a blocked [Self::setlk]; the master answers the original call
    /// with an interrupted status. The session round may be occupied by the
    /// very request being cancelled, so the interrupt travels over a
    /// transient connection of its own.
    pub async fn setlk_interrupt(&self, interrupt: InterruptData) -> Result<(), Error> {
        let message_id = self.next_message_id();
        let request = cltoma::FuseSetlkInterrupt {
            message_id,
            interrupt,
        };

        let stream = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(self.address),
        )
        .await
        .map_err(|_| format_err!("connecting to master {} timed out", self.address))?
        .with_context(|| format!("connecting to master {}", self.address))?;
        let mut connection = Framed::new(stream, PacketCodec);

        connection.send(request.to_packet()).await?;
        let reply = tokio::time::timeout(self.options.request_timeout, connection.next())
            .await
            .map_err(|_| Error::from(LizError::Timeout))?
            .ok_or_else(|| format_err!("master {} closed the connection", self.address))??;
        let reply = matocl::FuseSetlkReply::from_packet(&reply)?;
        reply.status.into_result()?;
        Ok(())
    }
}

fn check_message_id(sent: u32, received: u32) -> Result<(), Error> {
    if sent != received {
        bail!(
            "master reply carries message id {} (expected {})",
            received,
            sent
        );
    }
    Ok(())
}

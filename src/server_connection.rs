//! Simple request/response connection used by the admin tool.

use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use lfs_protocol::{Packet, PacketCodec};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerConnection {
    framed: Framed<TcpStream, PacketCodec>,
    peer: String,
}

impl ServerConnection {
    pub async fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let peer = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(ADMIN_TIMEOUT, TcpStream::connect(&peer))
            .await
            .map_err(|_| format_err!("connecting to {} timed out", peer))?
            .with_context(|| format!("connecting to {}", peer))?;
        Ok(ServerConnection {
            framed: Framed::new(stream, PacketCodec),
            peer,
        })
    }

    /// Send one request and wait for the reply of the expected type.
    pub async fn send_and_receive(
        &mut self,
        request: Packet,
        expected_type: u32,
    ) -> Result<Packet, Error> {
        self.framed.send(request).await?;
        let reply = tokio::time::timeout(ADMIN_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| format_err!("waiting for a reply from {} timed out", self.peer))?
            .ok_or_else(|| format_err!("{} closed the connection", self.peer))??;
        if reply.ptype != expected_type {
            bail!(
                "unexpected reply type {:#06x} from {} (expected {:#06x})",
                reply.ptype,
                self.peer,
                expected_type
            );
        }
        Ok(reply)
    }
}

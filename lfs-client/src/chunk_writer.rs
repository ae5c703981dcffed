//! High level write path.
//!
//! A write opens the chunk through the master (receiving a lock id and the
//! chain of chunkservers to stream to), pushes CRC-protected block writes
//! down the chain and commits the new file length on the master. The lock
//! id is idempotent per (inode, chunk index): when an attempt fails halfway
//! through, the retry presents the previous lock id and receives the same
//! grant as long as the master still holds the lock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};

use lfs_api_types::{LizError, SliceType, LFS_BLOCK_SIZE, LFS_CHUNK_SIZE};
use lfs_protocol::packet::Message;
use lfs_protocol::{cltocs, cstocl, ChunkserverAddress};

use crate::connection_pool::ChunkConnector;
use crate::master_conn::{MasterSession, WriteGrant};

/// Writes in flight on the chain before we wait for acknowledgements.
const WRITE_WINDOW: usize = 8;

pub struct ChunkWriterOptions {
    pub connect_timeout: Duration,
    /// Per write-status wait on the chain socket.
    pub write_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ChunkWriterOptions {
    fn default() -> Self {
        ChunkWriterOptions {
            connect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(10),
            max_retries: 5,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

pub struct ChunkWriter {
    master: Arc<MasterSession>,
    connector: Arc<ChunkConnector>,
    options: ChunkWriterOptions,
}

impl ChunkWriter {
    pub fn new(
        master: Arc<MasterSession>,
        connector: Arc<ChunkConnector>,
        options: ChunkWriterOptions,
    ) -> Self {
        ChunkWriter {
            master,
            connector,
            options,
        }
    }

    /// Write `data` at `offset` of `inode`. Returns the file length after
    /// the final commit.
    pub async fn write(&self, inode: u32, offset: u64, data: &[u8]) -> Result<u64, Error> {
        let mut file_length = 0;
        let mut position = offset;
        let mut remaining = data;

        while !remaining.is_empty() {
            let chunk_index = (position / LFS_CHUNK_SIZE) as u32;
            let chunk_base = chunk_index as u64 * LFS_CHUNK_SIZE;
            let in_chunk = position - chunk_base;
            let piece_len = ((LFS_CHUNK_SIZE - in_chunk) as usize).min(remaining.len());
            let (piece, rest) = remaining.split_at(piece_len);

            file_length = self
                .write_chunk(inode, chunk_index, in_chunk, piece)
                .await
                .with_context(|| format!("writing chunk {} of inode {}", chunk_index, inode))?;

            position += piece_len as u64;
            remaining = rest;
        }

        Ok(file_length)
    }

    /// One chunk worth of data: open, stream, commit; bounded retries with
    /// backoff around the whole sequence.
    async fn write_chunk(
        &self,
        inode: u32,
        chunk_index: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, Error> {
        let chunk_base = chunk_index as u64 * LFS_CHUNK_SIZE;
        let mut lock_id = 0;
        let mut attempt = 0;

        loop {
            let result = async {
                let grant = self.master.write_chunk(inode, chunk_index, lock_id).await?;
                lock_id = grant.lock_id;
                self.stream_to_chain(&grant, offset, data).await?;

                let new_length = grant
                    .file_length
                    .max(chunk_base + offset + data.len() as u64);
                self.master
                    .write_chunk_end(grant.chunk_id, grant.lock_id, inode, new_length)
                    .await?;
                Ok::<u64, Error>(new_length)
            }
            .await;

            match result {
                Ok(new_length) => return Ok(new_length),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.options.max_retries {
                        return Err(err);
                    }
                    log::debug!(
                        "write to inode {} chunk {} attempt {} failed: {:#}",
                        inode,
                        chunk_index,
                        attempt,
                        err
                    );
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
            }
        }
    }

    /// Stream block writes to the head of the chain, keeping a window of
    /// unacknowledged write ids, and close the chain when done.
    async fn stream_to_chain(
        &self,
        grant: &WriteGrant,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let chain: Vec<ChunkserverAddress> = grant
            .locations
            .iter()
            .filter(|part| part.part_type.slice_type() == SliceType::Standard)
            .map(|part| part.address)
            .collect();
        let head = match chain.first() {
            Some(address) => *address,
            None => return Err(LizError::TryAgain.into()),
        };
        let part_type = grant
            .locations
            .iter()
            .find(|part| part.part_type.slice_type() == SliceType::Standard)
            .map(|part| part.part_type)
            .unwrap();

        let mut connection = self
            .connector
            .connect(head, self.options.connect_timeout)
            .await?;

        let init = cltocs::WriteInit {
            chunk_id: grant.chunk_id,
            chunk_version: grant.chunk_version,
            part_type,
            chain: chain[1..].to_vec(),
        };
        connection.send(init.to_packet()).await?;

        let mut pending: Vec<u32> = Vec::new();
        let mut next_write_id = 1u32;
        let mut position = offset;
        let mut remaining = data;

        while !remaining.is_empty() || !pending.is_empty() {
            if !remaining.is_empty() && pending.len() < WRITE_WINDOW {
                let block = LFS_BLOCK_SIZE as u64;
                let offset_in_block = position % block;
                let piece_len = ((block - offset_in_block) as usize).min(remaining.len());
                let (piece, rest) = remaining.split_at(piece_len);

                let write = cltocs::WriteData {
                    chunk_id: grant.chunk_id,
                    write_id: next_write_id,
                    block_number: (position / block) as u16,
                    offset_in_block: offset_in_block as u16,
                    size: piece_len as u32,
                    crc: crc32fast::hash(piece),
                    data: Bytes::copy_from_slice(piece),
                };
                connection.send(write.to_packet()).await?;
                pending.push(next_write_id);
                next_write_id += 1;
                position += piece_len as u64;
                remaining = rest;
                continue;
            }

            let packet = tokio::time::timeout(self.options.write_timeout, connection.next())
                .await
                .map_err(|_| Error::from(LizError::Timeout))?;
            let packet = match packet {
                Some(packet) => packet?,
                None => bail!("chunkserver {} closed the write chain", head),
            };
            let status = cstocl::WriteStatus::from_packet(&packet)?;
            if status.chunk_id != grant.chunk_id {
                bail!("write status for wrong chunk from {}", head);
            }
            // a version mismatch is fatal for this attempt; the caller
            // reacquires the chunk from the master
            status.status.into_result()?;
            match pending.iter().position(|id| *id == status.write_id) {
                Some(index) => {
                    pending.remove(index);
                }
                None => bail!("unexpected write id {} from {}", status.write_id, head),
            }
        }

        let end = cltocs::WriteEnd {
            chunk_id: grant.chunk_id,
        };
        connection.send(end.to_packet()).await?;
        self.connector.give_back(head, connection);
        Ok(())
    }
}

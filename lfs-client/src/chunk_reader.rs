//! High level read path.
//!
//! A read first probes the per-inode cache. On a miss the master is asked
//! for the chunk location, a plan is built from the reported parts and
//! executed against the chunkservers, and the result is stored back into
//! the cache extent the query reserved. Any failure during execution
//! invalidates the location record: the whole attempt is retried with a
//! fresh one, a bounded number of times with backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Error};

use lfs_api_types::{
    ChunkPartType, LizError, SliceType, LFS_BLOCK_SIZE, LFS_CHUNK_SIZE,
};
use lfs_protocol::ChunkserverAddress;

use crate::chunkserver_stats::ChunkserverStats;
use crate::connection_pool::ChunkConnector;
use crate::master_conn::{ChunkLocation, MasterSession};
use crate::plan_executor::{ExecutorTimeouts, ReadPlanExecutor};
use crate::read_cache::ReadCache;
use crate::read_planner::{SliceReadPlanner, DEFAULT_BANDWIDTH_OVERUSE};

pub struct ChunkReaderOptions {
    pub timeouts: ExecutorTimeouts,
    /// Attempts per chunk before the read fails up to the caller.
    pub retries: u32,
    pub retry_backoff: Duration,
    pub bandwidth_overuse: f32,
    pub prefetch: bool,
    pub cache_ttl: Duration,
}

impl Default for ChunkReaderOptions {
    fn default() -> Self {
        ChunkReaderOptions {
            timeouts: ExecutorTimeouts::default(),
            retries: 3,
            retry_backoff: Duration::from_millis(200),
            bandwidth_overuse: DEFAULT_BANDWIDTH_OVERUSE,
            prefetch: false,
            cache_ttl: Duration::from_millis(500),
        }
    }
}

pub struct ChunkReader {
    master: Arc<MasterSession>,
    connector: Arc<ChunkConnector>,
    options: ChunkReaderOptions,
    caches: Mutex<HashMap<u32, ReadCache>>,
}

impl ChunkReader {
    pub fn new(
        master: Arc<MasterSession>,
        connector: Arc<ChunkConnector>,
        options: ChunkReaderOptions,
    ) -> Self {
        ChunkReader {
            master,
            connector,
            options,
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> &Arc<ChunkserverStats> {
        self.connector.stats()
    }

    /// Read `[offset, offset + size)` of `inode`. The returned buffer is
    /// truncated at end of file.
    pub async fn read(&self, inode: u32, offset: u64, size: u32) -> Result<Vec<u8>, Error> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let result = {
            let mut caches = self.caches.lock().unwrap();
            caches
                .entry(inode)
                .or_insert_with(|| ReadCache::new(self.options.cache_ttl))
                .query(offset, size)
        };

        if result.needs_fill() {
            let fill_offset = result.remaining_offset();
            let fill_size = offset + size as u64 - fill_offset;
            let data = self.read_from_chunks(inode, fill_offset, fill_size).await?;
            result.fill_input(data);
        }

        let mut output = vec![0u8; size as usize];
        let copied = result.copy_to_buffer(&mut output, offset);
        output.truncate(copied);
        Ok(output)
    }

    /// Drop all cached extents of `inode` (used on close and on write).
    pub fn invalidate_cache(&self, inode: u32) {
        let mut caches = self.caches.lock().unwrap();
        if let Some(cache) = caches.get_mut(&inode) {
            cache.clear();
        }
    }

    /// Read consecutive chunks until `size` bytes are collected or the file
    /// ends.
    async fn read_from_chunks(
        &self,
        inode: u32,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, Error> {
        let mut collected = Vec::new();
        let mut position = offset;
        let end = offset + size;

        while position < end {
            let chunk_index = (position / LFS_CHUNK_SIZE) as u32;
            let chunk_base = chunk_index as u64 * LFS_CHUNK_SIZE;
            let location = self.master.read_chunk(inode, chunk_index).await?;

            if position >= location.file_length {
                break;
            }
            let chunk_length = (location.file_length - chunk_base).min(LFS_CHUNK_SIZE);
            let want = end.min(location.file_length).min(chunk_base + LFS_CHUNK_SIZE) - position;

            let bytes = self
                .read_chunk_range(
                    inode,
                    chunk_index,
                    location,
                    chunk_length,
                    position - chunk_base,
                    want as u32,
                )
                .await
                .with_context(|| {
                    format!("reading chunk {} of inode {}", chunk_index, inode)
                })?;
            collected.extend_from_slice(&bytes);
            position += want;
        }

        Ok(collected)
    }

    /// Read a range of one chunk, retrying with fresh locations on failure.
    async fn read_chunk_range(
        &self,
        inode: u32,
        chunk_index: u32,
        mut location: ChunkLocation,
        chunk_length: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Error> {
        // an empty chunk reads as zeros, not as an error
        if chunk_length == 0 {
            return Ok(vec![0u8; size as usize]);
        }

        let mut attempt = 0;
        loop {
            match self
                .try_read_chunk_range(&location, chunk_length, offset, size)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.options.retries {
                        return Err(err);
                    }
                    log::debug!(
                        "chunk {:#x} attempt {} failed, refreshing locations: {:#}",
                        location.chunk_id,
                        attempt,
                        err
                    );
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                    // the old record is void; reacquire before retrying
                    location = self.master.read_chunk(inode, chunk_index).await?;
                }
            }
        }
    }

    async fn try_read_chunk_range(
        &self,
        location: &ChunkLocation,
        chunk_length: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Error> {
        if location.locations.is_empty() {
            return Err(LizError::ChunkLost.into());
        }

        let slice_type = choose_slice_type(location)?;
        let data_parts = slice_type.data_parts() as u64;
        let requested = requested_data_parts(slice_type);

        // map the byte range to stripe rows
        let first_block = offset / LFS_BLOCK_SIZE as u64;
        let last_block = (offset + size as u64 - 1) / LFS_BLOCK_SIZE as u64;
        let first_row = (first_block / data_parts) as u32;
        let last_row = (last_block / data_parts) as u32;
        let row_count = last_row - first_row + 1;

        let mut available = Vec::new();
        let mut addresses = Vec::new();
        let mut scores = Vec::new();
        for part in &location.locations {
            if part.part_type.slice_type() != slice_type {
                continue;
            }
            available.push(part.part_type);
            addresses.push(part.address);
            scores.push(self.connector.stats().score(part.address));
        }

        let mut planner =
            SliceReadPlanner::new().with_bandwidth_overuse(self.options.bandwidth_overuse);
        planner.prepare(slice_type, &requested, &available, &scores, chunk_length);
        if !planner.is_reading_possible() {
            return Err(LizError::NotEnoughParts.into());
        }
        let mut plan = planner.build_plan_for(first_row, row_count);
        plan.block_prefetch = self.options.prefetch;

        let mut executor =
            ReadPlanExecutor::new(location.chunk_id, location.chunk_version, plan);
        let mut buffer = Vec::new();
        executor
            .execute(&mut buffer, &addresses, &self.connector, self.options.timeouts)
            .await?;

        Ok(assemble_range(
            &buffer,
            requested.len(),
            (row_count * LFS_BLOCK_SIZE) as usize,
            offset - first_row as u64 * data_parts * LFS_BLOCK_SIZE as u64,
            size,
        ))
    }
}

/// The data parts a plain client read needs, in stripe order.
fn requested_data_parts(slice_type: SliceType) -> Vec<u8> {
    match slice_type {
        SliceType::Standard | SliceType::Tape => vec![0],
        SliceType::Xor(level) => (1..=level).collect(),
        SliceType::Ec(k, _) => (0..k).collect(),
    }
}

/// Pick the slice type to read from: standard replicas are the cheapest,
/// otherwise the slice with the most distinct parts beyond its recovery
/// threshold wins.
fn choose_slice_type(location: &ChunkLocation) -> Result<SliceType, Error> {
    let mut candidates: Vec<(SliceType, Vec<ChunkPartType>)> = Vec::new();
    for part in &location.locations {
        let slice_type = part.part_type.slice_type();
        match candidates.iter_mut().find(|(have, _)| *have == slice_type) {
            Some((_, parts)) => {
                if !parts.contains(&part.part_type) {
                    parts.push(part.part_type);
                }
            }
            None => candidates.push((slice_type, vec![part.part_type])),
        }
    }

    if candidates
        .iter()
        .any(|(slice_type, _)| slice_type.is_standard())
    {
        return Ok(SliceType::Standard);
    }

    candidates
        .iter()
        .filter(|(slice_type, parts)| parts.len() >= slice_type.required_parts_to_recover())
        .max_by_key(|(slice_type, parts)| {
            parts.len() as i64 - slice_type.required_parts_to_recover() as i64
        })
        .map(|(slice_type, _)| *slice_type)
        .ok_or_else(|| LizError::NotEnoughParts.into())
}

/// Rebuild the logical byte order from the per-part row buffers the
/// executor produced, then cut out the requested range.
fn assemble_range(
    buffer: &[u8],
    part_count: usize,
    part_bytes: usize,
    skip: u64,
    size: u32,
) -> Vec<u8> {
    let block = LFS_BLOCK_SIZE as usize;
    let rows = part_bytes / block;
    let mut linear = vec![0u8; part_count * part_bytes];

    for row in 0..rows {
        for part in 0..part_count {
            let src = part * part_bytes + row * block;
            let dst = (row * part_count + part) * block;
            linear[dst..dst + block].copy_from_slice(&buffer[src..src + block]);
        }
    }

    let start = skip as usize;
    let end = (start + size as usize).min(linear.len());
    linear[start..end].to_vec()
}

#[cfg(test)]
mod test {
    use super::*;
    use lfs_api_types::MediaLabel;
    use lfs_protocol::PartLocation;

    fn location_with(parts: &[(SliceType, u8)]) -> ChunkLocation {
        ChunkLocation {
            file_length: LFS_CHUNK_SIZE,
            chunk_id: 1,
            chunk_version: 1,
            locations: parts
                .iter()
                .map(|(slice_type, index)| PartLocation {
                    part_type: ChunkPartType::new(*slice_type, *index).unwrap(),
                    address: ChunkserverAddress {
                        ip: 0x7f000001,
                        port: 9400 + *index as u16,
                    },
                    label: MediaLabel::wildcard(),
                })
                .collect(),
        }
    }

    #[test]
    fn standard_replicas_are_preferred() {
        let location = location_with(&[
            (SliceType::Xor(2), 0),
            (SliceType::Xor(2), 1),
            (SliceType::Xor(2), 2),
            (SliceType::Standard, 0),
        ]);
        assert_eq!(choose_slice_type(&location).unwrap(), SliceType::Standard);
    }

    #[test]
    fn most_redundant_slice_wins_without_standard() {
        let location = location_with(&[
            (SliceType::Xor(2), 0),
            (SliceType::Xor(2), 1),
            (SliceType::Ec(2, 1), 0),
            (SliceType::Ec(2, 1), 1),
            (SliceType::Ec(2, 1), 2),
        ]);
        assert_eq!(choose_slice_type(&location).unwrap(), SliceType::Ec(2, 1));
    }

    #[test]
    fn unrecoverable_location_is_refused() {
        let location = location_with(&[(SliceType::Ec(3, 2), 0)]);
        assert!(choose_slice_type(&location).is_err());
    }

    #[test]
    fn assemble_restores_stripe_order() {
        let block = LFS_BLOCK_SIZE as usize;
        // two parts, two rows each: logical blocks 0..4 are striped as
        // part0=[b0, b2], part1=[b1, b3]
        let mut buffer = vec![0u8; 4 * block];
        buffer[0..block].fill(0);
        buffer[block..2 * block].fill(2);
        buffer[2 * block..3 * block].fill(1);
        buffer[3 * block..4 * block].fill(3);

        let linear = assemble_range(&buffer, 2, 2 * block, 0, (4 * block) as u32);
        for (index, expected) in [0u8, 1, 2, 3].iter().enumerate() {
            assert!(linear[index * block..(index + 1) * block]
                .iter()
                .all(|byte| byte == expected));
        }
    }
}

//! Read plans.
//!
//! A plan describes a complex read as a list of per-part read operations
//! tagged with wave numbers, plus a post-processing chain run once enough
//! parts arrived.
//!
//! A typical plan for ec(3,2) with all parts available:
//!
//! wave 0: read part 0, read part 1, read part 2
//! wave 1: read part 3, read part 4
//!
//! If the server holding part 1 stalls, the executor escalates to wave 1.
//! As soon as any three parts are in, [ReadPlan::is_reading_finished] holds
//! and [ReadPlan::post_process] recovers the missing data from parity.
//!
//! The requested parts occupy the front of the buffer at fixed offsets
//! (`index * buffer_part_size`); parts fetched only for recovery land in a
//! scratch region behind them.

use anyhow::{bail, Error};
use reed_solomon_erasure::galois_8::ReedSolomon;

use lfs_api_types::{ChunkPartType, SliceType, MAX_EC_PARTS};

/// One network read of `request_size` bytes of one part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOperation {
    /// Offset sent in the read request.
    pub request_offset: u32,
    /// Size sent in the read request (can be 0 for parts past EOF).
    pub request_size: u32,
    /// Where the part's bytes land in the plan buffer.
    pub buffer_offset: u32,
    /// Wave this operation starts in (wave 0 fires immediately).
    pub wave: u32,
}

/// A read operation bound to one reported part location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedOperation {
    pub part: ChunkPartType,
    /// Index into the caller's location list; distinguishes replicas of the
    /// same part.
    pub location: usize,
    pub op: ReadOperation,
}

/// One part the caller asked for and how many of its bytes are real data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestedPart {
    pub part: u8,
    pub size: u32,
}

/// Post-processing steps, interpreted in order by
/// [ReadPlan::post_process]. Recovery steps are no-ops when every requested
/// part was read directly, which keeps the chain idempotent for any given
/// set of fetched parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostOp {
    /// Zero the tail of every requested part beyond its real size.
    ZeroPad,
    /// Recover one missing requested part by xor-accumulating the other
    /// parts of the slice.
    XorRecover,
    /// Recover missing requested parts with the Reed-Solomon decoder.
    EcRecover { data_parts: u8, parity_parts: u8 },
}

#[derive(Clone, Debug, Default)]
pub struct ReadPlan {
    pub slice_type: Option<SliceType>,
    pub requested_parts: Vec<RequestedPart>,
    /// Bytes reserved per requested part (`block_count * LFS_BLOCK_SIZE`).
    pub buffer_part_size: u32,
    pub read_operations: Vec<PlannedOperation>,
    pub read_buffer_size: u32,
    pub block_prefetch: bool,
    pub post_ops: Vec<PostOp>,
}

fn distinct_parts(parts: &[ChunkPartType]) -> [bool; MAX_EC_PARTS] {
    let mut present = [false; MAX_EC_PARTS];
    for part in parts {
        present[part.index() as usize] = true;
    }
    present
}

impl ReadPlan {
    pub fn new(slice_type: SliceType) -> Self {
        ReadPlan {
            slice_type: Some(slice_type),
            ..Default::default()
        }
    }

    /// Bytes of the final result: the requested parts only.
    pub fn result_size(&self) -> usize {
        self.requested_parts.len() * self.buffer_part_size as usize
    }

    /// Size of the full working buffer including recovery scratch space.
    pub fn buffer_size(&self) -> usize {
        self.read_buffer_size as usize
    }

    fn required_to_recover(&self) -> usize {
        self.slice_type
            .map(|stype| stype.required_parts_to_recover())
            .unwrap_or(usize::MAX)
    }

    /// True once the request can be fulfilled from `available` parts, either
    /// directly or through recovery. Duplicate entries are allowed.
    pub fn is_reading_finished(&self, available: &[ChunkPartType]) -> bool {
        let present = distinct_parts(available);
        if present.iter().filter(|have| **have).count() >= self.required_to_recover() {
            return true;
        }
        self.requested_parts
            .iter()
            .all(|requested| present[requested.part as usize])
    }

    /// True while success is still reachable knowing that `unreadable` parts
    /// will never arrive.
    pub fn is_finishing_possible(&self, unreadable: &[ChunkPartType]) -> bool {
        let dead = distinct_parts(unreadable);
        let mut planned = [false; MAX_EC_PARTS];
        for operation in &self.read_operations {
            planned[operation.part.index() as usize] = true;
        }
        let alive = planned
            .iter()
            .zip(dead.iter())
            .filter(|(planned, dead)| **planned && !**dead)
            .count();
        if alive >= self.required_to_recover() {
            return true;
        }
        self.requested_parts
            .iter()
            .all(|requested| !dead[requested.part as usize])
    }

    /// Run the post-processing chain over the plan buffer. Returns the number
    /// of result bytes (requested parts only, zero-padded past EOF).
    pub fn post_process(
        &self,
        buffer: &mut [u8],
        available: &[ChunkPartType],
    ) -> Result<usize, Error> {
        for post_op in &self.post_ops {
            match post_op {
                PostOp::ZeroPad => self.zero_pad(buffer),
                PostOp::XorRecover => self.xor_recover(buffer, available)?,
                PostOp::EcRecover {
                    data_parts,
                    parity_parts,
                } => self.ec_recover(buffer, available, *data_parts, *parity_parts)?,
            }
        }
        Ok(self.result_size())
    }

    fn zero_pad(&self, buffer: &mut [u8]) {
        let part_size = self.buffer_part_size as usize;
        for (index, requested) in self.requested_parts.iter().enumerate() {
            let start = index * part_size + requested.size as usize;
            let end = (index + 1) * part_size;
            buffer[start..end].fill(0);
        }
    }

    fn xor_recover(&self, buffer: &mut [u8], available: &[ChunkPartType]) -> Result<(), Error> {
        let present = distinct_parts(available);
        let part_size = self.buffer_part_size as usize;

        let missing = match self
            .requested_parts
            .iter()
            .position(|requested| !present[requested.part as usize])
        {
            Some(position) => position,
            // every requested part was read directly
            None => return Ok(()),
        };
        let missing_offset = missing * part_size;
        let missing_size = self.requested_parts[missing].size as usize;

        let mut first = true;
        let mut accumulated = [false; MAX_EC_PARTS];
        for operation in &self.read_operations {
            let part = operation.part.index() as usize;
            if !present[part] || accumulated[part] {
                continue;
            }
            accumulated[part] = true;
            let src = operation.op.buffer_offset as usize;
            let size = (operation.op.request_size as usize).min(missing_size);
            if first {
                buffer.copy_within(src..src + size, missing_offset);
                buffer[missing_offset + size..missing_offset + missing_size].fill(0);
                first = false;
            } else {
                for byte in 0..size {
                    buffer[missing_offset + byte] ^= buffer[src + byte];
                }
            }
        }

        if first {
            bail!("no parts available for xor recovery");
        }
        Ok(())
    }

    fn ec_recover(
        &self,
        buffer: &mut [u8],
        available: &[ChunkPartType],
        data_parts: u8,
        parity_parts: u8,
    ) -> Result<(), Error> {
        let present = distinct_parts(available);
        if self
            .requested_parts
            .iter()
            .all(|requested| present[requested.part as usize])
        {
            return Ok(());
        }

        let k = data_parts as usize;
        let m = parity_parts as usize;
        let part_size = self.buffer_part_size as usize;

        // fragments must have uniform length, short reads are zero-extended
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; k + m];
        let mut used = 0;
        for operation in &self.read_operations {
            let part = operation.part.index() as usize;
            if !present[part] || shards[part].is_some() {
                continue;
            }
            if used >= k {
                break;
            }
            let src = operation.op.buffer_offset as usize;
            let size = operation.op.request_size as usize;
            let mut shard = vec![0u8; part_size];
            shard[..size].copy_from_slice(&buffer[src..src + size]);
            shards[part] = Some(shard);
            used += 1;
        }

        let codec = ReedSolomon::new(k, m)?;
        codec.reconstruct(&mut shards)?;

        for (index, requested) in self.requested_parts.iter().enumerate() {
            if present[requested.part as usize] {
                continue;
            }
            let shard = shards[requested.part as usize]
                .as_ref()
                .expect("reconstruct fills every erased shard");
            let dst = index * part_size;
            buffer[dst..dst + part_size].copy_from_slice(shard);
            buffer[dst + requested.size as usize..dst + part_size].fill(0);
        }
        Ok(())
    }
}

//! Read planner for a single slice.
//!
//! The planner is prepared with a slice type, the list of requested parts
//! and the parts currently readable in the system. If every requested part
//! is available the plan reads them directly and schedules spare parts in
//! later waves for anticipated recovery. If some requested part is missing,
//! enough parts for recovery go into the first wave instead.
//!
//! Candidates are sorted stably by descending chunkserver score, so equal
//! scores keep the master-reported order.

use lfs_api_types::{ChunkPartType, SliceType, LFS_BLOCK_SIZE, MAX_EC_PARTS};

use crate::read_plan::{PlannedOperation, PostOp, ReadOperation, ReadPlan, RequestedPart};

/// Wave size for operations beyond the first wave.
const EXTRA_WAVE_SIZE: usize = 2;

pub const DEFAULT_BANDWIDTH_OVERUSE: f32 = 1.25;

#[derive(Clone, Copy, Debug)]
struct WeightedPart {
    score: f32,
    part: ChunkPartType,
    location: usize,
}

#[derive(Default)]
pub struct SliceReadPlanner {
    slice_type: Option<SliceType>,
    slice_parts: Vec<u8>,
    weighted_parts: Vec<WeightedPart>,
    bandwidth_overuse: f32,
    chunk_length: u64,
    can_read: bool,
    required_parts_available: bool,
    part_indices: [i32; MAX_EC_PARTS],
}

impl SliceReadPlanner {
    pub fn new() -> Self {
        SliceReadPlanner {
            bandwidth_overuse: DEFAULT_BANDWIDTH_OVERUSE,
            ..Default::default()
        }
    }

    pub fn with_bandwidth_overuse(mut self, factor: f32) -> Self {
        self.bandwidth_overuse = factor.max(1.0);
        self
    }

    /// Prepare for reading `slice_parts` of `slice_type`, given the parts
    /// `available` (duplicates denote replicas on different servers; the
    /// position in the slice doubles as the location index handed back in
    /// the plan). `scores` carries one chunkserver reliability score per
    /// available part; an empty slice defaults every candidate to 1.0.
    pub fn prepare(
        &mut self,
        slice_type: SliceType,
        slice_parts: &[u8],
        available: &[ChunkPartType],
        scores: &[f32],
        chunk_length: u64,
    ) {
        self.slice_type = Some(slice_type);
        self.slice_parts = slice_parts.to_vec();
        self.chunk_length = chunk_length;
        self.weighted_parts.clear();
        self.can_read = false;
        self.required_parts_available = false;

        let mut distinct = [false; MAX_EC_PARTS];
        for (location, part) in available.iter().enumerate() {
            if part.slice_type() != slice_type {
                continue;
            }
            distinct[part.index() as usize] = true;
            let score = scores.get(location).copied().unwrap_or(1.0);
            self.weighted_parts.push(WeightedPart {
                score,
                part: *part,
                location,
            });
        }

        self.required_parts_available = self
            .slice_parts
            .iter()
            .all(|part| distinct[*part as usize]);
        let can_recover = distinct.iter().filter(|have| **have).count()
            >= slice_type.required_parts_to_recover();
        self.can_read = self.required_parts_available || can_recover;

        if !self.can_read {
            self.weighted_parts.clear();
            return;
        }

        self.weighted_parts
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    }

    pub fn is_reading_possible(&self) -> bool {
        self.can_read
    }

    fn request_size(&self, part: ChunkPartType, first_block: u32, block_count: u32) -> u32 {
        let blocks = part.block_count(self.chunk_length);
        LFS_BLOCK_SIZE * blocks.saturating_sub(first_block).min(block_count)
    }

    /// Append up to `parts_count` operations from the candidate list. The
    /// requested parts land at their fixed buffer slots, additional parts at
    /// consecutive offsets in the scratch region. Returns the next scratch
    /// offset.
    fn add_parts(
        &self,
        plan: &mut ReadPlan,
        first_block: u32,
        block_count: u32,
        parts_count: usize,
        wave: u32,
        mut buffer_offset: u32,
    ) -> u32 {
        let start = plan.read_operations.len();
        let end = (start + parts_count).min(self.weighted_parts.len());

        for candidate in &self.weighted_parts[start..end] {
            let mut operation = ReadOperation {
                request_offset: first_block * LFS_BLOCK_SIZE,
                request_size: self.request_size(candidate.part, first_block, block_count),
                buffer_offset: 0,
                wave,
            };
            let index = self.part_indices[candidate.part.index() as usize];
            if index < 0 {
                operation.buffer_offset = buffer_offset;
                buffer_offset += block_count * LFS_BLOCK_SIZE;
            } else {
                operation.buffer_offset = index as u32 * block_count * LFS_BLOCK_SIZE;
            }
            plan.read_operations.push(PlannedOperation {
                part: candidate.part,
                location: candidate.location,
                op: operation,
            });
        }

        plan.read_buffer_size = buffer_offset;
        buffer_offset
    }

    fn add_basic_parts(
        &self,
        plan: &mut ReadPlan,
        first_block: u32,
        block_count: u32,
        parts_count: usize,
    ) -> u32 {
        let buffer_offset = plan.requested_parts.len() as u32 * plan.buffer_part_size;
        self.add_parts(plan, first_block, block_count, parts_count, 0, buffer_offset)
    }

    /// Queue the remaining candidates into later waves of
    /// [EXTRA_WAVE_SIZE], so the executor only opens more sockets when the
    /// first wave misses its deadline.
    fn add_extra_parts(
        &self,
        plan: &mut ReadPlan,
        first_block: u32,
        block_count: u32,
        mut buffer_offset: u32,
    ) -> u32 {
        let mut wave = 1;
        while plan.read_operations.len() < self.weighted_parts.len() {
            let parts_count =
                EXTRA_WAVE_SIZE.min(self.weighted_parts.len() - plan.read_operations.len());
            buffer_offset =
                self.add_parts(plan, first_block, block_count, parts_count, wave, buffer_offset);
            wave += 1;
        }
        buffer_offset
    }

    /// Number of operations fired in wave 0: the bandwidth overuse factor
    /// rounded up, so a factor of 1.25 with one required part already opens
    /// a second socket.
    fn first_wave_size(&self) -> usize {
        let slice_type = self.slice_type.expect("planner is prepared");
        let base = if self.required_parts_available {
            self.slice_parts.len()
        } else {
            slice_type.required_parts_to_recover()
        };
        (self.bandwidth_overuse * base as f32).ceil() as usize
    }

    /// Build a plan for blocks `[first_block, first_block + block_count)` of
    /// every requested part.
    pub fn build_plan_for(&mut self, first_block: u32, block_count: u32) -> ReadPlan {
        let slice_type = self.slice_type.expect("planner is prepared");
        let mut plan = ReadPlan::new(slice_type);
        plan.buffer_part_size = block_count * LFS_BLOCK_SIZE;

        self.part_indices = [-1; MAX_EC_PARTS];
        for (index, part) in self.slice_parts.iter().enumerate() {
            let part_type = ChunkPartType::new(slice_type, *part).expect("validated part index");
            plan.requested_parts.push(RequestedPart {
                part: *part,
                size: self.request_size(part_type, first_block, block_count),
            });
            self.part_indices[*part as usize] = index as i32;
        }

        let first_wave = self.first_wave_size();
        let offset = if self.required_parts_available {
            // requested parts first, spare candidates keep their score order
            let requested = &self.part_indices;
            self.weighted_parts
                .sort_by_key(|candidate| requested[candidate.part.index() as usize] < 0);
            self.add_basic_parts(&mut plan, first_block, block_count, first_wave)
        } else {
            self.add_basic_parts(&mut plan, first_block, block_count, first_wave)
        };
        self.add_extra_parts(&mut plan, first_block, block_count, offset);

        plan.post_ops.push(PostOp::ZeroPad);
        match slice_type {
            SliceType::Xor(_) => plan.post_ops.push(PostOp::XorRecover),
            SliceType::Ec(k, m) => plan.post_ops.push(PostOp::EcRecover {
                data_parts: k,
                parity_parts: m,
            }),
            SliceType::Standard | SliceType::Tape => {}
        }

        plan
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lfs_api_types::LFS_BLOCK_SIZE as BLOCK;

    fn part(stype: SliceType, index: u8) -> ChunkPartType {
        ChunkPartType::new(stype, index).unwrap()
    }

    fn ops_in_wave(plan: &ReadPlan, wave: u32) -> Vec<usize> {
        plan.read_operations
            .iter()
            .filter(|operation| operation.op.wave == wave)
            .map(|operation| operation.location)
            .collect()
    }

    #[test]
    fn plain_read_with_single_part() {
        // spec scenario: standard chunk, two blocks, read the first block
        let stype = SliceType::Standard;
        let mut planner = SliceReadPlanner::new();
        planner.prepare(stype, &[0], &[part(stype, 0)], &[], 131072);
        assert!(planner.is_reading_possible());

        let plan = planner.build_plan_for(0, 1);
        assert_eq!(plan.read_operations.len(), 1);
        let operation = &plan.read_operations[0];
        assert_eq!(operation.op.wave, 0);
        assert_eq!(operation.op.request_size, BLOCK);
        assert_eq!(operation.op.buffer_offset, 0);
        assert_eq!(plan.result_size(), BLOCK as usize);
    }

    #[test]
    fn replicated_read_fires_extra_candidate_in_first_wave() {
        // three replicas with scores 1.0 / 1.0 / 0.5 and overuse 1.25:
        // wave 0 goes to the two best servers, the slow one waits in wave 1
        let stype = SliceType::Standard;
        let mut planner = SliceReadPlanner::new();
        let replicas = [part(stype, 0), part(stype, 0), part(stype, 0)];
        planner.prepare(stype, &[0], &replicas, &[1.0, 1.0, 0.5], 65536);

        let plan = planner.build_plan_for(0, 1);
        assert_eq!(ops_in_wave(&plan, 0), vec![0, 1]);
        assert_eq!(ops_in_wave(&plan, 1), vec![2]);
        // replicas of the requested part all write into its buffer slot
        assert!(plan
            .read_operations
            .iter()
            .all(|operation| operation.op.buffer_offset == 0));
    }

    #[test]
    fn missing_part_triggers_recovery_plan() {
        // xor2 with data part 1 missing: wave 0 reads data part 0 + parity
        let stype = SliceType::Xor(2);
        let available = [part(stype, 1), part(stype, 0)];
        let mut planner = SliceReadPlanner::new();
        planner.prepare(stype, &[2], &available, &[], 2 * BLOCK as u64);
        assert!(planner.is_reading_possible());

        let plan = planner.build_plan_for(0, 1);
        assert_eq!(ops_in_wave(&plan, 0).len(), 2);
        assert_eq!(plan.post_ops, vec![PostOp::ZeroPad, PostOp::XorRecover]);
        // all operations are distinct parts in the scratch region
        assert!(plan
            .read_operations
            .iter()
            .all(|operation| operation.op.buffer_offset >= plan.buffer_part_size));
    }

    #[test]
    fn ec_recovery_uses_any_k_parts() {
        // ec(3,2) with two parts gone: the three remaining ones are planned
        let stype = SliceType::Ec(3, 2);
        let available = [part(stype, 0), part(stype, 3), part(stype, 4)];
        let mut planner = SliceReadPlanner::new();
        planner.prepare(stype, &[1], &available, &[], 5 * BLOCK as u64);
        assert!(planner.is_reading_possible());

        let plan = planner.build_plan_for(0, 1);
        assert_eq!(plan.read_operations.len(), 3);
        assert_eq!(ops_in_wave(&plan, 0).len(), 3);
        assert_eq!(
            plan.post_ops,
            vec![
                PostOp::ZeroPad,
                PostOp::EcRecover {
                    data_parts: 3,
                    parity_parts: 2
                }
            ]
        );
    }

    #[test]
    fn infeasible_read_is_refused_at_construction() {
        // |available| = K - 1 must be rejected by prepare, not at runtime
        let stype = SliceType::Ec(3, 2);
        let available = [part(stype, 0), part(stype, 4)];
        let mut planner = SliceReadPlanner::new();
        planner.prepare(stype, &[1], &available, &[], 5 * BLOCK as u64);
        assert!(!planner.is_reading_possible());
    }

    #[test]
    fn direct_plan_prefers_requested_parts_in_wave_zero() {
        let stype = SliceType::Xor(2);
        let available = [part(stype, 0), part(stype, 1), part(stype, 2)];
        let mut planner = SliceReadPlanner::new();
        planner.prepare(stype, &[1, 2], &available, &[], 4 * BLOCK as u64);

        let plan = planner.build_plan_for(0, 2);
        let wave0: Vec<_> = plan
            .read_operations
            .iter()
            .filter(|operation| operation.op.wave == 0)
            .map(|operation| operation.part.index())
            .collect();
        // ceil(1.25 * 2) = 3: both requested parts plus the parity spare
        assert_eq!(wave0, vec![1, 2, 0]);

        // requested parts sit at their fixed slots
        for operation in &plan.read_operations {
            match operation.part.index() {
                1 => assert_eq!(operation.op.buffer_offset, 0),
                2 => assert_eq!(operation.op.buffer_offset, plan.buffer_part_size),
                _ => assert!(operation.op.buffer_offset >= 2 * plan.buffer_part_size),
            }
        }
    }

    #[test]
    fn all_planned_parts_are_distinct_for_striped_slices() {
        let stype = SliceType::Ec(4, 2);
        let available: Vec<_> = (0..6).map(|index| part(stype, index)).collect();
        let mut planner = SliceReadPlanner::new();
        planner.prepare(stype, &[0, 1, 2, 3], &available, &[], 8 * BLOCK as u64);

        let plan = planner.build_plan_for(0, 2);
        let mut seen = std::collections::HashSet::new();
        for operation in &plan.read_operations {
            assert!(seen.insert(operation.part.index()));
        }
        // no wave is empty up to the last used wave
        let max_wave = plan
            .read_operations
            .iter()
            .map(|operation| operation.op.wave)
            .max()
            .unwrap();
        for wave in 0..=max_wave {
            assert!(!ops_in_wave(&plan, wave).is_empty());
        }
    }
}

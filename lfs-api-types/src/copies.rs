//! Chunk copies calculator.
//!
//! Given the multiset of parts currently stored for a chunk, computes how
//! many whole logical chunks are reconstructible, how many further part
//! losses the chunk survives, and the resulting availability state. The
//! master's replication scheduler and the admin `chunks-health` report are
//! both fed from these numbers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::goal::{Goal, GoalId, MediaLabel};
use crate::slice::{ChunkPartType, SliceType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityState {
    /// Fully recoverable and at least one extra part loss is survivable.
    Safe,
    /// Recoverable, but one more lost part may make it unrecoverable.
    Endangered,
    /// Not recoverable from the remaining parts.
    Lost,
}

#[derive(Clone, Debug, Default)]
pub struct ChunkCopiesCalculator {
    available: Vec<(ChunkPartType, MediaLabel)>,
}

impl ChunkCopiesCalculator {
    pub fn new(available: Vec<(ChunkPartType, MediaLabel)>) -> Self {
        ChunkCopiesCalculator { available }
    }

    pub fn add_part(&mut self, part: ChunkPartType, label: MediaLabel) {
        self.available.push((part, label));
    }

    /// Distinct part count per slice type.
    fn distinct_parts(&self) -> BTreeMap<SliceType, Vec<u8>> {
        let mut map: BTreeMap<SliceType, Vec<u8>> = BTreeMap::new();
        for (part, _) in &self.available {
            let indices = map.entry(part.slice_type()).or_default();
            if !indices.contains(&part.index()) {
                indices.push(part.index());
            }
        }
        map
    }

    /// Number of whole logical chunks reconstructible from the available
    /// parts. Every standard part counts as one copy; a striped slice counts
    /// as one copy once enough of its distinct parts exist.
    pub fn full_copies(&self) -> u32 {
        let mut copies = 0;
        for (stype, indices) in self.distinct_parts() {
            if stype.is_standard() {
                // duplicates of the single standard part are separate copies
                copies += self
                    .available
                    .iter()
                    .filter(|(part, _)| part.slice_type() == stype)
                    .count() as u32;
            } else if indices.len() >= stype.required_parts_to_recover() {
                copies += 1;
            }
        }
        copies
    }

    /// How many further part losses the chunk survives. An adversary has to
    /// push every recoverable slice below its recovery threshold, so the
    /// surpluses of all slices add up.
    pub fn redundancy_level(&self) -> i32 {
        let mut kill_cost: i64 = 0;
        for (stype, indices) in self.distinct_parts() {
            if stype.is_standard() {
                kill_cost += self
                    .available
                    .iter()
                    .filter(|(part, _)| part.slice_type() == stype)
                    .count() as i64;
            } else if indices.len() >= stype.required_parts_to_recover() {
                kill_cost += (indices.len() - stype.required_parts_to_recover()) as i64 + 1;
            }
        }
        (kill_cost - 1).clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    pub fn availability_state(&self) -> AvailabilityState {
        match self.redundancy_level() {
            level if level < 0 => AvailabilityState::Lost,
            0 => AvailabilityState::Endangered,
            _ => AvailabilityState::Safe,
        }
    }

    /// Copies still missing relative to `goal`, honoring media labels.
    /// Wildcard requirements are satisfied by any leftover part.
    pub fn missing_copies(&self, goal: &Goal) -> u32 {
        let mut missing = 0;
        for slice in goal.slices() {
            for (index, labels) in slice.parts().iter().enumerate() {
                let mut stored: Vec<&MediaLabel> = self
                    .available
                    .iter()
                    .filter(|(part, _)| {
                        part.slice_type() == slice.slice_type() && part.index() as usize == index
                    })
                    .map(|(_, label)| label)
                    .collect();

                // labeled requirements consume matching parts first
                for (wanted, count) in labels.iter().filter(|(label, _)| !label.is_wildcard()) {
                    let mut needed = *count as u32;
                    stored.retain(|label| {
                        if needed > 0 && *label == wanted {
                            needed -= 1;
                            false
                        } else {
                            true
                        }
                    });
                    missing += needed;
                }
                for (_, count) in labels.iter().filter(|(label, _)| label.is_wildcard()) {
                    let needed = (*count as u32).saturating_sub(stored.len() as u32);
                    let consumed = (*count as u32 - needed) as usize;
                    stored.drain(..consumed);
                    missing += needed;
                }
            }
        }
        missing
    }
}

/// Per-goal counters of chunk availability, aggregated by the master.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunksAvailabilityState {
    safe: BTreeMap<u8, u64>,
    endangered: BTreeMap<u8, u64>,
    lost: BTreeMap<u8, u64>,
}

impl ChunksAvailabilityState {
    pub fn add_chunk(&mut self, goal: GoalId, state: AvailabilityState) {
        let counters = match state {
            AvailabilityState::Safe => &mut self.safe,
            AvailabilityState::Endangered => &mut self.endangered,
            AvailabilityState::Lost => &mut self.lost,
        };
        *counters.entry(goal.value()).or_default() += 1;
    }

    pub fn safe_chunks(&self, goal: GoalId) -> u64 {
        self.safe.get(&goal.value()).copied().unwrap_or(0)
    }

    pub fn endangered_chunks(&self, goal: GoalId) -> u64 {
        self.endangered.get(&goal.value()).copied().unwrap_or(0)
    }

    pub fn lost_chunks(&self, goal: GoalId) -> u64 {
        self.lost.get(&goal.value()).copied().unwrap_or(0)
    }
}

/// Per-goal histogram of chunks by number of missing/excess copies.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunksReplicationState {
    to_replicate: BTreeMap<u8, BTreeMap<u32, u64>>,
    to_delete: BTreeMap<u8, BTreeMap<u32, u64>>,
}

impl ChunksReplicationState {
    /// Caps the histogram column like the original report.
    pub const MAX_TRACKED: u32 = 10;

    pub fn add_chunk(&mut self, goal: GoalId, missing: u32, excess: u32) {
        let missing = missing.min(Self::MAX_TRACKED);
        let excess = excess.min(Self::MAX_TRACKED);
        *self
            .to_replicate
            .entry(goal.value())
            .or_default()
            .entry(missing)
            .or_default() += 1;
        *self
            .to_delete
            .entry(goal.value())
            .or_default()
            .entry(excess)
            .or_default() += 1;
    }

    pub fn chunks_to_replicate(&self, goal: GoalId, missing: u32) -> u64 {
        self.to_replicate
            .get(&goal.value())
            .and_then(|histogram| histogram.get(&missing))
            .copied()
            .unwrap_or(0)
    }

    pub fn chunks_to_delete(&self, goal: GoalId, excess: u32) -> u64 {
        self.to_delete
            .get(&goal.value())
            .and_then(|histogram| histogram.get(&excess))
            .copied()
            .unwrap_or(0)
    }
}

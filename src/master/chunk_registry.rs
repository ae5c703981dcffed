//! The master's authoritative chunk state.
//!
//! Maps inodes to chunk lists and chunks to their part locations, mints
//! write locks, and aggregates the health counters served to the admin
//! tool. All mutation happens under one lock held by the server; handlers
//! never block while holding it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use lfs_api_types::{
    ChunkCopiesCalculator, ChunkPartType, ChunksAvailabilityState, ChunksReplicationState, Goal,
    GoalId, LizError, MediaLabel, SliceType,
};
use lfs_protocol::{
    ChunkserverAddress, ChunkserverListEntry, GoalAvailability, GoalReplication, MasterInfo,
    OwnedPart, PartLocation, SerializedGoal,
};

pub const MASTER_VERSION: u32 = 0x030d01;

/// Standard replicas placed for a freshly allocated chunk. The replication
/// scheduler later converges chunks towards their goals.
const DEFAULT_CHUNK_COPIES: usize = 2;

#[derive(Clone, Debug)]
pub struct ChunkserverState {
    pub address: ChunkserverAddress,
    pub label: MediaLabel,
    pub version: u32,
    pub used_space: u64,
    pub total_space: u64,
    pub chunks: u64,
    pub error_counter: u32,
}

#[derive(Clone, Debug, Serialize)]
struct PartRecord {
    part_type: ChunkPartType,
    #[serde(skip)]
    server: ChunkserverAddress,
    label: String,
}

#[derive(Clone, Copy, Debug, Serialize)]
struct WriteLock {
    lock_id: u32,
    #[serde(skip)]
    granted_at: Option<Instant>,
}

#[derive(Clone, Debug, Serialize)]
struct ChunkRecord {
    chunk_id: u64,
    version: u32,
    owner: u32,
    parts: Vec<PartRecord>,
    lock: Option<WriteLock>,
}

#[derive(Clone, Debug, Default, Serialize)]
struct FileRecord {
    length: u64,
    goal: u8,
    chunks: Vec<u64>,
}

/// A write grant as handed to the reply serializer.
pub struct WriteLease {
    pub file_length: u64,
    pub chunk_id: u64,
    pub chunk_version: u32,
    pub lock_id: u32,
    pub locations: Vec<PartLocation>,
}

pub struct ChunkRegistry {
    chunkservers: HashMap<ChunkserverAddress, ChunkserverState>,
    chunks: HashMap<u64, ChunkRecord>,
    files: HashMap<u32, FileRecord>,
    next_chunk_id: u64,
    next_lock_id: u32,
    metadata_version: u64,
    lock_timeout: Duration,
    default_goal: GoalId,
    started_at: Instant,
}

impl ChunkRegistry {
    pub fn new(lock_timeout: Duration, default_goal: GoalId) -> Self {
        ChunkRegistry {
            chunkservers: HashMap::new(),
            chunks: HashMap::new(),
            files: HashMap::new(),
            next_chunk_id: 1,
            next_lock_id: 1,
            metadata_version: 1,
            lock_timeout,
            default_goal,
            started_at: Instant::now(),
        }
    }

    pub fn metadata_version(&self) -> u64 {
        self.metadata_version
    }

    fn bump(&mut self) {
        self.metadata_version += 1;
    }

    // ---- chunkserver registration ----

    pub fn register_chunkserver(&mut self, state: ChunkserverState) {
        self.chunkservers.insert(state.address, state);
        self.bump();
    }

    pub fn update_space(&mut self, address: ChunkserverAddress, used: u64, total: u64) {
        if let Some(server) = self.chunkservers.get_mut(&address) {
            server.used_space = used;
            server.total_space = total;
        }
    }

    /// Adopt parts an already registered chunkserver reports. Parts of
    /// unknown chunks create chunk records owned by no file; parts with a
    /// stale version are refused.
    pub fn register_parts(
        &mut self,
        address: ChunkserverAddress,
        parts: &[OwnedPart],
    ) -> Result<(), LizError> {
        let label = self
            .chunkservers
            .get(&address)
            .map(|server| server.label.clone())
            .ok_or(LizError::BadRequest)?;

        for owned in parts {
            let record = self
                .chunks
                .entry(owned.chunk_id)
                .or_insert_with(|| ChunkRecord {
                    chunk_id: owned.chunk_id,
                    version: owned.version,
                    owner: 0,
                    parts: Vec::new(),
                    lock: None,
                });
            if owned.version != record.version {
                continue;
            }
            record
                .parts
                .retain(|part| !(part.server == address && part.part_type == owned.part_type));
            record.parts.push(PartRecord {
                part_type: owned.part_type,
                server: address,
                label: label.as_str().to_string(),
            });
        }
        if let Some(server) = self.chunkservers.get_mut(&address) {
            server.chunks = self
                .chunks
                .values()
                .filter(|chunk| chunk.parts.iter().any(|part| part.server == address))
                .count() as u64;
        }
        self.bump();
        Ok(())
    }

    // ---- client chunk operations ----

    fn locations(&self, record: &ChunkRecord) -> Vec<PartLocation> {
        record
            .parts
            .iter()
            .filter_map(|part| {
                let label = MediaLabel::new(&part.label).ok()?;
                Some(PartLocation {
                    part_type: part.part_type,
                    address: part.server,
                    label,
                })
            })
            .collect()
    }

    /// Resolve `(inode, chunk_index)` for reading.
    pub fn read_chunk(
        &self,
        inode: u32,
        chunk_index: u32,
    ) -> Result<(u64, u64, u32, Vec<PartLocation>), LizError> {
        let file = self.files.get(&inode).ok_or(LizError::NoSuchInode)?;
        let chunk_id = *file
            .chunks
            .get(chunk_index as usize)
            .ok_or(LizError::NoSuchChunk)?;
        let record = self.chunks.get(&chunk_id).ok_or(LizError::NoSuchChunk)?;
        Ok((
            file.length,
            record.chunk_id,
            record.version,
            self.locations(record),
        ))
    }

    fn lock_expired(&self, lock: &WriteLock) -> bool {
        match lock.granted_at {
            Some(granted_at) => granted_at.elapsed() >= self.lock_timeout,
            None => false,
        }
    }

    /// Open `(inode, chunk_index)` for writing.
    ///
    /// The call is idempotent on retry: while a lock is outstanding,
    /// presenting its id returns the identical lease; presenting anything
    /// else is refused. Opening a settled chunk bumps its version and mints
    /// a fresh lock.
    pub fn write_chunk(
        &mut self,
        inode: u32,
        chunk_index: u32,
        prev_lock_id: u32,
    ) -> Result<WriteLease, LizError> {
        let default_goal = self.default_goal.value();
        let file = self.files.entry(inode).or_insert_with(|| FileRecord {
            goal: default_goal,
            ..Default::default()
        });
        if (chunk_index as usize) > file.chunks.len() {
            // writes fill chunks in order; a gap means a truncated file
            return Err(LizError::NoSuchChunk);
        }

        if (chunk_index as usize) == file.chunks.len() {
            let parts = self.allocate_standard_parts()?;
            let chunk_id = self.next_chunk_id;
            self.next_chunk_id += 1;
            self.files.get_mut(&inode).unwrap().chunks.push(chunk_id);

            let lock_id = self.mint_lock_id();
            let record = ChunkRecord {
                chunk_id,
                version: 1,
                owner: inode,
                parts,
                lock: Some(WriteLock {
                    lock_id,
                    granted_at: Some(Instant::now()),
                }),
            };
            let lease = WriteLease {
                file_length: self.files[&inode].length,
                chunk_id,
                chunk_version: record.version,
                lock_id,
                locations: self.locations(&record),
            };
            self.chunks.insert(chunk_id, record);
            self.bump();
            return Ok(lease);
        }

        let chunk_id = file.chunks[chunk_index as usize];
        let file_length = file.length;
        let record = self.chunks.get(&chunk_id).ok_or(LizError::NoSuchChunk)?;

        if let Some(lock) = record.lock {
            if !self.lock_expired(&lock) {
                if lock.lock_id == prev_lock_id {
                    let record = &self.chunks[&chunk_id];
                    return Ok(WriteLease {
                        file_length,
                        chunk_id,
                        chunk_version: record.version,
                        lock_id: lock.lock_id,
                        locations: self.locations(record),
                    });
                }
                return Err(LizError::TryAgain);
            }
        }

        let lock_id = self.mint_lock_id();
        let record = self.chunks.get_mut(&chunk_id).unwrap();
        record.version += 1;
        record.lock = Some(WriteLock {
            lock_id,
            granted_at: Some(Instant::now()),
        });
        let version = record.version;
        let locations = self.locations(&self.chunks[&chunk_id]);
        self.bump();
        Ok(WriteLease {
            file_length,
            chunk_id,
            chunk_version: version,
            lock_id,
            locations,
        })
    }

    /// Commit a write: validate the lock, persist the length, release.
    pub fn write_chunk_end(
        &mut self,
        chunk_id: u64,
        lock_id: u32,
        inode: u32,
        file_length: u64,
    ) -> Result<(), LizError> {
        let record = self.chunks.get_mut(&chunk_id).ok_or(LizError::NoSuchChunk)?;
        match record.lock {
            Some(lock) if lock.lock_id == lock_id => {}
            _ => return Err(LizError::WrongLock),
        }
        record.lock = None;

        let file = self.files.get_mut(&inode).ok_or(LizError::NoSuchInode)?;
        file.length = file.length.max(file_length);
        self.bump();
        Ok(())
    }

    pub fn purge_expired_locks(&mut self) {
        let timeout = self.lock_timeout;
        for record in self.chunks.values_mut() {
            if let Some(lock) = record.lock {
                if lock
                    .granted_at
                    .map(|granted_at| granted_at.elapsed() >= timeout)
                    .unwrap_or(false)
                {
                    record.lock = None;
                }
            }
        }
    }

    fn mint_lock_id(&mut self) -> u32 {
        let lock_id = self.next_lock_id;
        self.next_lock_id = self.next_lock_id.wrapping_add(1).max(1);
        lock_id
    }

    /// Place standard replicas for a fresh chunk: the least used servers
    /// first, as many as the default goal expects.
    fn allocate_standard_parts(&self) -> Result<Vec<PartRecord>, LizError> {
        if self.chunkservers.is_empty() {
            return Err(LizError::TryAgain);
        }
        let mut servers: Vec<&ChunkserverState> = self.chunkservers.values().collect();
        servers.sort_by_key(|server| (server.used_space, server.address));

        let copies = DEFAULT_CHUNK_COPIES.min(servers.len());
        let part_type = ChunkPartType::new(SliceType::Standard, 0).expect("valid part");
        Ok(servers
            .into_iter()
            .take(copies)
            .map(|server| PartRecord {
                part_type,
                server: server.address,
                label: server.label.as_str().to_string(),
            })
            .collect())
    }

    // ---- admin reporting ----

    pub fn info(&self) -> MasterInfo {
        let chunk_copies: u64 = self
            .chunks
            .values()
            .map(|chunk| chunk.parts.len() as u64)
            .sum();
        MasterInfo {
            version: MASTER_VERSION,
            memory_usage: (self.chunks.len() * std::mem::size_of::<ChunkRecord>()
                + self.files.len() * std::mem::size_of::<FileRecord>())
                as u64,
            total_space: self.chunkservers.values().map(|s| s.total_space).sum(),
            available_space: self
                .chunkservers
                .values()
                .map(|s| s.total_space.saturating_sub(s.used_space))
                .sum(),
            file_nodes: self.files.len() as u64,
            chunks: self.chunks.len() as u64,
            chunk_copies,
            regular_copies: chunk_copies,
        }
    }

    pub fn chunkserver_list(&self) -> Vec<ChunkserverListEntry> {
        let mut list: Vec<ChunkserverListEntry> = self
            .chunkservers
            .values()
            .map(|server| ChunkserverListEntry {
                version: server.version,
                address: server.address,
                label: server.label.clone(),
                chunks: server.chunks,
                used_space: server.used_space,
                total_space: server.total_space,
                error_counter: server.error_counter,
            })
            .collect();
        list.sort_by_key(|entry| entry.address);
        list
    }

    /// Walk all chunks and classify them against their goals.
    pub fn chunks_health(
        &self,
        goals: &[(GoalId, Goal)],
    ) -> (Vec<GoalAvailability>, Vec<GoalReplication>) {
        let mut availability = ChunksAvailabilityState::default();
        let mut replication = ChunksReplicationState::default();

        for chunk in self.chunks.values() {
            let goal_id = self
                .files
                .get(&chunk.owner)
                .and_then(|file| GoalId::new(file.goal).ok())
                .unwrap_or(self.default_goal);
            let goal = goals
                .iter()
                .find(|(id, _)| *id == goal_id)
                .map(|(_, goal)| goal);

            let calculator = ChunkCopiesCalculator::new(
                chunk
                    .parts
                    .iter()
                    .filter_map(|part| {
                        MediaLabel::new(&part.label)
                            .ok()
                            .map(|label| (part.part_type, label))
                    })
                    .collect(),
            );
            availability.add_chunk(goal_id, calculator.availability_state());

            if let Some(goal) = goal {
                let missing = calculator.missing_copies(goal);
                let expected = goal.expected_copies();
                let excess = (chunk.parts.len() as u32).saturating_sub(expected);
                replication.add_chunk(goal_id, missing, excess);
            }
        }

        let availability = goals
            .iter()
            .map(|(id, _)| GoalAvailability {
                goal_id: id.value(),
                safe: availability.safe_chunks(*id),
                endangered: availability.endangered_chunks(*id),
                lost: availability.lost_chunks(*id),
            })
            .collect();
        let replication = goals
            .iter()
            .map(|(id, _)| {
                let mut to_replicate = 0;
                let mut to_delete = 0;
                for count in 1..=ChunksReplicationState::MAX_TRACKED {
                    to_replicate += replication.chunks_to_replicate(*id, count);
                    to_delete += replication.chunks_to_delete(*id, count);
                }
                GoalReplication {
                    goal_id: id.value(),
                    to_replicate,
                    to_delete,
                }
            })
            .collect();
        (availability, replication)
    }

    pub fn goal_list(&self, goals: &[(GoalId, Goal)]) -> Vec<SerializedGoal> {
        goals
            .iter()
            .map(|(id, goal)| SerializedGoal {
                id: id.value(),
                name: goal.name().to_string(),
                definition: goal.to_string(),
            })
            .collect()
    }

    /// Serialize the registry for `save-metadata`.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "metadata_version": self.metadata_version,
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "files": self.files,
            "chunks": self.chunks.values().collect::<Vec<_>>(),
        })
    }

}

#[cfg(test)]
mod test {
    use super::*;

    fn registry_with_servers(count: u16) -> ChunkRegistry {
        let mut registry =
            ChunkRegistry::new(Duration::from_secs(60), GoalId::new(1).unwrap());
        for index in 0..count {
            registry.register_chunkserver(ChunkserverState {
                address: ChunkserverAddress {
                    ip: 0x7f000001,
                    port: 9422 + index,
                },
                label: MediaLabel::new("hdd").unwrap(),
                version: MASTER_VERSION,
                used_space: index as u64,
                total_space: 1 << 40,
                chunks: 0,
                error_counter: 0,
            });
        }
        registry
    }

    #[test]
    fn write_open_allocates_chunk_and_lock() {
        let mut registry = registry_with_servers(3);
        let lease = registry.write_chunk(36, 0, 0).unwrap();
        assert_eq!(lease.chunk_version, 1);
        assert!(lease.lock_id != 0);
        assert_eq!(lease.locations.len(), 2);

        registry
            .write_chunk_end(lease.chunk_id, lease.lock_id, 36, 4096)
            .unwrap();
        let (length, chunk_id, version, locations) = registry.read_chunk(36, 0).unwrap();
        assert_eq!(length, 4096);
        assert_eq!(chunk_id, lease.chunk_id);
        assert_eq!(version, 1);
        assert!(!locations.is_empty());
    }

    #[test]
    fn write_retry_with_same_lock_is_idempotent() {
        let mut registry = registry_with_servers(2);
        let first = registry.write_chunk(36, 0, 0).unwrap();
        let retry = registry.write_chunk(36, 0, first.lock_id).unwrap();
        assert_eq!(retry.chunk_id, first.chunk_id);
        assert_eq!(retry.lock_id, first.lock_id);
        assert_eq!(retry.chunk_version, first.chunk_version);
    }

    #[test]
    fn conflicting_writer_is_refused_while_lock_is_held() {
        let mut registry = registry_with_servers(2);
        let first = registry.write_chunk(36, 0, 0).unwrap();
        assert_eq!(
            registry.write_chunk(36, 0, 0).unwrap_err(),
            LizError::TryAgain
        );

        // a stale lock id on commit is rejected as well
        assert_eq!(
            registry
                .write_chunk_end(first.chunk_id, first.lock_id + 1, 36, 10)
                .unwrap_err(),
            LizError::WrongLock
        );
    }

    #[test]
    fn reopening_a_settled_chunk_bumps_the_version() {
        let mut registry = registry_with_servers(2);
        let first = registry.write_chunk(36, 0, 0).unwrap();
        registry
            .write_chunk_end(first.chunk_id, first.lock_id, 36, 100)
            .unwrap();

        let second = registry.write_chunk(36, 0, 0).unwrap();
        assert_eq!(second.chunk_id, first.chunk_id);
        assert_eq!(second.chunk_version, first.chunk_version + 1);
        assert!(second.lock_id != first.lock_id);
    }

    #[test]
    fn read_of_unknown_inode_or_chunk_fails() {
        let registry = registry_with_servers(1);
        assert_eq!(registry.read_chunk(1, 0).unwrap_err(), LizError::NoSuchInode);

        let mut registry = registry_with_servers(1);
        let lease = registry.write_chunk(1, 0, 0).unwrap();
        registry.write_chunk_end(lease.chunk_id, lease.lock_id, 1, 10).unwrap();
        assert_eq!(registry.read_chunk(1, 5).unwrap_err(), LizError::NoSuchChunk);
    }

    #[test]
    fn expired_locks_are_reclaimed() {
        let mut registry = ChunkRegistry::new(Duration::from_millis(0), GoalId::new(1).unwrap());
        registry.register_chunkserver(ChunkserverState {
            address: ChunkserverAddress {
                ip: 0x7f000001,
                port: 9422,
            },
            label: MediaLabel::new("hdd").unwrap(),
            version: MASTER_VERSION,
            used_space: 0,
            total_space: 1 << 30,
            chunks: 0,
            error_counter: 0,
        });

        let first = registry.write_chunk(36, 0, 0).unwrap();
        // the lock timed out; a new writer takes over with a fresh lock
        let second = registry.write_chunk(36, 0, 0).unwrap();
        assert!(second.lock_id != first.lock_id);
        assert_eq!(second.chunk_version, first.chunk_version + 1);
    }

    #[test]
    fn health_reports_cover_all_goals() {
        let mut registry = registry_with_servers(2);
        let goals = vec![(
            GoalId::new(1).unwrap(),
            "default: std {_ 2}".parse().unwrap(),
        )];
        let lease = registry.write_chunk(36, 0, 0).unwrap();
        registry
            .write_chunk_end(lease.chunk_id, lease.lock_id, 36, 10)
            .unwrap();

        let (availability, replication) = registry.chunks_health(&goals);
        assert_eq!(availability.len(), 1);
        assert_eq!(availability[0].safe, 1);
        assert_eq!(replication[0].to_replicate, 0);
    }
}

//! Per-inode read cache.
//!
//! Extents are keyed by file offset and never overlap. A query acquires a
//! refcount on every covering extent and, for the uncovered tail, inserts a
//! fresh empty extent whose buffer the caller fills after reading from the
//! chunkservers. Expired or empty extents encountered on the way are
//! dropped. Erased extents that are still referenced move to a reserved
//! list and are freed once the last reference is gone.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Extents erased or expired per query, keeping garbage collection cheap.
const GC_BATCH: usize = 4;

pub struct Entry {
    offset: u64,
    buffer: Mutex<Vec<u8>>,
    touched: Mutex<Instant>,
    refcount: AtomicI32,
}

impl Entry {
    fn new(offset: u64) -> Arc<Self> {
        Arc::new(Entry {
            offset,
            buffer: Mutex::new(Vec::new()),
            touched: Mutex::new(Instant::now()),
            refcount: AtomicI32::new(0),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Number of cached bytes; zero while the extent awaits its fill.
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn end_offset(&self) -> u64 {
        self.offset + self.len() as u64
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.touched.lock().unwrap().elapsed() >= ttl
    }

    fn acquire(&self) {
        *self.touched.lock().unwrap() = Instant::now();
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let previous = self.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "releasing an unreferenced cache extent");
    }

    pub fn copy_range(&self, output: &mut [u8], from: usize) -> usize {
        let buffer = self.buffer.lock().unwrap();
        if from >= buffer.len() {
            return 0;
        }
        let length = output.len().min(buffer.len() - from);
        output[..length].copy_from_slice(&buffer[from..from + length]);
        length
    }
}

/// The outcome of a cache query: the covering extents, front to back, with
/// one refcount held on each. The last extent may be empty; the caller reads
/// the missing bytes into it via [CacheResult::fill_input].
pub struct CacheResult {
    entries: Vec<Arc<Entry>>,
    is_fake: bool,
}

impl CacheResult {
    /// Wrap data which does not reside in the cache, so one-shot bypass
    /// reads can be handled like any other result.
    pub fn fake(offset: u64, data: Vec<u8>) -> Self {
        let entry = Entry::new(offset);
        entry.acquire();
        *entry.buffer.lock().unwrap() = data;
        CacheResult {
            entries: vec![entry],
            is_fake: true,
        }
    }

    pub fn is_fake(&self) -> bool {
        self.is_fake
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front_offset(&self) -> u64 {
        self.entries.first().expect("non-empty result").offset
    }

    /// Offset from which data still has to be read from the chunkservers.
    pub fn remaining_offset(&self) -> u64 {
        self.entries.last().expect("non-empty result").offset
    }

    pub fn end_offset(&self) -> u64 {
        self.entries.last().expect("non-empty result").end_offset()
    }

    /// True when the query left an empty tail extent to be filled.
    pub fn needs_fill(&self) -> bool {
        self.entries
            .last()
            .map(|entry| entry.is_empty())
            .unwrap_or(false)
    }

    /// Store the bytes read for the tail extent. Must only be called while
    /// the extent is empty and referenced; afterwards the buffer length is
    /// authoritative (it may be shorter than requested when the backing
    /// chunk is short).
    pub fn fill_input(&self, data: Vec<u8>) {
        let entry = self.entries.last().expect("non-empty result");
        assert!(entry.refcount() > 0);
        let mut buffer = entry.buffer.lock().unwrap();
        assert!(buffer.is_empty(), "filled extents are immutable");
        *buffer = data;
    }

    /// Bytes available for `[offset, offset + size)`, bounded by what the
    /// result covers.
    pub fn request_size(&self, offset: u64, size: u32) -> u32 {
        if self.entries.is_empty() {
            return 0;
        }
        (self.end_offset().saturating_sub(offset)).min(size as u64) as u32
    }

    /// Copy the covered bytes of `[offset, offset + output.len())` into
    /// `output`. Returns the number of bytes copied; the copy stops early at
    /// the end of the file.
    pub fn copy_to_buffer(&self, output: &mut [u8], offset: u64) -> usize {
        let mut position = offset;
        let mut copied = 0;
        for entry in &self.entries {
            if copied == output.len() {
                break;
            }
            // a request past the end of the file hits an extent that stayed
            // short or empty
            if entry.is_empty() || position >= entry.end_offset() {
                break;
            }
            let from = (position - entry.offset) as usize;
            let length = entry.copy_range(&mut output[copied..], from);
            if length == 0 {
                break;
            }
            position += length as u64;
            copied += length;
        }
        copied
    }

    /// Visit the covered bytes of `[offset, offset + size)` as consecutive
    /// slices, the shape an iovec for the FUSE reply is built from. Returns
    /// the number of bytes visited.
    pub fn for_each_segment(
        &self,
        offset: u64,
        size: u32,
        mut visit: impl FnMut(&[u8]),
    ) -> usize {
        let mut position = offset;
        let mut remaining = size as usize;
        for entry in &self.entries {
            if remaining == 0 || entry.is_empty() || position >= entry.end_offset() {
                break;
            }
            let buffer = entry.buffer.lock().unwrap();
            let from = (position - entry.offset) as usize;
            let length = remaining.min(buffer.len() - from);
            visit(&buffer[from..from + length]);
            position += length as u64;
            remaining -= length;
        }
        (position - offset) as usize
    }

    fn add(&mut self, entry: Arc<Entry>) {
        entry.acquire();
        self.entries.push(entry);
    }

    /// Drop all held references.
    pub fn release(&mut self) {
        for entry in &self.entries {
            entry.release();
        }
        self.entries.clear();
    }
}

impl Drop for CacheResult {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct ReadCache {
    entries: BTreeMap<u64, Arc<Entry>>,
    /// Insertion ordered; only inspected from the front.
    lru: VecDeque<Weak<Entry>>,
    reserved: VecDeque<Arc<Entry>>,
    ttl: Duration,
}

impl ReadCache {
    pub fn new(ttl: Duration) -> Self {
        ReadCache {
            entries: BTreeMap::new(),
            lru: VecDeque::new(),
            reserved: VecDeque::new(),
            ttl,
        }
    }

    /// Look up `[offset, offset + size)`. Bytes already cached are covered
    /// by referenced extents; if anything is missing the result ends with a
    /// fresh empty extent to be filled by the caller.
    pub fn query(&mut self, offset: u64, size: u32) -> CacheResult {
        assert!(size > 0);
        self.collect_garbage();

        let mut result = CacheResult {
            entries: Vec::new(),
            is_fake: false,
        };

        let mut position = offset;
        let mut bytes_left = size as u64;

        let start = self
            .entries
            .range(..=offset)
            .next_back()
            .map(|(key, _)| *key)
            .unwrap_or(offset);
        let covering: Vec<u64> = self
            .entries
            .range(start..)
            .map(|(key, _)| *key)
            .collect();

        for key in covering {
            if bytes_left == 0 || position < key {
                break;
            }
            let entry = self.entries[&key].clone();
            if entry.expired(self.ttl) || entry.is_empty() {
                self.erase(key);
                continue;
            }
            if position < entry.end_offset() {
                let from_buffer = (entry.end_offset() - position).min(bytes_left);
                bytes_left -= from_buffer;
                position += from_buffer;
                result.add(entry);
            }
        }

        if bytes_left > 0 {
            let inserted = self.insert(position, bytes_left);
            result.add(inserted);
        }

        result
    }

    pub fn clear(&mut self) {
        let keys: Vec<u64> = self.entries.keys().copied().collect();
        for key in keys {
            self.erase(key);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Insert a fresh empty extent at `offset`, evicting colliding extents
    /// in `[offset, offset + size)` first.
    fn insert(&mut self, offset: u64, size: u64) -> Arc<Entry> {
        let colliding: Vec<u64> = self
            .entries
            .range(offset..offset + size)
            .map(|(key, _)| *key)
            .collect();
        for key in colliding {
            self.erase(key);
        }
        let entry = Entry::new(offset);
        self.lru.push_back(Arc::downgrade(&entry));
        self.entries.insert(offset, entry.clone());
        entry
    }

    fn erase(&mut self, offset: u64) {
        if let Some(entry) = self.entries.remove(&offset) {
            if entry.refcount() > 0 {
                self.reserved.push_back(entry);
            }
            // otherwise the map held the last strong reference; the weak
            // lru slot goes stale and is skipped later
        }
    }

    fn collect_garbage(&mut self) {
        let mut budget = GC_BATCH;
        while budget > 0 {
            let front = match self.lru.front() {
                Some(weak) => weak.upgrade(),
                None => break,
            };
            match front {
                None => {
                    self.lru.pop_front();
                }
                Some(entry) => {
                    if !entry.expired(self.ttl) {
                        break;
                    }
                    self.lru.pop_front();
                    self.erase(entry.offset());
                    budget -= 1;
                }
            }
        }
        self.clear_reserved(GC_BATCH);
    }

    fn clear_reserved(&mut self, count: usize) {
        for _ in 0..count {
            match self.reserved.pop_front() {
                None => break,
                Some(entry) => {
                    if entry.refcount() > 0 {
                        self.reserved.push_back(entry);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn filled(cache: &mut ReadCache, offset: u64, data: &[u8]) {
        let result = cache.query(offset, data.len() as u32);
        assert!(result.needs_fill());
        result.fill_input(data.to_vec());
    }

    #[test]
    fn miss_inserts_fillable_extent() {
        let mut cache = ReadCache::new(TTL);
        let result = cache.query(0, 8);
        assert!(result.needs_fill());
        assert_eq!(result.remaining_offset(), 0);
        result.fill_input(vec![7; 8]);

        let mut out = [0u8; 8];
        assert_eq!(result.copy_to_buffer(&mut out, 0), 8);
        assert_eq!(out, [7; 8]);
    }

    #[test]
    fn hit_reuses_cached_extent() {
        let mut cache = ReadCache::new(TTL);
        filled(&mut cache, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let result = cache.query(2, 4);
        assert!(!result.needs_fill());
        let mut out = [0u8; 4];
        assert_eq!(result.copy_to_buffer(&mut out, 2), 4);
        assert_eq!(out, [3, 4, 5, 6]);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn partial_hit_appends_tail_extent() {
        let mut cache = ReadCache::new(TTL);
        filled(&mut cache, 0, &[9; 8]);

        let result = cache.query(4, 8);
        assert!(result.needs_fill());
        assert_eq!(result.front_offset(), 0);
        assert_eq!(result.remaining_offset(), 8);
        result.fill_input(vec![3; 4]);

        let mut out = [0u8; 8];
        assert_eq!(result.copy_to_buffer(&mut out, 4), 8);
        assert_eq!(&out[..4], &[9; 4]);
        assert_eq!(&out[4..], &[3; 4]);
    }

    #[test]
    fn segments_cover_the_requested_range() {
        let mut cache = ReadCache::new(TTL);
        filled(&mut cache, 0, &[9; 8]);
        let result = cache.query(4, 8);
        result.fill_input(vec![3; 4]);

        let mut segments = Vec::new();
        let visited = result.for_each_segment(4, 8, |slice| segments.push(slice.to_vec()));
        assert_eq!(visited, 8);
        assert_eq!(segments, vec![vec![9; 4], vec![3; 4]]);
    }

    #[test]
    fn extents_never_overlap() {
        let mut cache = ReadCache::new(TTL);
        filled(&mut cache, 0, &[1; 4]);
        filled(&mut cache, 8, &[2; 4]);
        // a request spanning the hole evicts nothing on the left, inserts
        // in the gap and evicts the colliding right neighbour
        let result = cache.query(0, 16);
        result.fill_input(vec![5; 12]);
        drop(result);

        let mut last_end = 0;
        for (offset, entry) in &cache.entries {
            assert!(*offset >= last_end, "extents overlap");
            last_end = entry.end_offset();
        }
    }

    #[test]
    fn referenced_extents_survive_eviction() {
        let mut cache = ReadCache::new(Duration::from_millis(0));
        let result = cache.query(0, 4);
        result.fill_input(vec![1, 2, 3, 4]);

        // ttl 0: the next query expires the extent, but the outstanding
        // reference keeps it alive on the reserved list
        let other = cache.query(0, 4);
        assert_eq!(cache.reserved_count(), 1);

        let mut out = [0u8; 4];
        assert_eq!(result.copy_to_buffer(&mut out, 0), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        drop(result);
        drop(other);
        cache.collect_garbage();
        assert_eq!(cache.reserved_count(), 0);
    }

    #[test]
    fn short_fill_truncates_extent() {
        let mut cache = ReadCache::new(TTL);
        let result = cache.query(0, 100);
        // the backing chunk was shorter than requested
        result.fill_input(vec![6; 10]);
        assert_eq!(result.end_offset(), 10);

        let mut out = [0u8; 100];
        assert_eq!(result.copy_to_buffer(&mut out, 0), 10);
    }

    #[test]
    fn fake_results_behave_like_cache_hits() {
        let result = CacheResult::fake(32, vec![8; 16]);
        assert!(result.is_fake());
        let mut out = [0u8; 16];
        assert_eq!(result.copy_to_buffer(&mut out, 32), 16);
        assert_eq!(out, [8; 16]);
    }

    #[test]
    fn release_is_idempotent_via_drop() {
        let mut cache = ReadCache::new(TTL);
        let mut result = cache.query(0, 4);
        result.fill_input(vec![0; 4]);
        result.release();
        // drop must not release a second time
        drop(result);
        let entry = cache.entries.get(&0).unwrap();
        assert_eq!(entry.refcount(), 0);
    }
}

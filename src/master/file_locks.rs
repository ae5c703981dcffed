//! POSIX byte-range and whole-file advisory locks.
//!
//! Per inode, exclusive locks are pairwise disjoint and a shared lock never
//! overlaps an exclusive lock of a different owner. Blocking acquires queue
//! up and are woken in order whenever a lock is released; a queued request
//! can be cancelled through its (owner, inode, request id) triple, which
//! answers the original call with an interrupted status.

use std::collections::HashMap;

use tokio::sync::oneshot;

use lfs_api_types::{lock_op, FlockWrapper, InterruptData, LockInfo, LockTable, StatusCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LockEntry {
    owner: u64,
    session_id: u32,
    shared: bool,
    start: u64,
    end: u64,
}

impl LockEntry {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    fn conflicts_with(&self, other: &LockEntry) -> bool {
        if self.owner == other.owner && self.session_id == other.session_id {
            return false;
        }
        if !self.overlaps(other.start, other.end) {
            return false;
        }
        !(self.shared && other.shared)
    }

    fn info(&self, inode: u32) -> LockInfo {
        LockInfo {
            inode,
            owner: self.owner,
            session_id: self.session_id,
            lock_type: if self.shared {
                lock_op::SHARED
            } else {
                lock_op::EXCLUSIVE
            },
            start: self.start,
            end: self.end,
        }
    }
}

struct PendingLock {
    entry: LockEntry,
    request_id: u32,
    reply: oneshot::Sender<StatusCode>,
}

#[derive(Default)]
struct InodeLocks {
    active: Vec<LockEntry>,
    pending: Vec<PendingLock>,
}

/// What a set-lock request resolved to.
pub enum SetLockOutcome {
    /// Granted (or released) immediately.
    Done,
    /// Would conflict and the caller asked not to block.
    WouldBlock,
    /// Queued; the receiver fires when the lock is granted or interrupted.
    Queued(oneshot::Receiver<StatusCode>),
}

#[derive(Default)]
pub struct FileLockManager {
    inodes: HashMap<u32, InodeLocks>,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a POSIX set-lock request.
    pub fn set_lock(
        &mut self,
        inode: u32,
        owner: u64,
        session_id: u32,
        request_id: u32,
        lock: FlockWrapper,
    ) -> SetLockOutcome {
        let start = lock.l_start;
        let end = lock.end();

        if lock.l_type & lock_op::UNLOCK != 0 {
            self.unlock(inode, owner, session_id, start, end);
            return SetLockOutcome::Done;
        }

        let entry = LockEntry {
            owner,
            session_id,
            shared: lock.l_type & lock_op::SHARED != 0,
            start,
            end,
        };

        let locks = self.inodes.entry(inode).or_default();
        let conflicting = locks
            .active
            .iter()
            .any(|active| active.conflicts_with(&entry));
        if !conflicting {
            Self::apply(locks, entry);
            return SetLockOutcome::Done;
        }
        if lock.l_type & lock_op::NONBLOCK != 0 {
            return SetLockOutcome::WouldBlock;
        }

        let (reply, receiver) = oneshot::channel();
        locks.pending.push(PendingLock {
            entry,
            request_id,
            reply,
        });
        SetLockOutcome::Queued(receiver)
    }

    /// Probe for a conflicting lock without acquiring anything.
    pub fn get_lock(
        &self,
        inode: u32,
        owner: u64,
        session_id: u32,
        lock: FlockWrapper,
    ) -> Option<FlockWrapper> {
        let probe = LockEntry {
            owner,
            session_id,
            shared: lock.l_type & lock_op::SHARED != 0,
            start: lock.l_start,
            end: lock.end(),
        };
        let locks = self.inodes.get(&inode)?;
        locks
            .active
            .iter()
            .find(|active| active.conflicts_with(&probe))
            .map(|active| {
                FlockWrapper::new(
                    if active.shared {
                        lock_op::SHARED
                    } else {
                        lock_op::EXCLUSIVE
                    },
                    active.start,
                    if active.end == u64::MAX {
                        0
                    } else {
                        active.end - active.start
                    },
                    0,
                )
            })
    }

    /// Cancel a queued request; its blocked caller receives an interrupted
    /// status. Granted locks are untouched.
    pub fn interrupt(&mut self, interrupt: InterruptData) -> bool {
        let locks = match self.inodes.get_mut(&interrupt.inode) {
            Some(locks) => locks,
            None => return false,
        };
        let position = locks.pending.iter().position(|pending| {
            pending.entry.owner == interrupt.owner && pending.request_id == interrupt.request_id
        });
        match position {
            Some(position) => {
                let pending = locks.pending.remove(position);
                let _ = pending.reply.send(StatusCode::Interrupted);
                true
            }
            None => false,
        }
    }

    /// Drop every lock and pending request of a disappearing session.
    pub fn drop_session(&mut self, session_id: u32) {
        let inodes: Vec<u32> = self.inodes.keys().copied().collect();
        for inode in inodes {
            let locks = self.inodes.get_mut(&inode).unwrap();
            locks
                .active
                .retain(|entry| entry.session_id != session_id);
            locks
                .pending
                .retain(|pending| pending.entry.session_id != session_id);
            Self::wake_pending(locks);
            if locks.active.is_empty() && locks.pending.is_empty() {
                self.inodes.remove(&inode);
            }
        }
    }

    /// List granted or pending locks, for the whole system or one inode.
    pub fn list(
        &self,
        inode: Option<u32>,
        table: LockTable,
        pending: bool,
        start: u64,
        max: u64,
    ) -> Vec<LockInfo> {
        if table == LockTable::Flock {
            // flock-style locks live in the kernels of the mounts; only
            // posix ranges are tracked here
            return Vec::new();
        }

        let mut rows: Vec<LockInfo> = Vec::new();
        let mut inodes: Vec<u32> = match inode {
            Some(inode) => vec![inode],
            None => self.inodes.keys().copied().collect(),
        };
        inodes.sort_unstable();

        for inode in inodes {
            if let Some(locks) = self.inodes.get(&inode) {
                if pending {
                    rows.extend(
                        locks
                            .pending
                            .iter()
                            .map(|pending| pending.entry.info(inode)),
                    );
                } else {
                    rows.extend(locks.active.iter().map(|entry| entry.info(inode)));
                }
            }
        }

        rows.into_iter()
            .skip(start as usize)
            .take(max as usize)
            .collect()
    }

    /// Insert `entry`, first carving it out of the owner's existing ranges
    /// (a new lock replaces the overlapped portions of old ones).
    fn apply(locks: &mut InodeLocks, entry: LockEntry) {
        Self::carve(locks, entry.owner, entry.session_id, entry.start, entry.end);
        locks.active.push(entry);
        locks.active.sort_by_key(|active| active.start);
    }

    fn carve(locks: &mut InodeLocks, owner: u64, session_id: u32, start: u64, end: u64) {
        let mut split: Vec<LockEntry> = Vec::new();
        locks.active.retain(|active| {
            if active.owner != owner
                || active.session_id != session_id
                || !active.overlaps(start, end)
            {
                return true;
            }
            if active.start < start {
                let mut left = *active;
                left.end = start;
                split.push(left);
            }
            if active.end > end {
                let mut right = *active;
                right.start = end;
                split.push(right);
            }
            false
        });
        locks.active.extend(split);
    }

    fn unlock(&mut self, inode: u32, owner: u64, session_id: u32, start: u64, end: u64) {
        if let Some(locks) = self.inodes.get_mut(&inode) {
            Self::carve(locks, owner, session_id, start, end);
            Self::wake_pending(locks);
            if locks.active.is_empty() && locks.pending.is_empty() {
                self.inodes.remove(&inode);
            }
        }
    }

    /// Grant queued requests that no longer conflict, in arrival order.
    fn wake_pending(locks: &mut InodeLocks) {
        let mut index = 0;
        while index < locks.pending.len() {
            let conflicting = locks
                .active
                .iter()
                .any(|active| active.conflicts_with(&locks.pending[index].entry));
            if conflicting {
                index += 1;
                continue;
            }
            let pending = locks.pending.remove(index);
            Self::apply(locks, pending.entry);
            let _ = pending.reply.send(StatusCode::Ok);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exclusive(start: u64, len: u64) -> FlockWrapper {
        FlockWrapper::new(lock_op::EXCLUSIVE, start, len, 1)
    }

    fn shared(start: u64, len: u64) -> FlockWrapper {
        FlockWrapper::new(lock_op::SHARED, start, len, 1)
    }

    fn unlock(start: u64, len: u64) -> FlockWrapper {
        FlockWrapper::new(lock_op::UNLOCK, start, len, 1)
    }

    #[test]
    fn disjoint_exclusive_locks_coexist() {
        let mut manager = FileLockManager::new();
        assert!(matches!(
            manager.set_lock(1, 10, 1, 0, exclusive(0, 10)),
            SetLockOutcome::Done
        ));
        assert!(matches!(
            manager.set_lock(1, 20, 1, 0, exclusive(10, 10)),
            SetLockOutcome::Done
        ));
        assert_eq!(manager.list(Some(1), LockTable::Posix, false, 0, 10).len(), 2);
    }

    #[test]
    fn shared_locks_overlap_but_exclude_writers() {
        let mut manager = FileLockManager::new();
        assert!(matches!(
            manager.set_lock(1, 10, 1, 0, shared(0, 10)),
            SetLockOutcome::Done
        ));
        assert!(matches!(
            manager.set_lock(1, 20, 2, 0, shared(5, 10)),
            SetLockOutcome::Done
        ));
        assert!(matches!(
            manager.set_lock(
                1,
                30,
                3,
                0,
                FlockWrapper::new(lock_op::EXCLUSIVE | lock_op::NONBLOCK, 8, 4, 1)
            ),
            SetLockOutcome::WouldBlock
        ));
    }

    #[tokio::test]
    async fn blocked_acquire_is_granted_on_unlock() {
        let mut manager = FileLockManager::new();
        manager.set_lock(1, 10, 1, 0, exclusive(0, 10));

        let receiver = match manager.set_lock(1, 20, 2, 7, exclusive(5, 10)) {
            SetLockOutcome::Queued(receiver) => receiver,
            _ => panic!("expected the acquire to queue"),
        };

        manager.set_lock(1, 10, 1, 0, unlock(0, 10));
        assert_eq!(receiver.await.unwrap(), StatusCode::Ok);
        assert_eq!(manager.list(Some(1), LockTable::Posix, false, 0, 10).len(), 1);
    }

    #[tokio::test]
    async fn interrupt_cancels_pending_but_keeps_granted() {
        let mut manager = FileLockManager::new();
        manager.set_lock(1, 10, 1, 0, exclusive(0, 10));

        let receiver = match manager.set_lock(1, 20, 2, 7, exclusive(5, 10)) {
            SetLockOutcome::Queued(receiver) => receiver,
            _ => panic!("expected the acquire to queue"),
        };

        assert!(manager.interrupt(InterruptData {
            owner: 20,
            inode: 1,
            request_id: 7,
        }));
        assert_eq!(receiver.await.unwrap(), StatusCode::Interrupted);

        // the original lock is untouched
        let rows = manager.list(Some(1), LockTable::Posix, false, 0, 10);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner, 10);
    }

    #[test]
    fn unlock_splits_ranges() {
        let mut manager = FileLockManager::new();
        manager.set_lock(1, 10, 1, 0, exclusive(0, 30));
        manager.set_lock(1, 10, 1, 0, unlock(10, 10));

        let rows = manager.list(Some(1), LockTable::Posix, false, 0, 10);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].start, rows[0].end), (0, 10));
        assert_eq!((rows[1].start, rows[1].end), (20, 30));
    }

    #[test]
    fn get_lock_reports_the_conflicting_range() {
        let mut manager = FileLockManager::new();
        manager.set_lock(1, 10, 1, 0, exclusive(0, 10));
        let conflict = manager.get_lock(1, 20, 2, shared(5, 10)).unwrap();
        assert_eq!(conflict.l_type, lock_op::EXCLUSIVE);
        assert_eq!(conflict.l_start, 0);

        // the owner itself sees no conflict
        assert!(manager.get_lock(1, 10, 1, shared(5, 10)).is_none());
    }

    #[test]
    fn session_loss_releases_locks() {
        let mut manager = FileLockManager::new();
        manager.set_lock(1, 10, 1, 0, exclusive(0, 10));
        manager.drop_session(1);
        assert!(manager.list(Some(1), LockTable::Posix, false, 0, 10).is_empty());
    }
}

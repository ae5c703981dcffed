//! File lock types shared by clients, the master and the admin tool.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Lock operation bits carried in `FlockWrapper::op`.
pub mod lock_op {
    pub const INVALID: u16 = 0;
    pub const UNLOCK: u16 = 1;
    pub const SHARED: u16 = 2;
    pub const EXCLUSIVE: u16 = 4;
    pub const INTERRUPT: u16 = 8;
    pub const NONBLOCK: u16 = 16;
    pub const RELEASE: u16 = 32;
}

/// Which lock table an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockTable {
    Flock = 0,
    Posix = 1,
    All = 2,
}

impl LockTable {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => LockTable::Flock,
            1 => LockTable::Posix,
            2 => LockTable::All,
            other => bail!("invalid lock table id {}", other),
        })
    }
}

/// Basic fields of `struct flock`. `l_whence` is omitted because FUSE always
/// normalizes it to `SEEK_SET`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlockWrapper {
    pub l_type: u16,
    pub l_start: u64,
    /// Length of the locked area, zero means until EOF.
    pub l_len: u64,
    pub l_pid: u32,
}

impl FlockWrapper {
    pub fn new(l_type: u16, l_start: u64, l_len: u64, l_pid: u32) -> Self {
        FlockWrapper {
            l_type,
            l_start,
            l_len,
            l_pid,
        }
    }

    /// Exclusive end offset; locks with zero length extend to u64::MAX.
    pub fn end(&self) -> u64 {
        if self.l_len == 0 {
            u64::MAX
        } else {
            self.l_start.saturating_add(self.l_len)
        }
    }
}

/// One granted or pending lock as reported by `manage-locks`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub inode: u32,
    pub owner: u64,
    pub session_id: u32,
    pub lock_type: u16,
    pub start: u64,
    pub end: u64,
}

/// Identifies a pending lock request to cancel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptData {
    pub owner: u64,
    pub inode: u32,
    pub request_id: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flock_end_offset() {
        assert_eq!(FlockWrapper::new(lock_op::SHARED, 10, 5, 1).end(), 15);
        assert_eq!(FlockWrapper::new(lock_op::SHARED, 10, 0, 1).end(), u64::MAX);
    }

    #[test]
    fn lock_table_ids() {
        assert_eq!(LockTable::from_u8(1).unwrap(), LockTable::Posix);
        assert!(LockTable::from_u8(9).is_err());
    }
}

//! Wire status codes and their typed error form.
//!
//! Every reply carries a one byte status. `0` means success, the remaining
//! values enumerate error kinds. At the FUSE boundary each kind maps to a
//! POSIX errno.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    NoSuchInode = 1,
    PermissionDenied = 2,
    QuotaExceeded = 3,
    ChunkLost = 4,
    VersionMismatch = 5,
    WrongLock = 6,
    Timeout = 7,
    OutOfMemory = 8,
    Io = 9,
    ReadOnlyFs = 10,
    NotEnoughParts = 11,
    Interrupted = 12,
    TryAgain = 13,
    NoSuchChunk = 14,
    BadRequest = 15,
}

impl StatusCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        use StatusCode::*;
        Some(match value {
            0 => Ok,
            1 => NoSuchInode,
            2 => PermissionDenied,
            3 => QuotaExceeded,
            4 => ChunkLost,
            5 => VersionMismatch,
            6 => WrongLock,
            7 => Timeout,
            8 => OutOfMemory,
            9 => Io,
            10 => ReadOnlyFs,
            11 => NotEnoughParts,
            12 => Interrupted,
            13 => TryAgain,
            14 => NoSuchChunk,
            15 => BadRequest,
            _ => return None,
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    /// Convert a non-ok status into the typed error. Panics on `Ok`, use
    /// [StatusCode::into_result] instead.
    pub fn into_error(self) -> LizError {
        use StatusCode::*;
        match self {
            Ok => panic!("status OK is not an error"),
            NoSuchInode => LizError::NoSuchInode,
            PermissionDenied => LizError::PermissionDenied,
            QuotaExceeded => LizError::QuotaExceeded,
            ChunkLost => LizError::ChunkLost,
            VersionMismatch => LizError::VersionMismatch,
            WrongLock => LizError::WrongLock,
            Timeout => LizError::Timeout,
            OutOfMemory => LizError::OutOfMemory,
            Io => LizError::Io,
            ReadOnlyFs => LizError::ReadOnlyFs,
            NotEnoughParts => LizError::NotEnoughParts,
            Interrupted => LizError::Interrupted,
            TryAgain => LizError::TryAgain,
            NoSuchChunk => LizError::NoSuchChunk,
            BadRequest => LizError::BadRequest,
        }
    }

    pub fn into_result(self) -> Result<(), LizError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK")
        } else {
            write!(f, "{}", self.into_error())
        }
    }
}

/// Typed form of a non-ok [StatusCode].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LizError {
    #[error("no such inode")]
    NoSuchInode,
    #[error("permission denied")]
    PermissionDenied,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("chunk lost")]
    ChunkLost,
    #[error("chunk version mismatch")]
    VersionMismatch,
    #[error("wrong lock id")]
    WrongLock,
    #[error("operation timed out")]
    Timeout,
    #[error("out of memory")]
    OutOfMemory,
    #[error("input/output error")]
    Io,
    #[error("read-only file system")]
    ReadOnlyFs,
    #[error("not enough chunk parts to recover data")]
    NotEnoughParts,
    #[error("operation interrupted")]
    Interrupted,
    #[error("temporary failure, try again")]
    TryAgain,
    #[error("no such chunk")]
    NoSuchChunk,
    #[error("malformed request")]
    BadRequest,
}

impl LizError {
    pub fn status(&self) -> StatusCode {
        use LizError::*;
        match self {
            NoSuchInode => StatusCode::NoSuchInode,
            PermissionDenied => StatusCode::PermissionDenied,
            QuotaExceeded => StatusCode::QuotaExceeded,
            ChunkLost => StatusCode::ChunkLost,
            VersionMismatch => StatusCode::VersionMismatch,
            WrongLock => StatusCode::WrongLock,
            Timeout => StatusCode::Timeout,
            OutOfMemory => StatusCode::OutOfMemory,
            Io => StatusCode::Io,
            ReadOnlyFs => StatusCode::ReadOnlyFs,
            NotEnoughParts => StatusCode::NotEnoughParts,
            Interrupted => StatusCode::Interrupted,
            TryAgain => StatusCode::TryAgain,
            NoSuchChunk => StatusCode::NoSuchChunk,
            BadRequest => StatusCode::BadRequest,
        }
    }

    /// The errno this error surfaces as at the FUSE boundary.
    pub fn errno(&self) -> i32 {
        use LizError::*;
        match self {
            NoSuchInode => libc::ENOENT,
            PermissionDenied => libc::EACCES,
            QuotaExceeded => libc::EDQUOT,
            ChunkLost | NotEnoughParts => libc::EIO,
            VersionMismatch | WrongLock => libc::EIO,
            Timeout => libc::ETIMEDOUT,
            OutOfMemory => libc::ENOMEM,
            Io => libc::EIO,
            ReadOnlyFs => libc::EROFS,
            Interrupted => libc::EINTR,
            TryAgain => libc::EAGAIN,
            NoSuchChunk => libc::ENOENT,
            BadRequest => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trip() {
        for value in 0..=15u8 {
            let status = StatusCode::from_u8(value).unwrap();
            if value == 0 {
                assert!(status.into_result().is_ok());
            } else {
                assert_eq!(status.into_error().status() as u8, value);
            }
        }
        assert_eq!(StatusCode::from_u8(200), None);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(LizError::NoSuchInode.errno(), libc::ENOENT);
        assert_eq!(LizError::QuotaExceeded.errno(), libc::EDQUOT);
        assert_eq!(LizError::TryAgain.errno(), libc::EAGAIN);
    }
}

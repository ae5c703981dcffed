//! Client to master messages.

use bytes::{BufMut, BytesMut};

use lfs_api_types::{FlockWrapper, InterruptData, LockTable};

use crate::packet::{define_message, Message, Packet};
use crate::ser::{WireError, WireGet, WirePut, WireResult};

pub const CLTOMA_FUSE_READ_CHUNK: u32 = 0x0401;
pub const CLTOMA_FUSE_WRITE_CHUNK: u32 = 0x0402;
pub const CLTOMA_FUSE_WRITE_CHUNK_END: u32 = 0x0403;
pub const CLTOMA_FUSE_GETLK: u32 = 0x0404;
pub const CLTOMA_FUSE_SETLK: u32 = 0x0405;
pub const CLTOMA_FUSE_SETLK_INTERRUPT: u32 = 0x0406;
pub const CLTOMA_MANAGE_LOCKS_LIST: u32 = 0x0407;
pub const CLTOMA_FUSE_GET_ACL: u32 = 0x0408;
pub const CLTOMA_FUSE_SET_ACL: u32 = 0x0409;
pub const CLTOMA_INFO: u32 = 0x040a;
pub const CLTOMA_CSERV_LIST: u32 = 0x040b;
pub const CLTOMA_CHUNKS_HEALTH: u32 = 0x040c;
pub const CLTOMA_LIST_GOALS: u32 = 0x040d;
pub const CLTOMA_METADATASERVER_STATUS: u32 = 0x040e;
pub const CLTOMA_SAVE_METADATA: u32 = 0x040f;
pub const CLTOMA_RELOAD_CONFIG: u32 = 0x0410;

define_message!(
    /// Ask where the chunk at `chunk_index` of `inode` lives.
    FuseReadChunk, CLTOMA_FUSE_READ_CHUNK, 0,
    message_id: u32,
    inode: u32,
    chunk_index: u32,
);

define_message!(
    /// Open the chunk at `chunk_index` for writing. A `lock_id` of zero asks
    /// for a fresh lock; retries pass the previously returned id.
    FuseWriteChunk, CLTOMA_FUSE_WRITE_CHUNK, 0,
    message_id: u32,
    inode: u32,
    chunk_index: u32,
    lock_id: u32,
);

define_message!(
    /// Commit a finished write: persist the new file length, bump the chunk
    /// version and release the lock.
    FuseWriteChunkEnd, CLTOMA_FUSE_WRITE_CHUNK_END, 0,
    message_id: u32,
    chunk_id: u64,
    lock_id: u32,
    inode: u32,
    file_length: u64,
);

define_message!(
    FuseGetlk, CLTOMA_FUSE_GETLK, 0,
    message_id: u32,
    inode: u32,
    owner: u64,
    lock: FlockWrapper,
);

define_message!(
    FuseSetlk, CLTOMA_FUSE_SETLK, 0,
    message_id: u32,
    inode: u32,
    owner: u64,
    request_id: u32,
    lock: FlockWrapper,
);

define_message!(
    /// Cancel a blocked `FuseSetlk` identified by (owner, inode, request id).
    FuseSetlkInterrupt, CLTOMA_FUSE_SETLK_INTERRUPT, 0,
    message_id: u32,
    interrupt: InterruptData,
);

pub const MANAGE_LOCKS_LIST_LIMIT: u64 = 1024;

/// List granted or pending locks, either globally or for one inode.
#[derive(Clone, Debug, PartialEq)]
pub enum ManageLocksList {
    All {
        table: LockTable,
        pending: bool,
        start: u64,
        max: u64,
    },
    Inode {
        inode: u32,
        table: LockTable,
        pending: bool,
        start: u64,
        max: u64,
    },
}

impl ManageLocksList {
    pub const TYPE: u32 = CLTOMA_MANAGE_LOCKS_LIST;
    const ALL_VERSION: u32 = 0;
    const INODE_VERSION: u32 = 1;

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            ManageLocksList::All {
                table,
                pending,
                start,
                max,
            } => {
                buf.put_u32(Self::ALL_VERSION);
                buf.put_u8(*table as u8);
                pending.put(&mut buf);
                buf.put_u64(*start);
                buf.put_u64(*max);
            }
            ManageLocksList::Inode {
                inode,
                table,
                pending,
                start,
                max,
            } => {
                buf.put_u32(Self::INODE_VERSION);
                buf.put_u32(*inode);
                buf.put_u8(*table as u8);
                pending.put(&mut buf);
                buf.put_u64(*start);
                buf.put_u64(*max);
            }
        }
        Packet::new(Self::TYPE, buf.freeze())
    }

    pub fn from_packet(packet: &Packet) -> WireResult<Self> {
        if packet.ptype != Self::TYPE {
            return Err(WireError::BadType {
                expected: Self::TYPE,
                got: packet.ptype,
            });
        }
        let mut body = packet.body.clone();
        let version = u32::get(&mut body)?;
        let message = match version {
            Self::ALL_VERSION => ManageLocksList::All {
                table: LockTable::from_u8(u8::get(&mut body)?)
                    .map_err(|err| WireError::Invalid(err.to_string()))?,
                pending: bool::get(&mut body)?,
                start: u64::get(&mut body)?,
                max: u64::get(&mut body)?,
            },
            Self::INODE_VERSION => ManageLocksList::Inode {
                inode: u32::get(&mut body)?,
                table: LockTable::from_u8(u8::get(&mut body)?)
                    .map_err(|err| WireError::Invalid(err.to_string()))?,
                pending: bool::get(&mut body)?,
                start: u64::get(&mut body)?,
                max: u64::get(&mut body)?,
            },
            got => {
                return Err(WireError::BadVersion {
                    expected: Self::INODE_VERSION,
                    got,
                })
            }
        };
        Ok(message)
    }
}

/// Which ACL form a get request asks for.
pub const ACL_TYPE_POSIX: u8 = 0;
pub const ACL_TYPE_RICH: u8 = 1;
pub const ACL_TYPE_DEFAULT_POSIX: u8 = 2;

define_message!(
    FuseGetAcl, CLTOMA_FUSE_GET_ACL, 0,
    message_id: u32,
    inode: u32,
    uid: u32,
    gid: u32,
    acl_type: u8,
);

/// Set an ACL; the payload is the string form of the respective ACL type.
#[derive(Clone, Debug, PartialEq)]
pub enum FuseSetAcl {
    Posix {
        message_id: u32,
        inode: u32,
        uid: u32,
        gid: u32,
        acl: String,
    },
    Rich {
        message_id: u32,
        inode: u32,
        uid: u32,
        gid: u32,
        acl: String,
    },
}

impl FuseSetAcl {
    pub const TYPE: u32 = CLTOMA_FUSE_SET_ACL;
    const POSIX_VERSION: u32 = 0;
    const RICH_VERSION: u32 = 1;

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            FuseSetAcl::Posix {
                message_id,
                inode,
                uid,
                gid,
                acl,
            } => {
                buf.put_u32(Self::POSIX_VERSION);
                buf.put_u32(*message_id);
                buf.put_u32(*inode);
                buf.put_u32(*uid);
                buf.put_u32(*gid);
                acl.put(&mut buf);
            }
            FuseSetAcl::Rich {
                message_id,
                inode,
                uid,
                gid,
                acl,
            } => {
                buf.put_u32(Self::RICH_VERSION);
                buf.put_u32(*message_id);
                buf.put_u32(*inode);
                buf.put_u32(*uid);
                buf.put_u32(*gid);
                acl.put(&mut buf);
            }
        }
        Packet::new(Self::TYPE, buf.freeze())
    }

    pub fn from_packet(packet: &Packet) -> WireResult<Self> {
        if packet.ptype != Self::TYPE {
            return Err(WireError::BadType {
                expected: Self::TYPE,
                got: packet.ptype,
            });
        }
        let mut body = packet.body.clone();
        let version = u32::get(&mut body)?;
        let message_id = u32::get(&mut body)?;
        let inode = u32::get(&mut body)?;
        let uid = u32::get(&mut body)?;
        let gid = u32::get(&mut body)?;
        let acl = String::get(&mut body)?;
        match version {
            Self::POSIX_VERSION => Ok(FuseSetAcl::Posix {
                message_id,
                inode,
                uid,
                gid,
                acl,
            }),
            Self::RICH_VERSION => Ok(FuseSetAcl::Rich {
                message_id,
                inode,
                uid,
                gid,
                acl,
            }),
            got => Err(WireError::BadVersion {
                expected: Self::RICH_VERSION,
                got,
            }),
        }
    }
}

define_message!(Info, CLTOMA_INFO, 0);

define_message!(CservList, CLTOMA_CSERV_LIST, 0);

define_message!(
    ChunksHealth, CLTOMA_CHUNKS_HEALTH, 0,
    regular_only: bool,
);

define_message!(ListGoals, CLTOMA_LIST_GOALS, 0);

define_message!(
    MetadataserverStatus, CLTOMA_METADATASERVER_STATUS, 0,
    message_id: u32,
);

define_message!(SaveMetadata, CLTOMA_SAVE_METADATA, 0, message_id: u32);

define_message!(ReloadConfig, CLTOMA_RELOAD_CONFIG, 0, message_id: u32);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_chunk_round_trip() {
        let msg = FuseReadChunk {
            message_id: 17,
            inode: 5,
            chunk_index: 2,
        };
        let packet = msg.to_packet();
        assert_eq!(packet.ptype, CLTOMA_FUSE_READ_CHUNK);
        assert_eq!(FuseReadChunk::from_packet(&packet).unwrap(), msg);
    }

    #[test]
    fn manage_locks_versions() {
        let all = ManageLocksList::All {
            table: LockTable::Posix,
            pending: false,
            start: 0,
            max: MANAGE_LOCKS_LIST_LIMIT,
        };
        assert_eq!(ManageLocksList::from_packet(&all.to_packet()).unwrap(), all);

        let inode = ManageLocksList::Inode {
            inode: 36,
            table: LockTable::All,
            pending: true,
            start: 5,
            max: 10,
        };
        assert_eq!(
            ManageLocksList::from_packet(&inode.to_packet()).unwrap(),
            inode
        );
    }

    #[test]
    fn trailing_bytes_are_a_structural_error() {
        let msg = FuseReadChunk {
            message_id: 1,
            inode: 2,
            chunk_index: 3,
        };
        let mut packet = msg.to_packet();
        let mut body = BytesMut::from(&packet.body[..]);
        body.put_u8(0xff);
        packet.body = body.freeze();
        assert!(matches!(
            FuseReadChunk::from_packet(&packet),
            Err(WireError::TrailingBytes(1))
        ));
    }
}

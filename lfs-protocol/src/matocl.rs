//! Master to client messages.

use bytes::{BufMut, BytesMut};

use lfs_api_types::{LockInfo, StatusCode};

use crate::entities::{
    ChunkserverListEntry, GoalAvailability, GoalReplication, MasterInfo, PartLocation,
    SerializedGoal,
};
use crate::packet::{define_message, Packet};
use crate::ser::{WireError, WireGet, WirePut, WireResult};

pub const MATOCL_FUSE_READ_CHUNK: u32 = 0x0501;
pub const MATOCL_FUSE_WRITE_CHUNK: u32 = 0x0502;
pub const MATOCL_FUSE_WRITE_CHUNK_END: u32 = 0x0503;
pub const MATOCL_FUSE_GETLK: u32 = 0x0504;
pub const MATOCL_FUSE_SETLK: u32 = 0x0505;
pub const MATOCL_MANAGE_LOCKS_LIST: u32 = 0x0507;
pub const MATOCL_FUSE_GET_ACL: u32 = 0x0508;
pub const MATOCL_FUSE_SET_ACL: u32 = 0x0509;
pub const MATOCL_INFO: u32 = 0x050a;
pub const MATOCL_CSERV_LIST: u32 = 0x050b;
pub const MATOCL_CHUNKS_HEALTH: u32 = 0x050c;
pub const MATOCL_LIST_GOALS: u32 = 0x050d;
pub const MATOCL_METADATASERVER_STATUS: u32 = 0x050e;
pub const MATOCL_SAVE_METADATA: u32 = 0x050f;
pub const MATOCL_RELOAD_CONFIG: u32 = 0x0510;

pub const METADATASERVER_STATUS_MASTER: u8 = 0;
pub const METADATASERVER_STATUS_SHADOW_CONNECTED: u8 = 1;
pub const METADATASERVER_STATUS_SHADOW_DISCONNECTED: u8 = 2;

/// Reply to `FuseReadChunk`: an error status or the chunk location record.
#[derive(Clone, Debug, PartialEq)]
pub enum FuseReadChunkReply {
    Status {
        message_id: u32,
        status: StatusCode,
    },
    Response {
        message_id: u32,
        file_length: u64,
        chunk_id: u64,
        chunk_version: u32,
        locations: Vec<PartLocation>,
    },
}

impl FuseReadChunkReply {
    pub const TYPE: u32 = MATOCL_FUSE_READ_CHUNK;
    const STATUS_VERSION: u32 = 0;
    const RESPONSE_VERSION: u32 = 1;

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            FuseReadChunkReply::Status { message_id, status } => {
                buf.put_u32(Self::STATUS_VERSION);
                buf.put_u32(*message_id);
                status.put(&mut buf);
            }
            FuseReadChunkReply::Response {
                message_id,
                file_length,
                chunk_id,
                chunk_version,
                locations,
            } => {
                buf.put_u32(Self::RESPONSE_VERSION);
                buf.put_u32(*message_id);
                buf.put_u64(*file_length);
                buf.put_u64(*chunk_id);
                buf.put_u32(*chunk_version);
                locations.put(&mut buf);
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
        match version {
            Self::STATUS_VERSION => Ok(FuseReadChunkReply::Status {
                message_id: u32::get(&mut body)?,
                status: StatusCode::get(&mut body)?,
            }),
            Self::RESPONSE_VERSION => Ok(FuseReadChunkReply::Response {
                message_id: u32::get(&mut body)?,
                file_length: u64::get(&mut body)?,
                chunk_id: u64::get(&mut body)?,
                chunk_version: u32::get(&mut body)?,
                locations: Vec::get(&mut body)?,
            }),
            got => Err(WireError::BadVersion {
                expected: Self::RESPONSE_VERSION,
                got,
            }),
        }
    }
}

/// Reply to `FuseWriteChunk`.
#[derive(Clone, Debug, PartialEq)]
pub enum FuseWriteChunkReply {
    Status {
        message_id: u32,
        status: StatusCode,
    },
    Response {
        message_id: u32,
        file_length: u64,
        chunk_id: u64,
        chunk_version: u32,
        lock_id: u32,
        locations: Vec<PartLocation>,
    },
}

impl FuseWriteChunkReply {
    pub const TYPE: u32 = MATOCL_FUSE_WRITE_CHUNK;
    const STATUS_VERSION: u32 = 0;
    const RESPONSE_VERSION: u32 = 1;

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            FuseWriteChunkReply::Status { message_id, status } => {
                buf.put_u32(Self::STATUS_VERSION);
                buf.put_u32(*message_id);
                status.put(&mut buf);
            }
            FuseWriteChunkReply::Response {
                message_id,
                file_length,
                chunk_id,
                chunk_version,
                lock_id,
                locations,
            } => {
                buf.put_u32(Self::RESPONSE_VERSION);
                buf.put_u32(*message_id);
                buf.put_u64(*file_length);
                buf.put_u64(*chunk_id);
                buf.put_u32(*chunk_version);
                buf.put_u32(*lock_id);
                locations.put(&mut buf);
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
        match version {
            Self::STATUS_VERSION => Ok(FuseWriteChunkReply::Status {
                message_id: u32::get(&mut body)?,
                status: StatusCode::get(&mut body)?,
            }),
            Self::RESPONSE_VERSION => Ok(FuseWriteChunkReply::Response {
                message_id: u32::get(&mut body)?,
                file_length: u64::get(&mut body)?,
                chunk_id: u64::get(&mut body)?,
                chunk_version: u32::get(&mut body)?,
                lock_id: u32::get(&mut body)?,
                locations: Vec::get(&mut body)?,
            }),
            got => Err(WireError::BadVersion {
                expected: Self::RESPONSE_VERSION,
                got,
            }),
        }
    }
}

define_message!(
    FuseWriteChunkEndReply, MATOCL_FUSE_WRITE_CHUNK_END, 0,
    message_id: u32,
    status: StatusCode,
);

define_message!(
    FuseGetlkReply, MATOCL_FUSE_GETLK, 0,
    message_id: u32,
    status: StatusCode,
    lock: lfs_api_types::FlockWrapper,
);

define_message!(
    FuseSetlkReply, MATOCL_FUSE_SETLK, 0,
    message_id: u32,
    status: StatusCode,
);

define_message!(
    ManageLocksListReply, MATOCL_MANAGE_LOCKS_LIST, 0,
    locks: Vec<LockInfo>,
);

/// Reply to `FuseGetAcl`; successful replies carry the ACL string form.
#[derive(Clone, Debug, PartialEq)]
pub enum FuseGetAclReply {
    Status {
        message_id: u32,
        status: StatusCode,
    },
    Posix {
        message_id: u32,
        acl: String,
    },
    Rich {
        message_id: u32,
        acl: String,
    },
}

impl FuseGetAclReply {
    pub const TYPE: u32 = MATOCL_FUSE_GET_ACL;
    const STATUS_VERSION: u32 = 0;
    const POSIX_VERSION: u32 = 1;
    const RICH_VERSION: u32 = 2;

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        match self {
            FuseGetAclReply::Status { message_id, status } => {
                buf.put_u32(Self::STATUS_VERSION);
                buf.put_u32(*message_id);
                status.put(&mut buf);
            }
            FuseGetAclReply::Posix { message_id, acl } => {
                buf.put_u32(Self::POSIX_VERSION);
                buf.put_u32(*message_id);
                acl.put(&mut buf);
            }
            FuseGetAclReply::Rich { message_id, acl } => {
                buf.put_u32(Self::RICH_VERSION);
                buf.put_u32(*message_id);
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
        match version {
            Self::STATUS_VERSION => Ok(FuseGetAclReply::Status {
                message_id,
                status: StatusCode::get(&mut body)?,
            }),
            Self::POSIX_VERSION => Ok(FuseGetAclReply::Posix {
                message_id,
                acl: String::get(&mut body)?,
            }),
            Self::RICH_VERSION => Ok(FuseGetAclReply::Rich {
                message_id,
                acl: String::get(&mut body)?,
            }),
            got => Err(WireError::BadVersion {
                expected: Self::RICH_VERSION,
                got,
            }),
        }
    }
}

define_message!(
    FuseSetAclReply, MATOCL_FUSE_SET_ACL, 0,
    message_id: u32,
    status: StatusCode,
);

define_message!(
    InfoReply, MATOCL_INFO, 0,
    info: MasterInfo,
);

define_message!(
    CservListReply, MATOCL_CSERV_LIST, 0,
    servers: Vec<ChunkserverListEntry>,
);

define_message!(
    ChunksHealthReply, MATOCL_CHUNKS_HEALTH, 0,
    regular_only: bool,
    availability: Vec<GoalAvailability>,
    replication: Vec<GoalReplication>,
);

define_message!(
    ListGoalsReply, MATOCL_LIST_GOALS, 0,
    goals: Vec<SerializedGoal>,
);

define_message!(
    MetadataserverStatusReply, MATOCL_METADATASERVER_STATUS, 0,
    message_id: u32,
    status: u8,
    metadata_version: u64,
);

define_message!(
    SaveMetadataReply, MATOCL_SAVE_METADATA, 0,
    message_id: u32,
    status: StatusCode,
);

define_message!(
    ReloadConfigReply, MATOCL_RELOAD_CONFIG, 0,
    message_id: u32,
    status: StatusCode,
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::ChunkserverAddress;
    use lfs_api_types::{ChunkPartType, MediaLabel, SliceType};

    #[test]
    fn read_chunk_reply_versions() {
        let status = FuseReadChunkReply::Status {
            message_id: 3,
            status: StatusCode::NoSuchChunk,
        };
        assert_eq!(
            FuseReadChunkReply::from_packet(&status.to_packet()).unwrap(),
            status
        );

        let response = FuseReadChunkReply::Response {
            message_id: 3,
            file_length: 131072,
            chunk_id: 0x1234,
            chunk_version: 7,
            locations: vec![PartLocation {
                part_type: ChunkPartType::new(SliceType::Standard, 0).unwrap(),
                address: ChunkserverAddress { ip: 0x7f000001, port: 9422 },
                label: MediaLabel::new("hdd").unwrap(),
            }],
        };
        assert_eq!(
            FuseReadChunkReply::from_packet(&response.to_packet()).unwrap(),
            response
        );
    }

    #[test]
    fn get_acl_reply_versions() {
        for reply in [
            FuseGetAclReply::Status {
                message_id: 1,
                status: StatusCode::NoSuchInode,
            },
            FuseGetAclReply::Posix {
                message_id: 1,
                acl: "A770/u:123:7/m::6".into(),
            },
            FuseGetAclReply::Rich {
                message_id: 1,
                acl: "mw|rwx|rx|r|".into(),
            },
        ] {
            assert_eq!(
                FuseGetAclReply::from_packet(&reply.to_packet()).unwrap(),
                reply
            );
        }
    }
}

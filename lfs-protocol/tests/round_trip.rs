use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use lfs_api_types::{
    ChunkPartType, FlockWrapper, InterruptData, LockInfo, LockTable, MediaLabel, PosixAcl,
    RichAcl, SliceType, StatusCode,
};
use lfs_protocol::cstoma;
use lfs_protocol::matocl;
use lfs_protocol::{cltocs, cltoma, cstocl};
use lfs_protocol::{
    ChunkserverAddress, ChunkserverListEntry, GoalAvailability, GoalReplication, MasterInfo,
    Message, Packet, PacketCodec, PartLocation, SerializedGoal,
};

fn addr() -> ChunkserverAddress {
    ChunkserverAddress {
        ip: 0xc0a80017,
        port: 9422,
    }
}

fn locations() -> Vec<PartLocation> {
    vec![
        PartLocation {
            part_type: ChunkPartType::new(SliceType::Xor(2), 0).unwrap(),
            address: addr(),
            label: MediaLabel::new("hdd").unwrap(),
        },
        PartLocation {
            part_type: ChunkPartType::new(SliceType::Xor(2), 1).unwrap(),
            address: ChunkserverAddress {
                ip: 0xc0a80018,
                port: 9422,
            },
            label: MediaLabel::wildcard(),
        },
    ]
}

/// serialize -> frame -> unframe -> parse must reproduce the message, and
/// re-serializing the parse must reproduce the original bytes.
fn check_frame<M, F, G>(message: M, encode: F, decode: G)
where
    M: PartialEq + std::fmt::Debug + Clone,
    F: Fn(&M) -> Packet,
    G: Fn(&Packet) -> M,
{
    let packet = encode(&message);
    let mut codec = PacketCodec;
    let mut wire = BytesMut::new();
    codec.encode(packet.clone(), &mut wire).unwrap();

    let framed = codec.decode(&mut wire).unwrap().expect("a whole frame");
    assert!(wire.is_empty());
    assert_eq!(framed.ptype, packet.ptype);
    assert_eq!(framed.body, packet.body);

    let parsed = decode(&framed);
    assert_eq!(parsed, message);
    assert_eq!(encode(&parsed).body, packet.body);
}

fn check<M: Message + PartialEq + std::fmt::Debug + Clone>(message: M) {
    check_frame(message, |m| m.to_packet(), |p| M::from_packet(p).unwrap());
}

#[test]
fn chunk_location_messages() {
    check(cltoma::FuseReadChunk {
        message_id: 1,
        inode: 36,
        chunk_index: 2,
    });
    check_frame(
        matocl::FuseReadChunkReply::Response {
            message_id: 1,
            file_length: 131072,
            chunk_id: 0x1234,
            chunk_version: 7,
            locations: locations(),
        },
        |m| m.to_packet(),
        |p| matocl::FuseReadChunkReply::from_packet(p).unwrap(),
    );
    check_frame(
        matocl::FuseReadChunkReply::Status {
            message_id: 1,
            status: StatusCode::ChunkLost,
        },
        |m| m.to_packet(),
        |p| matocl::FuseReadChunkReply::from_packet(p).unwrap(),
    );
}

#[test]
fn write_protocol_messages() {
    check(cltoma::FuseWriteChunk {
        message_id: 2,
        inode: 36,
        chunk_index: 0,
        lock_id: 0,
    });
    check_frame(
        matocl::FuseWriteChunkReply::Response {
            message_id: 2,
            file_length: 0,
            chunk_id: 9,
            chunk_version: 1,
            lock_id: 42,
            locations: locations(),
        },
        |m| m.to_packet(),
        |p| matocl::FuseWriteChunkReply::from_packet(p).unwrap(),
    );
    check(cltoma::FuseWriteChunkEnd {
        message_id: 3,
        chunk_id: 9,
        lock_id: 42,
        inode: 36,
        file_length: 4096,
    });
    check(matocl::FuseWriteChunkEndReply {
        message_id: 3,
        status: StatusCode::Ok,
    });
}

#[test]
fn chunkserver_data_messages() {
    check(cltocs::Read {
        chunk_id: 0x1234,
        chunk_version: 7,
        part_type: ChunkPartType::new(SliceType::Ec(3, 2), 4).unwrap(),
        offset: 65536,
        size: 65536,
    });
    check(cltocs::Prefetch {
        chunk_id: 0x1234,
        chunk_version: 7,
        part_type: ChunkPartType::new(SliceType::Standard, 0).unwrap(),
        offset: 0,
        size: 131072,
    });
    check(cltocs::WriteInit {
        chunk_id: 9,
        chunk_version: 1,
        part_type: ChunkPartType::new(SliceType::Standard, 0).unwrap(),
        chain: vec![addr()],
    });

    let payload = Bytes::from(vec![0x5a; 4096]);
    check(cltocs::WriteData {
        chunk_id: 9,
        write_id: 1,
        block_number: 0,
        offset_in_block: 0,
        size: payload.len() as u32,
        crc: crc32fast::hash(&payload),
        data: payload.clone(),
    });
    check(cstocl::ReadData {
        chunk_id: 9,
        read_offset: 0,
        read_size: payload.len() as u32,
        crc: crc32fast::hash(&payload),
        data: payload,
    });
    check(cstocl::ReadStatus {
        chunk_id: 9,
        status: StatusCode::Ok,
    });
    check(cstocl::WriteStatus {
        chunk_id: 9,
        write_id: 1,
        status: StatusCode::VersionMismatch,
    });
}

#[test]
fn lock_messages() {
    check(cltoma::FuseSetlk {
        message_id: 5,
        inode: 36,
        owner: 0xabcd,
        request_id: 77,
        lock: FlockWrapper::new(lfs_api_types::lock_op::EXCLUSIVE, 0, 10, 100),
    });
    check(cltoma::FuseSetlkInterrupt {
        message_id: 6,
        interrupt: InterruptData {
            owner: 0xabcd,
            inode: 36,
            request_id: 77,
        },
    });
    check(matocl::FuseSetlkReply {
        message_id: 5,
        status: StatusCode::Interrupted,
    });
    check_frame(
        cltoma::ManageLocksList::Inode {
            inode: 36,
            table: LockTable::Posix,
            pending: true,
            start: 0,
            max: cltoma::MANAGE_LOCKS_LIST_LIMIT,
        },
        |m| m.to_packet(),
        |p| cltoma::ManageLocksList::from_packet(p).unwrap(),
    );
    check(matocl::ManageLocksListReply {
        locks: vec![LockInfo {
            inode: 36,
            owner: 0xabcd,
            session_id: 1,
            lock_type: lfs_api_types::lock_op::SHARED,
            start: 0,
            end: 10,
        }],
    });
}

#[test]
fn acl_messages_round_trip_their_string_forms() {
    let posix: PosixAcl = "A770/u:123:7/g:166:4/m::6".parse().unwrap();
    check_frame(
        cltoma::FuseSetAcl::Posix {
            message_id: 8,
            inode: 36,
            uid: 0,
            gid: 0,
            acl: posix.to_string(),
        },
        |m| m.to_packet(),
        |p| cltoma::FuseSetAcl::from_packet(p).unwrap(),
    );

    let rich: RichAcl = "mw|rwx|rx|r|rwx::A:O/r::D:u1000/".parse().unwrap();
    check_frame(
        matocl::FuseGetAclReply::Rich {
            message_id: 8,
            acl: rich.to_string(),
        },
        |m| m.to_packet(),
        |p| matocl::FuseGetAclReply::from_packet(p).unwrap(),
    );

    // the payload parses back to the identical ACL
    let reply = matocl::FuseGetAclReply::Rich {
        message_id: 8,
        acl: rich.to_string(),
    };
    if let matocl::FuseGetAclReply::Rich { acl, .. } =
        matocl::FuseGetAclReply::from_packet(&reply.to_packet()).unwrap()
    {
        assert_eq!(acl.parse::<RichAcl>().unwrap(), rich);
    } else {
        panic!("wrong reply variant");
    }
}

#[test]
fn admin_messages() {
    check(cltoma::Info {});
    check(matocl::InfoReply {
        info: MasterInfo {
            version: 0x030d01,
            memory_usage: 1 << 20,
            total_space: 1 << 40,
            available_space: 1 << 39,
            file_nodes: 10,
            chunks: 4,
            chunk_copies: 9,
            regular_copies: 8,
        },
    });
    check(matocl::CservListReply {
        servers: vec![ChunkserverListEntry {
            version: 0x030d01,
            address: addr(),
            label: MediaLabel::new("ssd").unwrap(),
            chunks: 4,
            used_space: 1 << 30,
            total_space: 1 << 40,
            error_counter: 0,
        }],
    });
    check(matocl::ChunksHealthReply {
        regular_only: false,
        availability: vec![GoalAvailability {
            goal_id: 1,
            safe: 10,
            endangered: 2,
            lost: 0,
        }],
        replication: vec![GoalReplication {
            goal_id: 1,
            to_replicate: 2,
            to_delete: 0,
        }],
    });
    check(matocl::ListGoalsReply {
        goals: vec![SerializedGoal {
            id: 1,
            name: "default".into(),
            definition: "default: std {_ 2}".into(),
        }],
    });
    check(matocl::MetadataserverStatusReply {
        message_id: 0,
        status: matocl::METADATASERVER_STATUS_MASTER,
        metadata_version: 123,
    });
}

#[test]
fn chunkserver_registration_messages() {
    check(cstoma::Register {
        address: addr(),
        label: MediaLabel::new("hdd").unwrap(),
        server_version: 0x030d01,
        used_space: 0,
        total_space: 1 << 40,
    });
    check(cstoma::RegisterAck {
        status: StatusCode::Ok,
    });
}

//! End to end chunk data plane: a real master, fake chunkservers, and the
//! client read/write paths on top.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;

use lfs_api_types::{lock_op, FlockWrapper, InterruptData, MediaLabel, StatusCode};
use lfs_client::{
    ChunkConnector, ChunkReader, ChunkReaderOptions, ChunkWriter, ChunkWriterOptions,
    ChunkserverStats, MasterSession, MasterSessionOptions,
};
use lfs_protocol::packet::Message;
use lfs_protocol::{cltocs, cstocl, cstoma, ChunkserverAddress, PacketCodec};
use lizardfs::master::{MasterConfig, MasterServer, MasterState, MASTER_VERSION};

type ChunkStore = Arc<Mutex<HashMap<u64, Vec<u8>>>>;

/// A chunkserver speaking just enough of the protocol for the data plane:
/// registration, part reads and chain writes (applied locally).
async fn spawn_chunkserver(master: std::net::SocketAddr) -> (ChunkserverAddress, ChunkStore) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    };
    let address = ChunkserverAddress::from(SocketAddrV4::new(*local.ip(), local.port()));
    let store: ChunkStore = Arc::new(Mutex::new(HashMap::new()));

    // announce ourselves to the master
    let stream = tokio::net::TcpStream::connect(master).await.unwrap();
    let mut framed = tokio_util::codec::Framed::new(stream, PacketCodec);
    let register = cstoma::Register {
        address,
        label: MediaLabel::new("hdd").unwrap(),
        server_version: MASTER_VERSION,
        used_space: 0,
        total_space: 1 << 40,
    };
    framed.send(register.to_packet()).await.unwrap();
    let ack = framed.next().await.unwrap().unwrap();
    let ack = cstoma::RegisterAck::from_packet(&ack).unwrap();
    assert!(ack.status.is_ok());

    let serve_store = store.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let store = serve_store.clone();
            tokio::spawn(async move {
                let mut framed = tokio_util::codec::Framed::new(stream, PacketCodec);
                while let Some(Ok(packet)) = framed.next().await {
                    match packet.ptype {
                        cltocs::CLTOCS_READ => {
                            let request = cltocs::Read::from_packet(&packet).unwrap();
                            let data = {
                                let store = store.lock().unwrap();
                                let chunk = store.get(&request.chunk_id).cloned().unwrap_or_default();
                                let start = (request.offset as usize).min(chunk.len());
                                let end = (start + request.size as usize).min(chunk.len());
                                let mut data = chunk[start..end].to_vec();
                                data.resize(request.size as usize, 0);
                                data
                            };
                            let fragment = cstocl::ReadData {
                                chunk_id: request.chunk_id,
                                read_offset: request.offset,
                                read_size: request.size,
                                crc: crc32fast::hash(&data),
                                data: Bytes::from(data),
                            };
                            let _ = framed.send(fragment.to_packet()).await;
                            let status = cstocl::ReadStatus {
                                chunk_id: request.chunk_id,
                                status: StatusCode::Ok,
                            };
                            let _ = framed.send(status.to_packet()).await;
                        }
                        cltocs::CLTOCS_PREFETCH => {}
                        cltocs::CLTOCS_WRITE_INIT => {
                            cltocs::WriteInit::from_packet(&packet).unwrap();
                        }
                        cltocs::CLTOCS_WRITE_DATA => {
                            let write = cltocs::WriteData::from_packet(&packet).unwrap();
                            assert_eq!(crc32fast::hash(&write.data), write.crc);
                            {
                                let mut store = store.lock().unwrap();
                                let chunk = store.entry(write.chunk_id).or_default();
                                let offset = write.block_number as usize * 65536
                                    + write.offset_in_block as usize;
                                if chunk.len() < offset + write.data.len() {
                                    chunk.resize(offset + write.data.len(), 0);
                                }
                                chunk[offset..offset + write.data.len()]
                                    .copy_from_slice(&write.data);
                            }
                            let status = cstocl::WriteStatus {
                                chunk_id: write.chunk_id,
                                write_id: write.write_id,
                                status: StatusCode::Ok,
                            };
                            let _ = framed.send(status.to_packet()).await;
                        }
                        cltocs::CLTOCS_WRITE_END => {}
                        _ => return,
                    }
                }
            });
        }
    });

    (address, store)
}

async fn spawn_master() -> std::net::SocketAddr {
    let config = MasterConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    let state = MasterState::new(config, None);
    let server = MasterServer::bind(state).await.unwrap();
    let address = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    address
}

fn session(master: std::net::SocketAddr) -> Arc<MasterSession> {
    Arc::new(MasterSession::new(master, MasterSessionOptions::default()))
}

fn connector() -> Arc<ChunkConnector> {
    Arc::new(ChunkConnector::new(Arc::new(ChunkserverStats::new())))
}

/// Write 4096 bytes to a fresh file, commit, and read them back: the
/// read-chunk reply reports the committed length and the bytes match.
#[tokio::test]
async fn write_then_read_round_trip() {
    let master_addr = spawn_master().await;
    let (_cs, _store) = spawn_chunkserver(master_addr).await;

    let master = session(master_addr);
    let connector = connector();
    let writer = ChunkWriter::new(master.clone(), connector.clone(), ChunkWriterOptions::default());
    let reader = ChunkReader::new(master.clone(), connector, ChunkReaderOptions::default());

    let payload: Vec<u8> = (0..4096u32).map(|byte| byte as u8).collect();
    let inode = 36;
    let new_length = writer.write(inode, 0, &payload).await.unwrap();
    assert_eq!(new_length, 4096);

    let location = master.read_chunk(inode, 0).await.unwrap();
    assert_eq!(location.file_length, 4096);
    assert_eq!(location.chunk_version, 1);
    assert!(!location.locations.is_empty());

    let read_back = reader.read(inode, 0, 4096).await.unwrap();
    assert_eq!(read_back, payload);
}

/// Reads truncate at end of file and reads of a missing file fail.
#[tokio::test]
async fn read_truncates_at_end_of_file() {
    let master_addr = spawn_master().await;
    let (_cs, _store) = spawn_chunkserver(master_addr).await;

    let master = session(master_addr);
    let connector = connector();
    let writer = ChunkWriter::new(master.clone(), connector.clone(), ChunkWriterOptions::default());
    let reader = ChunkReader::new(master.clone(), connector, ChunkReaderOptions::default());

    let inode = 7;
    writer.write(inode, 0, &[1u8; 1000]).await.unwrap();

    let read_back = reader.read(inode, 900, 400).await.unwrap();
    assert_eq!(read_back.len(), 100);
    assert!(read_back.iter().all(|byte| *byte == 1));

    let past_eof = reader.read(inode, 2000, 100).await.unwrap();
    assert!(past_eof.is_empty());

    let missing = reader.read(999, 0, 10).await;
    assert!(missing.is_err());
}

/// Retrying FUSE_WRITE_CHUNK with the previously returned lock id yields
/// the same (chunk id, lock id) pair until the lock is committed.
#[tokio::test]
async fn write_chunk_is_idempotent_per_lock() {
    let master_addr = spawn_master().await;
    let (_cs, _store) = spawn_chunkserver(master_addr).await;
    let master = session(master_addr);

    let first = master.write_chunk(42, 0, 0).await.unwrap();
    let retry = master.write_chunk(42, 0, first.lock_id).await.unwrap();
    assert_eq!(retry.chunk_id, first.chunk_id);
    assert_eq!(retry.lock_id, first.lock_id);
    assert_eq!(retry.chunk_version, first.chunk_version);

    // a competing writer is turned away while the lock is held
    let competing = master.write_chunk(42, 0, 0).await;
    assert!(competing.is_err());

    master
        .write_chunk_end(first.chunk_id, first.lock_id, 42, 100)
        .await
        .unwrap();

    // after commit the next open mints a fresh lock and bumps the version
    let reopened = master.write_chunk(42, 0, 0).await.unwrap();
    assert_eq!(reopened.chunk_id, first.chunk_id);
    assert!(reopened.lock_id != first.lock_id);
    assert_eq!(reopened.chunk_version, first.chunk_version + 1);
}

/// A blocked lock acquire is answered with an interrupted status when the
/// matching interrupt packet arrives; the granted lock stays untouched.
#[tokio::test]
async fn blocked_setlk_can_be_interrupted() {
    let master_addr = spawn_master().await;

    let session_a = session(master_addr);
    let session_b = session(master_addr);

    let inode = 36;
    let status = session_a
        .setlk(
            inode,
            0xa,
            1,
            FlockWrapper::new(lock_op::EXCLUSIVE, 0, 10, 100),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::Ok);

    // B blocks on an overlapping range
    let blocked = {
        let session_b = session_b.clone();
        tokio::spawn(async move {
            session_b
                .setlk(
                    inode,
                    0xb,
                    77,
                    FlockWrapper::new(lock_op::EXCLUSIVE, 5, 10, 200),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    session_b
        .setlk_interrupt(InterruptData {
            owner: 0xb,
            inode,
            request_id: 77,
        })
        .await
        .unwrap();

    let status = blocked.await.unwrap().unwrap();
    assert_eq!(status, StatusCode::Interrupted);

    // A's lock survived: a non-blocking probe still conflicts
    let probe = session_b
        .setlk(
            inode,
            0xb,
            78,
            FlockWrapper::new(lock_op::EXCLUSIVE | lock_op::NONBLOCK, 0, 10, 200),
        )
        .await
        .unwrap();
    assert_eq!(probe, StatusCode::TryAgain);
}

/// A blocked acquire is granted once the conflicting lock is released.
#[tokio::test]
async fn blocked_setlk_is_granted_on_unlock() {
    let master_addr = spawn_master().await;
    let session_a = session(master_addr);
    let session_b = session(master_addr);

    let inode = 40;
    session_a
        .setlk(inode, 0xa, 1, FlockWrapper::new(lock_op::EXCLUSIVE, 0, 0, 100))
        .await
        .unwrap();

    let blocked = {
        let session_b = session_b.clone();
        tokio::spawn(async move {
            session_b
                .setlk(inode, 0xb, 2, FlockWrapper::new(lock_op::SHARED, 0, 0, 200))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    session_a
        .setlk(inode, 0xa, 3, FlockWrapper::new(lock_op::UNLOCK, 0, 0, 100))
        .await
        .unwrap();

    assert_eq!(blocked.await.unwrap().unwrap(), StatusCode::Ok);
}

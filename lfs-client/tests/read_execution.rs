//! Read plan execution against in-process chunkservers.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;

use lfs_api_types::{ChunkPartType, SliceType, StatusCode, LFS_BLOCK_SIZE};
use lfs_client::{
    ChunkConnector, ChunkserverStats, ExecutorTimeouts, ReadPlanExecutor, SliceReadPlanner,
};
use lfs_protocol::packet::Message;
use lfs_protocol::{cltocs, cstocl, ChunkserverAddress, PacketCodec};

const CHUNK_ID: u64 = 0x1234;
const CHUNK_VERSION: u32 = 7;

#[derive(Clone, Default)]
struct FakeChunkserver {
    parts: HashMap<ChunkPartType, Vec<u8>>,
    delay: Duration,
    corrupt_crc: bool,
}

impl FakeChunkserver {
    fn with_part(mut self, part: ChunkPartType, data: Vec<u8>) -> Self {
        self.parts.insert(part, data);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_corrupt_crc(mut self) -> Self {
        self.corrupt_crc = true;
        self
    }

    async fn spawn(self) -> ChunkserverAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };
        let server = Arc::new(self);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let mut framed = tokio_util::codec::Framed::new(stream, PacketCodec);
                    while let Some(Ok(packet)) = framed.next().await {
                        match packet.ptype {
                            cltocs::CLTOCS_READ => {
                                let request = cltocs::Read::from_packet(&packet).unwrap();
                                tokio::time::sleep(server.delay).await;
                                server.serve_read(&mut framed, request).await;
                            }
                            cltocs::CLTOCS_PREFETCH => {}
                            _ => return,
                        }
                    }
                });
            }
        });
        ChunkserverAddress::from(SocketAddrV4::new(*local.ip(), local.port()))
    }

    async fn serve_read(
        &self,
        framed: &mut tokio_util::codec::Framed<tokio::net::TcpStream, PacketCodec>,
        request: cltocs::Read,
    ) {
        let data = match self.parts.get(&request.part_type) {
            Some(data) => data,
            None => {
                let status = cstocl::ReadStatus {
                    chunk_id: request.chunk_id,
                    status: StatusCode::NoSuchChunk,
                };
                let _ = framed.send(status.to_packet()).await;
                return;
            }
        };

        let start = request.offset as usize;
        let end = (start + request.size as usize).min(data.len());
        let mut payload = data[start.min(data.len())..end].to_vec();
        payload.resize(request.size as usize, 0);

        let mut crc = crc32fast::hash(&payload);
        if self.corrupt_crc {
            crc ^= 0xdead;
        }
        let fragment = cstocl::ReadData {
            chunk_id: request.chunk_id,
            read_offset: request.offset,
            read_size: request.size,
            crc,
            data: Bytes::from(payload),
        };
        let _ = framed.send(fragment.to_packet()).await;
        let status = cstocl::ReadStatus {
            chunk_id: request.chunk_id,
            status: StatusCode::Ok,
        };
        let _ = framed.send(status.to_packet()).await;
    }
}

fn part(stype: SliceType, index: u8) -> ChunkPartType {
    ChunkPartType::new(stype, index).unwrap()
}

fn connector() -> ChunkConnector {
    ChunkConnector::new(Arc::new(ChunkserverStats::new()))
}

fn timeouts() -> ExecutorTimeouts {
    ExecutorTimeouts {
        connect_timeout: Duration::from_secs(1),
        wave_timeout: Duration::from_millis(300),
        total_timeout: Duration::from_secs(10),
    }
}

/// xor2 with data part 1 missing: wave 0 reads data part 0 and parity, the
/// post-processing chain xors the missing part into place.
#[tokio::test]
async fn xor_read_recovers_missing_part() {
    let stype = SliceType::Xor(2);
    let block = LFS_BLOCK_SIZE as usize;

    let data0: Vec<u8> = (0..block).map(|byte| byte as u8).collect();
    let data1: Vec<u8> = (0..block).map(|byte| (byte as u8).wrapping_mul(3)).collect();
    let parity: Vec<u8> = data0.iter().zip(&data1).map(|(a, b)| a ^ b).collect();

    let parity_server = FakeChunkserver::default()
        .with_part(part(stype, 0), parity)
        .spawn()
        .await;
    let data0_server = FakeChunkserver::default()
        .with_part(part(stype, 1), data0)
        .spawn()
        .await;

    let available = vec![part(stype, 0), part(stype, 1)];
    let addresses = vec![parity_server, data0_server];

    let mut planner = SliceReadPlanner::new();
    planner.prepare(stype, &[2], &available, &[], 2 * LFS_BLOCK_SIZE as u64);
    assert!(planner.is_reading_possible());
    let plan = planner.build_plan_for(0, 1);

    let mut executor = ReadPlanExecutor::new(CHUNK_ID, CHUNK_VERSION, plan);
    let mut buffer = Vec::new();
    executor
        .execute(&mut buffer, &addresses, &connector(), timeouts())
        .await
        .unwrap();

    assert_eq!(buffer.len(), block);
    assert_eq!(buffer, data1);
    assert!(executor.parts_failed().is_empty());
}

/// Replicated standard chunk with one slow server: the second wave-0 socket
/// answers first and the plan completes without waiting for the slow one.
#[tokio::test]
async fn slow_replica_does_not_stall_the_read() {
    let stype = SliceType::Standard;
    let block = LFS_BLOCK_SIZE as usize;
    let content: Vec<u8> = (0..block).map(|byte| byte as u8).collect();

    let slow = FakeChunkserver::default()
        .with_part(part(stype, 0), content.clone())
        .with_delay(Duration::from_secs(5))
        .spawn()
        .await;
    let fast = FakeChunkserver::default()
        .with_part(part(stype, 0), content.clone())
        .spawn()
        .await;

    let available = vec![part(stype, 0), part(stype, 0)];
    let addresses = vec![slow, fast];

    let mut planner = SliceReadPlanner::new();
    planner.prepare(stype, &[0], &available, &[], LFS_BLOCK_SIZE as u64);
    let plan = planner.build_plan_for(0, 1);
    // overuse 1.25 with one requested part puts both replicas in wave 0
    assert_eq!(
        plan.read_operations
            .iter()
            .filter(|operation| operation.op.wave == 0)
            .count(),
        2
    );

    let started = Instant::now();
    let mut executor = ReadPlanExecutor::new(CHUNK_ID, CHUNK_VERSION, plan);
    let mut buffer = Vec::new();
    executor
        .execute(&mut buffer, &addresses, &connector(), timeouts())
        .await
        .unwrap();

    assert_eq!(buffer, content);
    assert!(started.elapsed() < Duration::from_secs(4));
}

/// A corrupted fragment fails its operation; the executor escalates to the
/// next wave and finishes from the healthy replica.
#[tokio::test]
async fn crc_mismatch_fails_over_to_next_wave() {
    let stype = SliceType::Standard;
    let block = LFS_BLOCK_SIZE as usize;
    let content: Vec<u8> = (0..block).map(|byte| (byte as u8).wrapping_add(9)).collect();

    let corrupt = FakeChunkserver::default()
        .with_part(part(stype, 0), content.clone())
        .with_corrupt_crc()
        .spawn()
        .await;
    let corrupt_too = FakeChunkserver::default()
        .with_part(part(stype, 0), content.clone())
        .with_corrupt_crc()
        .spawn()
        .await;
    let healthy = FakeChunkserver::default()
        .with_part(part(stype, 0), content.clone())
        .spawn()
        .await;

    let available = vec![part(stype, 0), part(stype, 0), part(stype, 0)];
    let addresses = vec![corrupt, corrupt_too, healthy];

    let stats = Arc::new(ChunkserverStats::new());
    let connector = ChunkConnector::new(stats.clone());

    let mut planner = SliceReadPlanner::new();
    planner.prepare(stype, &[0], &available, &[], LFS_BLOCK_SIZE as u64);
    let plan = planner.build_plan_for(0, 1);

    let mut executor = ReadPlanExecutor::new(CHUNK_ID, CHUNK_VERSION, plan);
    let mut buffer = Vec::new();
    executor
        .execute(&mut buffer, &addresses, &connector, timeouts())
        .await
        .unwrap();

    assert_eq!(buffer, content);
    // the failing servers were reported to the stats registry
    assert!(stats.defects(addresses[0]) > 0);
}

/// When every source of a requested part is gone the executor fails fast
/// instead of waiting for the overall deadline.
#[tokio::test]
async fn unreachable_parts_fail_fast() {
    let stype = SliceType::Xor(2);

    // no servers are listening on these addresses
    let available = vec![part(stype, 1), part(stype, 2)];
    let addresses = vec![
        ChunkserverAddress {
            ip: 0x7f000001,
            port: 9,
        },
        ChunkserverAddress {
            ip: 0x7f000001,
            port: 10,
        },
    ];

    let mut planner = SliceReadPlanner::new();
    planner.prepare(stype, &[1, 2], &available, &[], 2 * LFS_BLOCK_SIZE as u64);
    let plan = planner.build_plan_for(0, 1);

    let started = Instant::now();
    let mut executor = ReadPlanExecutor::new(CHUNK_ID, CHUNK_VERSION, plan);
    let mut buffer = Vec::new();
    let result = executor
        .execute(
            &mut buffer,
            &addresses,
            &connector(),
            ExecutorTimeouts {
                connect_timeout: Duration::from_millis(500),
                wave_timeout: Duration::from_millis(200),
                total_timeout: Duration::from_secs(30),
            },
        )
        .await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!executor.parts_failed().is_empty());
}

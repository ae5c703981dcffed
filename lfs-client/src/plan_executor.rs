//! Read-plan execution.
//!
//! Drives a [ReadPlan] against the network: opens connections through the
//! pool, starts the operations of the current wave, collects CRC-checked
//! part data and escalates to the next wave when the per-wave timeout
//! elapses. Transient failures are resolved internally by switching to
//! alternate parts; only terminal outcomes surface. Servers which failed to
//! deliver are available through [ReadPlanExecutor::parts_failed] so the
//! caller can retry with fresh locations.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::time::Instant;

use lfs_api_types::ChunkPartType;
use lfs_protocol::packet::Message;
use lfs_protocol::{cltocs, cstocl, ChunkserverAddress};

use crate::connection_pool::ChunkConnector;
use crate::read_plan::{PlannedOperation, ReadPlan};

#[derive(Clone, Copy, Debug)]
pub struct ExecutorTimeouts {
    pub connect_timeout: Duration,
    pub wave_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for ExecutorTimeouts {
    fn default() -> Self {
        ExecutorTimeouts {
            connect_timeout: Duration::from_millis(1000),
            wave_timeout: Duration::from_millis(500),
            total_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum OpState {
    Pending,
    InFlight,
    Done,
    Failed,
}

pub struct ReadPlanExecutor {
    chunk_id: u64,
    chunk_version: u32,
    plan: ReadPlan,
    networking_failures: Vec<ChunkPartType>,
}

impl ReadPlanExecutor {
    pub fn new(chunk_id: u64, chunk_version: u32, plan: ReadPlan) -> Self {
        ReadPlanExecutor {
            chunk_id,
            chunk_version,
            plan,
            networking_failures: Vec::new(),
        }
    }

    pub fn plan(&self) -> &ReadPlan {
        &self.plan
    }

    /// Parts that could not be read during the last [Self::execute] call.
    pub fn parts_failed(&self) -> &[ChunkPartType] {
        &self.networking_failures
    }

    /// Execute the plan and append the post-processed result to `buffer`.
    pub async fn execute(
        &mut self,
        buffer: &mut Vec<u8>,
        locations: &[ChunkserverAddress],
        connector: &ChunkConnector,
        timeouts: ExecutorTimeouts,
    ) -> Result<(), Error> {
        self.networking_failures.clear();

        let total_deadline = Instant::now() + timeouts.total_timeout;
        let mut data = vec![0u8; self.plan.buffer_size().max(self.plan.result_size())];
        let mut states = vec![OpState::Pending; self.plan.read_operations.len()];
        let mut available: Vec<ChunkPartType> = Vec::new();
        let mut unreadable: Vec<ChunkPartType> = Vec::new();

        let mut reads: FuturesUnordered<LocalBoxFuture<(usize, Result<Vec<u8>, Error>)>> =
            FuturesUnordered::new();
        let mut prefetches: FuturesUnordered<LocalBoxFuture<()>> = FuturesUnordered::new();

        let mut current_wave = 0;
        self.start_wave(
            current_wave,
            &mut states,
            &mut reads,
            &mut prefetches,
            locations,
            connector,
            timeouts,
        )?;
        let mut wave_deadline = Instant::now() + timeouts.wave_timeout;

        loop {
            if self.plan.is_reading_finished(&available) {
                let produced = self.plan.post_process(&mut data, &available)?;
                buffer.extend_from_slice(&data[..produced]);
                return Ok(());
            }

            if reads.is_empty() {
                // nothing in flight: escalate immediately or give up
                if !self.start_next_wave(
                    &mut current_wave,
                    &mut states,
                    &mut reads,
                    &mut prefetches,
                    locations,
                    connector,
                    timeouts,
                )? {
                    bail!(
                        "chunk {:#x}: not enough chunk parts could be read",
                        self.chunk_id
                    );
                }
                wave_deadline = Instant::now() + timeouts.wave_timeout;
                continue;
            }

            let deadline = wave_deadline.min(total_deadline);
            tokio::select! {
                biased;
                completed = reads.next() => {
                    let (index, result) = completed.expect("reads is non-empty");
                    let operation = self.plan.read_operations[index];
                    let address = locations[operation.location];
                    match result {
                        Ok(bytes) => {
                            states[index] = OpState::Done;
                            let offset = operation.op.buffer_offset as usize;
                            data[offset..offset + bytes.len()].copy_from_slice(&bytes);
                            if !available.contains(&operation.part) {
                                available.push(operation.part);
                            }
                            connector.stats().register_success(address);
                        }
                        Err(err) => {
                            log::debug!(
                                "chunk {:#x}: reading part {} from {} failed: {:#}",
                                self.chunk_id, operation.part, address, err
                            );
                            states[index] = OpState::Failed;
                            connector.stats().register_defect(address);
                            if !self.networking_failures.contains(&operation.part) {
                                self.networking_failures.push(operation.part);
                            }
                            self.note_unreadable(&states, &available, &mut unreadable);
                            if !self.plan.is_finishing_possible(&unreadable) {
                                bail!(
                                    "chunk {:#x}: not enough chunk parts left to finish the read",
                                    self.chunk_id
                                );
                            }
                        }
                    }
                }
                _ = prefetches.next(), if !prefetches.is_empty() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if Instant::now() >= total_deadline {
                        // collect every part still outstanding as failed
                        for (index, state) in states.iter().enumerate() {
                            if *state == OpState::InFlight || *state == OpState::Pending {
                                let part = self.plan.read_operations[index].part;
                                if !self.networking_failures.contains(&part) {
                                    self.networking_failures.push(part);
                                }
                            }
                        }
                        bail!("chunk {:#x}: read deadline expired", self.chunk_id);
                    }
                    self.start_next_wave(
                        &mut current_wave,
                        &mut states,
                        &mut reads,
                        &mut prefetches,
                        locations,
                        connector,
                        timeouts,
                    )?;
                    wave_deadline = Instant::now() + timeouts.wave_timeout;
                }
            }
        }
    }

    /// Mark parts whose every planned operation failed as unreadable.
    fn note_unreadable(
        &self,
        states: &[OpState],
        available: &[ChunkPartType],
        unreadable: &mut Vec<ChunkPartType>,
    ) {
        for (index, operation) in self.plan.read_operations.iter().enumerate() {
            if states[index] != OpState::Failed {
                continue;
            }
            let part = operation.part;
            if available.contains(&part) || unreadable.contains(&part) {
                continue;
            }
            let all_failed = self
                .plan
                .read_operations
                .iter()
                .enumerate()
                .filter(|(_, other)| other.part == part)
                .all(|(other_index, _)| states[other_index] == OpState::Failed);
            if all_failed {
                unreadable.push(part);
            }
        }
    }

    /// Start the operations of `wave`. Also sends advisory prefetch hints
    /// for the following wave when the plan asks for it.
    #[allow(clippy::too_many_arguments)]
    fn start_wave<'a>(
        &self,
        wave: u32,
        states: &mut [OpState],
        reads: &mut FuturesUnordered<LocalBoxFuture<'a, (usize, Result<Vec<u8>, Error>)>>,
        prefetches: &mut FuturesUnordered<LocalBoxFuture<'a, ()>>,
        locations: &[ChunkserverAddress],
        connector: &'a ChunkConnector,
        timeouts: ExecutorTimeouts,
    ) -> Result<bool, Error> {
        let mut started = false;
        for (index, operation) in self.plan.read_operations.iter().enumerate() {
            if states[index] != OpState::Pending {
                continue;
            }
            if operation.op.wave <= wave {
                let address = *locations.get(operation.location).ok_or_else(|| {
                    format_err!("no location for part {}", operation.part)
                })?;
                states[index] = OpState::InFlight;
                started = true;
                let request = cltocs::Read {
                    chunk_id: self.chunk_id,
                    chunk_version: self.chunk_version,
                    part_type: operation.part,
                    offset: operation.op.request_offset,
                    size: operation.op.request_size,
                };
                reads.push(
                    run_read_operation(connector, address, request, timeouts.connect_timeout)
                        .map(move |result| (index, result))
                        .boxed_local(),
                );
            } else if self.plan.block_prefetch && operation.op.wave == wave + 1 {
                let address = match locations.get(operation.location) {
                    Some(address) => *address,
                    None => continue,
                };
                let hint = cltocs::Prefetch {
                    chunk_id: self.chunk_id,
                    chunk_version: self.chunk_version,
                    part_type: operation.part,
                    offset: operation.op.request_offset,
                    size: operation.op.request_size,
                };
                prefetches.push(
                    send_prefetch_hint(connector, address, hint, timeouts.connect_timeout)
                        .boxed_local(),
                );
            }
        }
        Ok(started)
    }

    #[allow(clippy::too_many_arguments)]
    fn start_next_wave<'a>(
        &self,
        current_wave: &mut u32,
        states: &mut [OpState],
        reads: &mut FuturesUnordered<LocalBoxFuture<'a, (usize, Result<Vec<u8>, Error>)>>,
        prefetches: &mut FuturesUnordered<LocalBoxFuture<'a, ()>>,
        locations: &[ChunkserverAddress],
        connector: &'a ChunkConnector,
        timeouts: ExecutorTimeouts,
    ) -> Result<bool, Error> {
        let last_wave = self
            .plan
            .read_operations
            .iter()
            .map(|operation| operation.op.wave)
            .max()
            .unwrap_or(0);
        while *current_wave < last_wave {
            *current_wave += 1;
            if self.start_wave(
                *current_wave,
                states,
                reads,
                prefetches,
                locations,
                connector,
                timeouts,
            )? {
                return Ok(true);
            }
        }
        Ok(!reads.is_empty())
    }
}

/// Fetch one part range: send the read request and collect the CRC-checked
/// data fragments until the closing status arrives.
async fn run_read_operation(
    connector: &ChunkConnector,
    address: ChunkserverAddress,
    request: cltocs::Read,
    connect_timeout: Duration,
) -> Result<Vec<u8>, Error> {
    // parts entirely past the end of the chunk need no network round trip
    if request.size == 0 {
        return Ok(Vec::new());
    }

    let mut connection = connector.connect(address, connect_timeout).await?;
    connection.send(request.to_packet()).await?;

    let mut collected = vec![0u8; request.size as usize];
    let mut received = 0u32;
    loop {
        let packet = match connection.next().await {
            Some(packet) => packet?,
            None => bail!("connection to {} closed mid-read", address),
        };
        match packet.ptype {
            cstocl::CSTOCL_READ_DATA => {
                let fragment = cstocl::ReadData::from_packet(&packet)?;
                if fragment.chunk_id != request.chunk_id {
                    bail!("read data for wrong chunk from {}", address);
                }
                if !fragment.crc_matches() {
                    bail!("crc mismatch in read data from {}", address);
                }
                let start = fragment
                    .read_offset
                    .checked_sub(request.offset)
                    .ok_or_else(|| format_err!("read data below requested range"))?;
                let end = start
                    .checked_add(fragment.read_size)
                    .filter(|end| *end <= request.size)
                    .ok_or_else(|| format_err!("read data beyond requested range"))?;
                if fragment.data.len() != fragment.read_size as usize {
                    bail!("read data length does not match its header");
                }
                collected[start as usize..end as usize].copy_from_slice(&fragment.data);
                received += fragment.read_size;
            }
            cstocl::CSTOCL_READ_STATUS => {
                let status = cstocl::ReadStatus::from_packet(&packet)?;
                if status.chunk_id != request.chunk_id {
                    bail!("read status for wrong chunk from {}", address);
                }
                status.status.into_result()?;
                if received < request.size {
                    bail!(
                        "short read from {}: got {} of {} bytes",
                        address,
                        received,
                        request.size
                    );
                }
                break;
            }
            other => bail!("unexpected packet {:#06x} from {}", other, address),
        }
    }

    connector.give_back(address, connection);
    Ok(collected)
}

async fn send_prefetch_hint(
    connector: &ChunkConnector,
    address: ChunkserverAddress,
    hint: cltocs::Prefetch,
    connect_timeout: Duration,
) {
    // purely advisory: errors are ignored
    if let Ok(mut connection) = connector.connect(address, connect_timeout).await {
        if connection.send(hint.to_packet()).await.is_ok() {
            connector.give_back(address, connection);
        }
    }
}

//! Composite entities carried inside message bodies.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use lfs_api_types::{ChunkPartType, MediaLabel};

use crate::ser::{WireGet, WirePut, WireResult};

/// IPv4 address and port of a chunkserver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkserverAddress {
    pub ip: u32,
    pub port: u16,
}

impl ChunkserverAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        ChunkserverAddress {
            ip: u32::from(ip),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port))
    }
}

impl From<SocketAddrV4> for ChunkserverAddress {
    fn from(addr: SocketAddrV4) -> Self {
        ChunkserverAddress::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for ChunkserverAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", Ipv4Addr::from(self.ip), self.port)
    }
}

impl WirePut for ChunkserverAddress {
    fn wire_len(&self) -> usize {
        6
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ip);
        buf.put_u16(self.port);
    }
}

impl WireGet for ChunkserverAddress {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(ChunkserverAddress {
            ip: u32::get(buf)?,
            port: u16::get(buf)?,
        })
    }
}

/// Where one chunk part lives, as reported by the master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartLocation {
    pub part_type: ChunkPartType,
    pub address: ChunkserverAddress,
    pub label: MediaLabel,
}

impl WirePut for PartLocation {
    fn wire_len(&self) -> usize {
        self.part_type.wire_len() + self.address.wire_len() + self.label.wire_len()
    }
    fn put(&self, buf: &mut BytesMut) {
        self.part_type.put(buf);
        self.address.put(buf);
        self.label.put(buf);
    }
}

impl WireGet for PartLocation {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(PartLocation {
            part_type: ChunkPartType::get(buf)?,
            address: ChunkserverAddress::get(buf)?,
            label: MediaLabel::get(buf)?,
        })
    }
}

/// One row of the chunkserver list served to the admin tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkserverListEntry {
    pub version: u32,
    pub address: ChunkserverAddress,
    pub label: MediaLabel,
    pub chunks: u64,
    pub used_space: u64,
    pub total_space: u64,
    pub error_counter: u32,
}

impl WirePut for ChunkserverListEntry {
    fn wire_len(&self) -> usize {
        4 + self.address.wire_len() + self.label.wire_len() + 8 + 8 + 8 + 4
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        self.address.put(buf);
        self.label.put(buf);
        buf.put_u64(self.chunks);
        buf.put_u64(self.used_space);
        buf.put_u64(self.total_space);
        buf.put_u32(self.error_counter);
    }
}

impl WireGet for ChunkserverListEntry {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(ChunkserverListEntry {
            version: u32::get(buf)?,
            address: ChunkserverAddress::get(buf)?,
            label: MediaLabel::get(buf)?,
            chunks: u64::get(buf)?,
            used_space: u64::get(buf)?,
            total_space: u64::get(buf)?,
            error_counter: u32::get(buf)?,
        })
    }
}

/// Goal id and name pair from the `list-goals` reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedGoal {
    pub id: u8,
    pub name: String,
    pub definition: String,
}

impl WirePut for SerializedGoal {
    fn wire_len(&self) -> usize {
        1 + self.name.wire_len() + self.definition.wire_len()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id);
        self.name.put(buf);
        self.definition.put(buf);
    }
}

impl WireGet for SerializedGoal {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(SerializedGoal {
            id: u8::get(buf)?,
            name: String::get(buf)?,
            definition: String::get(buf)?,
        })
    }
}

/// Installation wide statistics served to `lizardfs-admin info`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasterInfo {
    pub version: u32,
    pub memory_usage: u64,
    pub total_space: u64,
    pub available_space: u64,
    pub file_nodes: u64,
    pub chunks: u64,
    pub chunk_copies: u64,
    pub regular_copies: u64,
}

impl WirePut for MasterInfo {
    fn wire_len(&self) -> usize {
        4 + 7 * 8
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        buf.put_u64(self.memory_usage);
        buf.put_u64(self.total_space);
        buf.put_u64(self.available_space);
        buf.put_u64(self.file_nodes);
        buf.put_u64(self.chunks);
        buf.put_u64(self.chunk_copies);
        buf.put_u64(self.regular_copies);
    }
}

impl WireGet for MasterInfo {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(MasterInfo {
            version: u32::get(buf)?,
            memory_usage: u64::get(buf)?,
            total_space: u64::get(buf)?,
            available_space: u64::get(buf)?,
            file_nodes: u64::get(buf)?,
            chunks: u64::get(buf)?,
            chunk_copies: u64::get(buf)?,
            regular_copies: u64::get(buf)?,
        })
    }
}

/// Per-goal availability counters in the `chunks-health` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GoalAvailability {
    pub goal_id: u8,
    pub safe: u64,
    pub endangered: u64,
    pub lost: u64,
}

impl WirePut for GoalAvailability {
    fn wire_len(&self) -> usize {
        1 + 3 * 8
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.goal_id);
        buf.put_u64(self.safe);
        buf.put_u64(self.endangered);
        buf.put_u64(self.lost);
    }
}

impl WireGet for GoalAvailability {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(GoalAvailability {
            goal_id: u8::get(buf)?,
            safe: u64::get(buf)?,
            endangered: u64::get(buf)?,
            lost: u64::get(buf)?,
        })
    }
}

/// Per-goal replication counters in the `chunks-health` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GoalReplication {
    pub goal_id: u8,
    pub to_replicate: u64,
    pub to_delete: u64,
}

impl WirePut for GoalReplication {
    fn wire_len(&self) -> usize {
        1 + 2 * 8
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.goal_id);
        buf.put_u64(self.to_replicate);
        buf.put_u64(self.to_delete);
    }
}

impl WireGet for GoalReplication {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(GoalReplication {
            goal_id: u8::get(buf)?,
            to_replicate: u64::get(buf)?,
            to_delete: u64::get(buf)?,
        })
    }
}

/// One chunk part a registering chunkserver reports it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnedPart {
    pub chunk_id: u64,
    pub version: u32,
    pub part_type: ChunkPartType,
}

impl WirePut for OwnedPart {
    fn wire_len(&self) -> usize {
        8 + 4 + self.part_type.wire_len()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.version);
        self.part_type.put(buf);
    }
}

impl WireGet for OwnedPart {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(OwnedPart {
            chunk_id: u64::get(buf)?,
            version: u32::get(buf)?,
            part_type: ChunkPartType::get(buf)?,
        })
    }
}

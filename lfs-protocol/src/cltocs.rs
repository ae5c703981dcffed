//! Client to chunkserver messages.

use bytes::Bytes;

use lfs_api_types::ChunkPartType;

use crate::entities::ChunkserverAddress;
use crate::packet::define_message;

pub const CLTOCS_READ: u32 = 0x0601;
pub const CLTOCS_PREFETCH: u32 = 0x0602;
pub const CLTOCS_WRITE_INIT: u32 = 0x0603;
pub const CLTOCS_WRITE_DATA: u32 = 0x0604;
pub const CLTOCS_WRITE_END: u32 = 0x0605;

define_message!(
    /// Read `size` bytes of one chunk part starting at `offset`.
    Read, CLTOCS_READ, 0,
    chunk_id: u64,
    chunk_version: u32,
    part_type: ChunkPartType,
    offset: u32,
    size: u32,
);

define_message!(
    /// Advisory hint that the given range is likely to be read soon.
    Prefetch, CLTOCS_PREFETCH, 0,
    chunk_id: u64,
    chunk_version: u32,
    part_type: ChunkPartType,
    offset: u32,
    size: u32,
);

define_message!(
    /// Open a write chain. The addressed chunkserver forwards everything to
    /// `chain` and confirms write ids on this socket once the whole chain
    /// acknowledged them.
    WriteInit, CLTOCS_WRITE_INIT, 0,
    chunk_id: u64,
    chunk_version: u32,
    part_type: ChunkPartType,
    chain: Vec<ChunkserverAddress>,
);

define_message!(
    /// One write of up to a block, CRC-protected.
    WriteData, CLTOCS_WRITE_DATA, 0,
    chunk_id: u64,
    write_id: u32,
    block_number: u16,
    offset_in_block: u16,
    size: u32,
    crc: u32,
    data: Bytes,
);

define_message!(
    /// Close a write chain.
    WriteEnd, CLTOCS_WRITE_END, 0,
    chunk_id: u64,
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::Message;
    use lfs_api_types::SliceType;

    #[test]
    fn write_data_round_trip() {
        let msg = WriteData {
            chunk_id: 9,
            write_id: 4,
            block_number: 1,
            offset_in_block: 512,
            size: 3,
            crc: crc32fast::hash(b"abc"),
            data: Bytes::from_static(b"abc"),
        };
        let packet = msg.to_packet();
        let decoded = WriteData::from_packet(&packet).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.data, Bytes::from_static(b"abc"));
    }

    #[test]
    fn read_request_round_trip() {
        let msg = Read {
            chunk_id: 0x1234,
            chunk_version: 7,
            part_type: ChunkPartType::new(SliceType::Xor(2), 1).unwrap(),
            offset: 0,
            size: 65536,
        };
        assert_eq!(Read::from_packet(&msg.to_packet()).unwrap(), msg);
    }
}

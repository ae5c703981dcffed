//! Chunkserver to client messages.

use bytes::Bytes;

use lfs_api_types::StatusCode;

use crate::packet::define_message;

pub const CSTOCL_READ_DATA: u32 = 0x0701;
pub const CSTOCL_READ_STATUS: u32 = 0x0702;
pub const CSTOCL_WRITE_STATUS: u32 = 0x0703;

define_message!(
    /// One CRC-protected fragment of a part read. A single `CLTOCS_READ` is
    /// answered by any number of these followed by one `ReadStatus`.
    ReadData, CSTOCL_READ_DATA, 0,
    chunk_id: u64,
    read_offset: u32,
    read_size: u32,
    crc: u32,
    data: Bytes,
);

define_message!(
    /// Terminates a part read; non-ok status voids all delivered fragments.
    ReadStatus, CSTOCL_READ_STATUS, 0,
    chunk_id: u64,
    status: StatusCode,
);

define_message!(
    /// Acknowledges one `write_id` after the whole chain stored the data.
    WriteStatus, CSTOCL_WRITE_STATUS, 0,
    chunk_id: u64,
    write_id: u32,
    status: StatusCode,
);

impl ReadData {
    /// Verify the payload checksum.
    pub fn crc_matches(&self) -> bool {
        crc32fast::hash(&self.data) == self.crc
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::Message;

    #[test]
    fn read_data_crc() {
        let data = Bytes::from_static(b"block-payload");
        let msg = ReadData {
            chunk_id: 1,
            read_offset: 0,
            read_size: data.len() as u32,
            crc: crc32fast::hash(&data),
            data,
        };
        assert!(msg.crc_matches());
        let decoded = ReadData::from_packet(&msg.to_packet()).unwrap();
        assert!(decoded.crc_matches());

        let mut corrupted = decoded.clone();
        corrupted.crc ^= 1;
        assert!(!corrupted.crc_matches());
    }
}

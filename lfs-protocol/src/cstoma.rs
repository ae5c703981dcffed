//! Chunkserver to master messages (and the master's acks back).

use lfs_api_types::{MediaLabel, StatusCode};

use crate::entities::{ChunkserverAddress, OwnedPart};
use crate::packet::define_message;

pub const CSTOMA_REGISTER: u32 = 0x0801;
pub const CSTOMA_REGISTER_PARTS: u32 = 0x0802;
pub const CSTOMA_SPACE: u32 = 0x0803;

pub const MATOCS_REGISTER_ACK: u32 = 0x0901;

define_message!(
    /// Announce a chunkserver to the master. The address is the one clients
    /// should connect to for reads and writes.
    Register, CSTOMA_REGISTER, 0,
    address: ChunkserverAddress,
    label: MediaLabel,
    server_version: u32,
    used_space: u64,
    total_space: u64,
);

define_message!(
    /// Report the chunk parts stored on this chunkserver. The address
    /// repeats the one announced in [Register].
    RegisterParts, CSTOMA_REGISTER_PARTS, 0,
    address: ChunkserverAddress,
    parts: Vec<OwnedPart>,
);

define_message!(
    /// Periodic space usage refresh.
    Space, CSTOMA_SPACE, 0,
    address: ChunkserverAddress,
    used_space: u64,
    total_space: u64,
);

define_message!(
    RegisterAck, MATOCS_REGISTER_ACK, 0,
    status: StatusCode,
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::Message;
    use lfs_api_types::{ChunkPartType, SliceType};

    #[test]
    fn register_round_trip() {
        let msg = Register {
            address: ChunkserverAddress { ip: 0x0a000001, port: 9422 },
            label: MediaLabel::new("ssd").unwrap(),
            server_version: 0x030d00,
            used_space: 1 << 30,
            total_space: 1 << 40,
        };
        assert_eq!(Register::from_packet(&msg.to_packet()).unwrap(), msg);
    }

    #[test]
    fn register_parts_round_trip() {
        let msg = RegisterParts {
            address: ChunkserverAddress { ip: 0x0a000001, port: 9422 },
            parts: vec![OwnedPart {
                chunk_id: 7,
                version: 1,
                part_type: ChunkPartType::new(SliceType::Ec(3, 2), 4).unwrap(),
            }],
        };
        assert_eq!(RegisterParts::from_packet(&msg.to_packet()).unwrap(), msg);
    }
}

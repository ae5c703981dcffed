//! LizardFS wire protocol.
//!
//! Framing is `type:u32 || length:u32 || body`; bodies of `LIZ_*` style
//! messages begin with a `version:u32`. Integers are big-endian, strings are
//! length-prefixed without a trailing null. The message modules follow the
//! original identifier taxonomy:
//!
//! - [cltoma] / [matocl] - client <-> master
//! - [cltocs] / [cstocl] - client <-> chunkserver
//! - [cstoma] - chunkserver <-> master

pub mod ser;
pub use ser::{WireError, WireGet, WirePut, WireResult};

pub mod packet;
pub use packet::{Message, Packet, PacketCodec, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

pub mod entities;
pub use entities::*;

pub mod cltoma;
pub mod cltocs;
pub mod cstocl;
pub mod cstoma;
pub mod matocl;

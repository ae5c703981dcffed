//! Packet framing.
//!
//! Every packet on every connection is `type:u32 || length:u32 || body`,
//! where `length` counts the body bytes. Bodies of versioned messages begin
//! with a `version:u32` field so the protocol can evolve in place.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ser::{WireError, WireGet, WirePut, WireResult};

pub const PACKET_HEADER_SIZE: usize = 8;

/// Packets above this limit are structural errors; the connection is closed.
pub const MAX_PACKET_SIZE: u32 = 32 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: u32,
    pub length: u32,
}

/// A framed packet: header plus raw body bytes.
#[derive(Clone, Debug)]
pub struct Packet {
    pub ptype: u32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(ptype: u32, body: Bytes) -> Self {
        Packet { ptype, body }
    }

    /// Serialize a whole frame including the header.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.body.len());
        buf.put_u32(self.ptype);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// A typed message body behind a packet type and a body version.
pub trait Message: Sized {
    const TYPE: u32;
    const VERSION: u32;

    fn body_len(&self) -> usize;
    fn put_body(&self, buf: &mut BytesMut);
    fn get_body(buf: &mut Bytes) -> WireResult<Self>;

    fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::with_capacity(4 + self.body_len());
        buf.put_u32(Self::VERSION);
        self.put_body(&mut buf);
        Packet::new(Self::TYPE, buf.freeze())
    }

    fn from_packet(packet: &Packet) -> WireResult<Self> {
        if packet.ptype != Self::TYPE {
            return Err(WireError::BadType {
                expected: Self::TYPE,
                got: packet.ptype,
            });
        }
        let mut body = packet.body.clone();
        let version = u32::get(&mut body)?;
        if version != Self::VERSION {
            return Err(WireError::BadVersion {
                expected: Self::VERSION,
                got: version,
            });
        }
        let message = Self::get_body(&mut body)?;
        if body.has_remaining() {
            return Err(WireError::TrailingBytes(body.remaining()));
        }
        Ok(message)
    }
}

/// Declare a plain single-version message struct together with its wire
/// format: every listed field is serialized in order after the version.
macro_rules! define_message {
    (
        $(#[$attr:meta])*
        $name:ident, $ptype:expr, $version:expr $(, $field:ident : $ftype:ty)* $(,)?
    ) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $(pub $field: $ftype,)*
        }

        impl $crate::packet::Message for $name {
            const TYPE: u32 = $ptype;
            const VERSION: u32 = $version;

            fn body_len(&self) -> usize {
                0 $(+ $crate::ser::WirePut::wire_len(&self.$field))*
            }

            #[allow(unused_variables)]
            fn put_body(&self, buf: &mut bytes::BytesMut) {
                $($crate::ser::WirePut::put(&self.$field, buf);)*
            }

            #[allow(unused_variables)]
            fn get_body(buf: &mut bytes::Bytes) -> $crate::ser::WireResult<Self> {
                Ok($name {
                    $($field: $crate::ser::WireGet::get(buf)?,)*
                })
            }
        }
    };
}

pub(crate) use define_message;

/// Length-prefixed packet framing for tokio streams.
#[derive(Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &src[..PACKET_HEADER_SIZE];
        let ptype = header.get_u32();
        let length = header.get_u32();
        if length > MAX_PACKET_SIZE {
            return Err(WireError::LimitExceeded(length as u64));
        }
        if src.len() < PACKET_HEADER_SIZE + length as usize {
            src.reserve(PACKET_HEADER_SIZE + length as usize - src.len());
            return Ok(None);
        }
        src.advance(PACKET_HEADER_SIZE);
        let body = src.split_to(length as usize).freeze();
        Ok(Some(Packet::new(ptype, body)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = WireError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), WireError> {
        if packet.body.len() as u64 > MAX_PACKET_SIZE as u64 {
            return Err(WireError::LimitExceeded(packet.body.len() as u64));
        }
        dst.reserve(PACKET_HEADER_SIZE + packet.body.len());
        dst.put_u32(packet.ptype);
        dst.put_u32(packet.body.len() as u32);
        dst.put_slice(&packet.body);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let packet = Packet::new(0x0401, Bytes::from_static(b"\x00\x00\x00\x00payload"));
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(packet.clone(), &mut buf).unwrap();

        // a partial frame decodes to None and leaves the buffer intact
        let mut partial = BytesMut::from(&buf[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.ptype, packet.ptype);
        assert_eq!(decoded.body, packet.body);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x0401);
        buf.put_u32(MAX_PACKET_SIZE + 1);
        let mut codec = PacketCodec;
        assert!(codec.decode(&mut buf).is_err());
    }
}

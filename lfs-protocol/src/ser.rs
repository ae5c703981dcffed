//! Big-endian wire serialization.
//!
//! All integers travel big-endian. Strings are length-prefixed with no
//! trailing byte: plain `String` carries a `u32` length, [MediaLabel] a `u8`
//! length. Vectors carry a `u32` element count. Deserialization enforces
//! global limits so a malformed length field cannot run the peer out of
//! memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use lfs_api_types::{
    Ace, AceType, ChunkPartType, FlockWrapper, InterruptData, LockInfo, MediaLabel, RichAcl,
    SliceType, StatusCode,
};

/// Upper bound for a single deserialized buffer.
pub const MAX_DESERIALIZED_BYTES: u32 = 32 * 1024 * 1024;

/// Upper bound for a single deserialized element count.
pub const MAX_DESERIALIZED_ELEMENTS: u32 = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("message carries {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("unexpected packet version {got} (expected {expected})")]
    BadVersion { expected: u32, got: u32 },
    #[error("unexpected packet type {got:#06x} (expected {expected:#06x})")]
    BadType { expected: u32, got: u32 },
    #[error("length limit violated: {0}")]
    LimitExceeded(u64),
    #[error("malformed field: {0}")]
    Invalid(String),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type WireResult<T> = Result<T, WireError>;

/// Wire encoding of a value.
pub trait WirePut {
    fn wire_len(&self) -> usize;
    fn put(&self, buf: &mut BytesMut);
}

/// Wire decoding of a value.
pub trait WireGet: Sized {
    fn get(buf: &mut Bytes) -> WireResult<Self>;
}

fn need(buf: &Bytes, len: usize) -> WireResult<()> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

macro_rules! wire_int {
    ($int:ty, $put:ident, $get:ident, $len:expr) => {
        impl WirePut for $int {
            fn wire_len(&self) -> usize {
                $len
            }
            fn put(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }
        impl WireGet for $int {
            fn get(buf: &mut Bytes) -> WireResult<Self> {
                need(buf, $len)?;
                Ok(buf.$get())
            }
        }
    };
}

wire_int!(u8, put_u8, get_u8, 1);
wire_int!(u16, put_u16, get_u16, 2);
wire_int!(u32, put_u32, get_u32, 4);
wire_int!(u64, put_u64, get_u64, 8);
wire_int!(i16, put_i16, get_i16, 2);
wire_int!(i32, put_i32, get_i32, 4);
wire_int!(i64, put_i64, get_i64, 8);

impl WirePut for bool {
    fn wire_len(&self) -> usize {
        1
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireGet for bool {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(u8::get(buf)? != 0)
    }
}

impl WirePut for String {
    fn wire_len(&self) -> usize {
        4 + self.len()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }
}

impl WireGet for String {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let len = u32::get(buf)?;
        if len > MAX_DESERIALIZED_BYTES {
            return Err(WireError::LimitExceeded(len as u64));
        }
        need(buf, len as usize)?;
        let raw = buf.copy_to_bytes(len as usize);
        String::from_utf8(raw.to_vec())
            .map_err(|_| WireError::Invalid("string is not valid utf-8".into()))
    }
}

impl<T: WirePut> WirePut for Vec<T> {
    fn wire_len(&self) -> usize {
        4 + self.iter().map(WirePut::wire_len).sum::<usize>()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for item in self {
            item.put(buf);
        }
    }
}

impl<T: WireGet> WireGet for Vec<T> {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let count = u32::get(buf)?;
        if count > MAX_DESERIALIZED_ELEMENTS {
            return Err(WireError::LimitExceeded(count as u64));
        }
        let mut items = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            items.push(T::get(buf)?);
        }
        Ok(items)
    }
}

// raw byte payloads are the message tail; their length travels in a
// dedicated size field of the respective message
impl WirePut for Bytes {
    fn wire_len(&self) -> usize {
        self.len()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl WireGet for Bytes {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(buf.split_off(0))
    }
}

impl WirePut for StatusCode {
    fn wire_len(&self) -> usize {
        1
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(*self as u8);
    }
}

impl WireGet for StatusCode {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let value = u8::get(buf)?;
        StatusCode::from_u8(value).ok_or(WireError::UnknownStatus(value))
    }
}

impl WirePut for SliceType {
    fn wire_len(&self) -> usize {
        2
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id());
    }
}

impl WireGet for SliceType {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let id = u16::get(buf)?;
        SliceType::from_id(id).map_err(|err| WireError::Invalid(err.to_string()))
    }
}

impl WirePut for ChunkPartType {
    fn wire_len(&self) -> usize {
        3
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.slice_type().id());
        buf.put_u8(self.index());
    }
}

impl WireGet for ChunkPartType {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let stype = SliceType::get(buf)?;
        let index = u8::get(buf)?;
        ChunkPartType::new(stype, index).map_err(|err| WireError::Invalid(err.to_string()))
    }
}

impl WirePut for MediaLabel {
    fn wire_len(&self) -> usize {
        1 + self.as_str().len()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.as_str().len() as u8);
        buf.put_slice(self.as_str().as_bytes());
    }
}

impl WireGet for MediaLabel {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let len = u8::get(buf)? as usize;
        need(buf, len)?;
        let raw = buf.copy_to_bytes(len);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| WireError::Invalid("media label is not valid utf-8".into()))?;
        MediaLabel::new(text).map_err(|err| WireError::Invalid(err.to_string()))
    }
}

impl WirePut for FlockWrapper {
    fn wire_len(&self) -> usize {
        2 + 8 + 8 + 4
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.l_type);
        buf.put_u64(self.l_start);
        buf.put_u64(self.l_len);
        buf.put_u32(self.l_pid);
    }
}

impl WireGet for FlockWrapper {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(FlockWrapper {
            l_type: u16::get(buf)?,
            l_start: u64::get(buf)?,
            l_len: u64::get(buf)?,
            l_pid: u32::get(buf)?,
        })
    }
}

impl WirePut for LockInfo {
    fn wire_len(&self) -> usize {
        4 + 8 + 4 + 2 + 8 + 8
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.inode);
        buf.put_u64(self.owner);
        buf.put_u32(self.session_id);
        buf.put_u16(self.lock_type);
        buf.put_u64(self.start);
        buf.put_u64(self.end);
    }
}

impl WireGet for LockInfo {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(LockInfo {
            inode: u32::get(buf)?,
            owner: u64::get(buf)?,
            session_id: u32::get(buf)?,
            lock_type: u16::get(buf)?,
            start: u64::get(buf)?,
            end: u64::get(buf)?,
        })
    }
}

impl WirePut for InterruptData {
    fn wire_len(&self) -> usize {
        8 + 4 + 4
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64(self.owner);
        buf.put_u32(self.inode);
        buf.put_u32(self.request_id);
    }
}

impl WireGet for InterruptData {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        Ok(InterruptData {
            owner: u64::get(buf)?,
            inode: u32::get(buf)?,
            request_id: u32::get(buf)?,
        })
    }
}

impl WirePut for Ace {
    fn wire_len(&self) -> usize {
        1 + 2 + 4 + 4
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.acetype as u8);
        buf.put_u16(self.flags);
        buf.put_u32(self.mask);
        buf.put_u32(self.id);
    }
}

impl WireGet for Ace {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let acetype = match u8::get(buf)? {
            0 => AceType::Allow,
            1 => AceType::Deny,
            other => return Err(WireError::Invalid(format!("unknown ace type {}", other))),
        };
        Ok(Ace {
            acetype,
            flags: u16::get(buf)?,
            mask: u32::get(buf)?,
            id: u32::get(buf)?,
        })
    }
}

impl WirePut for RichAcl {
    fn wire_len(&self) -> usize {
        4 + 4 + 4 + 2 + 4 + self.aces().iter().map(WirePut::wire_len).sum::<usize>()
    }
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.owner_mask());
        buf.put_u32(self.group_mask());
        buf.put_u32(self.other_mask());
        buf.put_u16(self.flags());
        buf.put_u32(self.aces().len() as u32);
        for ace in self.aces() {
            ace.put(buf);
        }
    }
}

impl WireGet for RichAcl {
    fn get(buf: &mut Bytes) -> WireResult<Self> {
        let owner_mask = u32::get(buf)?;
        let group_mask = u32::get(buf)?;
        let other_mask = u32::get(buf)?;
        let flags = u16::get(buf)?;
        let aces = Vec::<Ace>::get(buf)?;
        Ok(RichAcl::from_parts(
            owner_mask, group_mask, other_mask, flags, aces,
        ))
    }
}

macro_rules! wire_tuple {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: WirePut),+> WirePut for ($($name,)+) {
            fn wire_len(&self) -> usize {
                0 $(+ self.$index.wire_len())+
            }
            fn put(&self, buf: &mut BytesMut) {
                $(self.$index.put(buf);)+
            }
        }
        impl<$($name: WireGet),+> WireGet for ($($name,)+) {
            fn get(buf: &mut Bytes) -> WireResult<Self> {
                Ok(($($name::get(buf)?,)+))
            }
        }
    };
}

wire_tuple!(A: 0, B: 1);
wire_tuple!(A: 0, B: 1, C: 2);
wire_tuple!(A: 0, B: 1, C: 2, D: 3);

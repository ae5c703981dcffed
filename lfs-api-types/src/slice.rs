//! Slice and chunk part types.
//!
//! A chunk is realized as one or more *parts*, each stored on a different
//! chunkserver. The slice type describes how the chunk data is distributed
//! over its parts:
//!
//! - `std` - a single part carrying the whole chunk
//! - `tape` - a single archival part
//! - `xorN` - N data parts plus one parity part (part 0 is the parity)
//! - `ec(k,m)` - k data parts followed by m parity parts (Reed-Solomon)

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

/// Size of a single block inside a chunk part.
pub const LFS_BLOCK_SIZE: u32 = 64 * 1024;

/// Number of blocks in a whole chunk.
pub const LFS_BLOCKS_IN_CHUNK: u32 = 1024;

/// Maximum size of a whole chunk (64 MiB).
pub const LFS_CHUNK_SIZE: u64 = LFS_BLOCK_SIZE as u64 * LFS_BLOCKS_IN_CHUNK as u64;

/// Highest xor level supported by the legacy xor layer.
pub const MAX_XOR_LEVEL: u8 = 9;
pub const MIN_XOR_LEVEL: u8 = 2;

/// Upper bound on parts in a xor slice (9 data + 1 parity, one spare id).
pub const MAX_XOR_PARTS: usize = 11;

/// Upper bound on `k + m` for erasure coded slices.
pub const MAX_EC_PARTS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SliceType {
    Standard,
    Tape,
    Xor(u8),
    Ec(u8, u8),
}

impl SliceType {
    /// Total number of parts a slice of this type consists of.
    pub fn parts_count(&self) -> usize {
        match self {
            SliceType::Standard | SliceType::Tape => 1,
            SliceType::Xor(level) => *level as usize + 1,
            SliceType::Ec(k, m) => *k as usize + *m as usize,
        }
    }

    /// Number of data parts (parts holding chunk bytes rather than parity).
    pub fn data_parts(&self) -> usize {
        match self {
            SliceType::Standard | SliceType::Tape => 1,
            SliceType::Xor(level) => *level as usize,
            SliceType::Ec(k, _) => *k as usize,
        }
    }

    pub fn parity_parts(&self) -> usize {
        self.parts_count() - self.data_parts()
    }

    /// How many arbitrary parts suffice to reconstruct the whole chunk.
    pub fn required_parts_to_recover(&self) -> usize {
        self.data_parts()
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, SliceType::Standard)
    }

    pub fn is_xor(&self) -> bool {
        matches!(self, SliceType::Xor(_))
    }

    pub fn is_ec(&self) -> bool {
        matches!(self, SliceType::Ec(..))
    }

    /// Blocks held by the widest part of this slice for a chunk of
    /// `chunk_length` bytes. Individual data parts may hold one block less,
    /// see [ChunkPartType::block_count].
    pub fn blocks_per_part(&self, chunk_length: u64) -> u32 {
        let blocks = chunk_blocks(chunk_length);
        let data = self.data_parts() as u32;
        blocks.div_ceil(data)
    }

    pub fn is_valid(&self) -> bool {
        match self {
            SliceType::Standard | SliceType::Tape => true,
            SliceType::Xor(level) => (MIN_XOR_LEVEL..=MAX_XOR_LEVEL).contains(level),
            SliceType::Ec(k, m) => {
                *k >= 2 && *m >= 1 && (*k as usize + *m as usize) <= MAX_EC_PARTS
            }
        }
    }

    /// Numeric wire id. Ids 0-9 match the legacy slice type table
    /// (std, tape, xor2..xor9); erasure coded types occupy the high half of
    /// the id space with k and m packed into the low bits.
    pub fn id(&self) -> u16 {
        match self {
            SliceType::Standard => 0,
            SliceType::Tape => 1,
            SliceType::Xor(level) => *level as u16,
            SliceType::Ec(k, m) => 0x8000 | ((*k as u16) << 5) | (*m as u16),
        }
    }

    pub fn from_id(id: u16) -> Result<Self, Error> {
        let stype = match id {
            0 => SliceType::Standard,
            1 => SliceType::Tape,
            n if (2..=MAX_XOR_LEVEL as u16).contains(&n) => SliceType::Xor(n as u8),
            n if n & 0x8000 != 0 => {
                SliceType::Ec(((n >> 5) & 0x3ff) as u8, (n & 0x1f) as u8)
            }
            n => bail!("invalid slice type id {}", n),
        };
        if !stype.is_valid() {
            bail!("invalid slice type id {}", id);
        }
        Ok(stype)
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SliceType::Standard => write!(f, "std"),
            SliceType::Tape => write!(f, "tape"),
            SliceType::Xor(level) => write!(f, "xor{}", level),
            SliceType::Ec(k, m) => write!(f, "ec({},{})", k, m),
        }
    }
}

impl FromStr for SliceType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let stype = match text {
            "std" => SliceType::Standard,
            "tape" => SliceType::Tape,
            other => {
                if let Some(level) = other.strip_prefix("xor") {
                    SliceType::Xor(level.parse()?)
                } else if let Some(params) = other
                    .strip_prefix("ec(")
                    .and_then(|rest| rest.strip_suffix(')'))
                {
                    let (k, m) = params
                        .split_once(',')
                        .ok_or_else(|| format_err!("invalid ec slice type '{}'", text))?;
                    SliceType::Ec(k.trim().parse()?, m.trim().parse()?)
                } else {
                    bail!("unknown slice type '{}'", text);
                }
            }
        };
        if !stype.is_valid() {
            bail!("invalid slice type '{}'", text);
        }
        Ok(stype)
    }
}

/// One part of one slice: (slice type, 0-based part index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkPartType {
    stype: SliceType,
    index: u8,
}

impl ChunkPartType {
    pub fn new(stype: SliceType, index: u8) -> Result<Self, Error> {
        if (index as usize) >= stype.parts_count() {
            bail!("part index {} out of range for slice type {}", index, stype);
        }
        Ok(ChunkPartType { stype, index })
    }

    pub fn slice_type(&self) -> SliceType {
        self.stype
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// True for parity parts which carry no chunk bytes of their own.
    pub fn is_parity(&self) -> bool {
        match self.stype {
            SliceType::Standard | SliceType::Tape => false,
            SliceType::Xor(_) => self.index == 0,
            SliceType::Ec(k, _) => self.index >= k,
        }
    }

    /// Index into the stripe of data parts. None for parity parts.
    pub fn data_index(&self) -> Option<u32> {
        match self.stype {
            SliceType::Standard | SliceType::Tape => Some(0),
            SliceType::Xor(_) => {
                if self.index == 0 {
                    None
                } else {
                    Some(self.index as u32 - 1)
                }
            }
            SliceType::Ec(k, _) => {
                if self.index >= k {
                    None
                } else {
                    Some(self.index as u32)
                }
            }
        }
    }

    /// Exact number of blocks this part holds for a chunk of `chunk_length`
    /// bytes. Data part `d` holds the blocks with index congruent to `d`
    /// modulo the stripe width; parity parts are as wide as the widest data
    /// part.
    pub fn block_count(&self, chunk_length: u64) -> u32 {
        let blocks = chunk_blocks(chunk_length);
        let stripe = self.stype.data_parts() as u32;
        match self.data_index() {
            Some(d) => (blocks.saturating_sub(d)).div_ceil(stripe),
            None => blocks.div_ceil(stripe),
        }
    }
}

impl fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.stype {
            SliceType::Standard | SliceType::Tape => write!(f, "{}", self.stype),
            _ => write!(f, "{}/{}", self.stype, self.index),
        }
    }
}

/// Number of blocks needed to hold `chunk_length` bytes.
pub fn chunk_blocks(chunk_length: u64) -> u32 {
    debug_assert!(chunk_length <= LFS_CHUNK_SIZE);
    chunk_length.div_ceil(LFS_BLOCK_SIZE as u64) as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slice_type_part_counts() {
        assert_eq!(SliceType::Standard.parts_count(), 1);
        assert_eq!(SliceType::Xor(3).parts_count(), 4);
        assert_eq!(SliceType::Xor(3).data_parts(), 3);
        assert_eq!(SliceType::Ec(3, 2).parts_count(), 5);
        assert_eq!(SliceType::Ec(3, 2).required_parts_to_recover(), 3);
    }

    #[test]
    fn slice_type_id_round_trip() {
        for stype in [
            SliceType::Standard,
            SliceType::Tape,
            SliceType::Xor(2),
            SliceType::Xor(9),
            SliceType::Ec(2, 1),
            SliceType::Ec(3, 2),
            SliceType::Ec(17, 15),
        ] {
            assert_eq!(SliceType::from_id(stype.id()).unwrap(), stype);
        }
        assert!(SliceType::from_id(10).is_err());
        assert!(SliceType::from_id(0x8000).is_err());
    }

    #[test]
    fn slice_type_string_round_trip() {
        for text in ["std", "tape", "xor5", "ec(3,2)"] {
            let stype: SliceType = text.parse().unwrap();
            assert_eq!(stype.to_string(), text);
        }
        assert!("xor1".parse::<SliceType>().is_err());
        assert!("ec(40,40)".parse::<SliceType>().is_err());
    }

    #[test]
    fn part_block_counts() {
        // 5 blocks striped over xor2: data part 0 gets blocks 0,2,4,
        // data part 1 gets blocks 1,3, parity is as wide as part 0.
        let len = 5 * LFS_BLOCK_SIZE as u64;
        let parity = ChunkPartType::new(SliceType::Xor(2), 0).unwrap();
        let data0 = ChunkPartType::new(SliceType::Xor(2), 1).unwrap();
        let data1 = ChunkPartType::new(SliceType::Xor(2), 2).unwrap();
        assert_eq!(parity.block_count(len), 3);
        assert_eq!(data0.block_count(len), 3);
        assert_eq!(data1.block_count(len), 2);

        let whole = ChunkPartType::new(SliceType::Standard, 0).unwrap();
        assert_eq!(whole.block_count(len), 5);
        assert_eq!(whole.block_count(0), 0);
    }

    #[test]
    fn part_index_is_validated() {
        assert!(ChunkPartType::new(SliceType::Xor(2), 3).is_err());
        assert!(ChunkPartType::new(SliceType::Standard, 1).is_err());
        assert!(ChunkPartType::new(SliceType::Ec(3, 2), 4).is_ok());
    }

    #[test]
    fn parity_classification() {
        assert!(ChunkPartType::new(SliceType::Xor(2), 0).unwrap().is_parity());
        assert!(!ChunkPartType::new(SliceType::Xor(2), 1).unwrap().is_parity());
        assert!(!ChunkPartType::new(SliceType::Ec(3, 2), 2).unwrap().is_parity());
        assert!(ChunkPartType::new(SliceType::Ec(3, 2), 3).unwrap().is_parity());
    }
}

//! Goals: named replication policies.
//!
//! A goal is an ordered collection of slices. Each slice lists, for every
//! part index, how many copies should be kept and on which media labels.
//! The wildcard label `_` matches any chunkserver.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use crate::slice::SliceType;

pub const MEDIA_LABEL_MAX_LEN: usize = 32;

/// String classifier of a chunkserver's storage medium.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MediaLabel(String);

impl MediaLabel {
    pub const WILDCARD: &'static str = "_";

    pub fn wildcard() -> Self {
        MediaLabel(Self::WILDCARD.to_string())
    }

    pub fn new(label: &str) -> Result<Self, Error> {
        if !Self::is_valid(label) {
            bail!("invalid media label '{}'", label);
        }
        Ok(MediaLabel(label.to_string()))
    }

    pub fn is_valid(label: &str) -> bool {
        !label.is_empty()
            && label.len() <= MEDIA_LABEL_MAX_LEN
            && label
                .bytes()
                .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_')
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if a part stored on medium `other` satisfies this label.
    pub fn matches(&self, other: &MediaLabel) -> bool {
        self.is_wildcard() || self == other
    }
}

impl fmt::Display for MediaLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaLabel {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        MediaLabel::new(text)
    }
}

/// Requested copy counts per media label, sorted by label.
pub type Labels = Vec<(MediaLabel, u16)>;

fn labels_count(labels: &Labels) -> u32 {
    labels.iter().map(|(_, count)| *count as u32).sum()
}

/// One slice of a goal: the slice type plus one label multiset per part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    stype: SliceType,
    parts: Vec<Labels>,
}

impl Slice {
    pub fn new(stype: SliceType) -> Self {
        Slice {
            stype,
            parts: vec![Labels::new(); stype.parts_count()],
        }
    }

    pub fn slice_type(&self) -> SliceType {
        self.stype
    }

    pub fn parts(&self) -> &[Labels] {
        &self.parts
    }

    pub fn part(&self, index: usize) -> &Labels {
        &self.parts[index]
    }

    pub fn set_label(&mut self, part: usize, label: MediaLabel, count: u16) {
        let labels = &mut self.parts[part];
        match labels.binary_search_by(|(have, _)| have.cmp(&label)) {
            Ok(pos) => labels[pos].1 = count,
            Err(pos) => labels.insert(pos, (label, count)),
        }
    }

    /// Valid iff every part requests at least one copy.
    pub fn is_valid(&self) -> bool {
        self.parts.len() == self.stype.parts_count()
            && self.parts.iter().all(|labels| labels_count(labels) > 0)
    }

    pub fn expected_copies(&self) -> u32 {
        self.parts.iter().map(labels_count).sum()
    }

    /// Per-label union with `other`, keeping the higher copy count.
    pub fn merge_in(&mut self, other: &Slice) {
        assert_eq!(self.stype, other.stype);
        for (labels, other_labels) in self.parts.iter_mut().zip(other.parts.iter()) {
            for (label, count) in other_labels {
                match labels.binary_search_by(|(have, _)| have.cmp(label)) {
                    Ok(pos) => labels[pos].1 = labels[pos].1.max(*count),
                    Err(pos) => labels.insert(pos, (label.clone(), *count)),
                }
            }
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {{", self.stype)?;
        // identical label groups collapse into one group covering all parts
        let groups = if self.parts.windows(2).all(|pair| pair[0] == pair[1]) {
            &self.parts[..1]
        } else {
            &self.parts[..]
        };
        for (index, labels) in groups.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            for (pos, (label, count)) in labels.iter().enumerate() {
                if pos > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{} {}", label, count)?;
            }
        }
        write!(f, "}}")
    }
}

/// Numeric goal id, valid in the range 1..=40.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GoalId(u8);

impl GoalId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 40;

    pub fn new(id: u8) -> Result<Self, Error> {
        if !(Self::MIN..=Self::MAX).contains(&id) {
            bail!("goal id {} out of range", id);
        }
        Ok(GoalId(id))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named replication policy: an ordered set of slices, at most one per
/// slice type.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Goal {
    name: String,
    slices: Vec<Slice>,
}

impl Goal {
    /// Hard cap on copies a single goal may request.
    pub const MAX_EXPECTED_COPIES: u32 = 30;

    pub fn new(name: &str) -> Result<Self, Error> {
        if !Self::is_name_valid(name) {
            bail!("invalid goal name '{}'", name);
        }
        Ok(Goal {
            name: name.to_string(),
            slices: Vec::new(),
        })
    }

    /// Goal names use the same alphabet as media labels.
    pub fn is_name_valid(name: &str) -> bool {
        MediaLabel::is_valid(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn find(&self, stype: SliceType) -> Option<&Slice> {
        self.slices.iter().find(|slice| slice.slice_type() == stype)
    }

    /// Insert or replace the slice for its type, keeping slices ordered.
    pub fn set_slice(&mut self, slice: Slice) {
        match self
            .slices
            .binary_search_by(|have| have.slice_type().cmp(&slice.slice_type()))
        {
            Ok(pos) => self.slices[pos] = slice,
            Err(pos) => self.slices.insert(pos, slice),
        }
    }

    pub fn merge_in(&mut self, other: &Goal) {
        for slice in &other.slices {
            match self
                .slices
                .binary_search_by(|have| have.slice_type().cmp(&slice.slice_type()))
            {
                Ok(pos) => self.slices[pos].merge_in(slice),
                Err(pos) => self.slices.insert(pos, slice.clone()),
            }
        }
    }

    pub fn expected_copies(&self) -> u32 {
        self.slices.iter().map(Slice::expected_copies).sum()
    }

    pub fn is_valid(&self) -> bool {
        !self.slices.is_empty()
            && self.slices.iter().all(Slice::is_valid)
            && self.expected_copies() <= Self::MAX_EXPECTED_COPIES
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: ", self.name)?;
        for (pos, slice) in self.slices.iter().enumerate() {
            if pos > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", slice)?;
        }
        Ok(())
    }
}

impl FromStr for Goal {
    type Err = Error;

    /// Parses the `name: std {A 2, _ 1} | xor3 {_ 4}` form produced by
    /// [Goal::fmt]. A slice body either lists per-part groups separated by
    /// `;`, or one group which is then replicated to every part.
    fn from_str(text: &str) -> Result<Self, Error> {
        let (name, body) = text
            .split_once(':')
            .ok_or_else(|| format_err!("goal definition '{}' lacks a name", text))?;
        let mut goal = Goal::new(name.trim())?;

        for slice_text in body.split('|') {
            let slice_text = slice_text.trim();
            let (type_text, rest) = slice_text
                .split_once('{')
                .ok_or_else(|| format_err!("slice definition '{}' lacks labels", slice_text))?;
            let labels_text = rest
                .strip_suffix('}')
                .ok_or_else(|| format_err!("unterminated slice definition '{}'", slice_text))?;

            let stype: SliceType = type_text.trim().parse()?;
            let mut slice = Slice::new(stype);

            let groups: Vec<&str> = labels_text.split(';').map(str::trim).collect();
            if groups.len() != 1 && groups.len() != stype.parts_count() {
                bail!(
                    "slice '{}' lists {} label groups, expected 1 or {}",
                    slice_text,
                    groups.len(),
                    stype.parts_count()
                );
            }

            for part in 0..stype.parts_count() {
                let group = if groups.len() == 1 { groups[0] } else { groups[part] };
                for entry in group.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    let (label, count) = match entry.split_once(' ') {
                        Some((label, count)) => (label.trim(), count.trim().parse()?),
                        None => (entry, 1),
                    };
                    slice.set_label(part, label.parse()?, count);
                }
            }

            if !slice.is_valid() {
                bail!("slice '{}' leaves a part without labels", slice_text);
            }
            goal.set_slice(slice);
        }

        if !goal.is_valid() {
            bail!("goal '{}' is not valid", name.trim());
        }
        Ok(goal)
    }
}

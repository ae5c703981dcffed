//! NFSv4 style rich access control lists.
//!
//! A rich ACL is an ordered list of allow/deny entries plus three file masks
//! (owner, group, other). When the `MASKED` flag is set the masks constrain
//! the entries, so that the mode bits derived from the masks always equal the
//! masked projection of the effective entries. [RichAcl::apply_masks]
//! rewrites the entry list so a plain NFSv4 permission check computes the
//! same decisions without knowing about the masks.
//!
//! The string form is `FLAGS|OWNER_MASK|GROUP_MASK|OTHER_MASK|ACE/ACE/...`
//! with every entry encoded as `MASK:FLAGS:TYPE:IDENTIFIER`. Parsing
//! `|rwxcC|rwxcC|rwxcC|r::D:u1000/wxC::A:g1000/rwxcC::A:E/` yields a deny
//! entry for uid 1000, an allow entry for gid 1000 and an allow entry for
//! everyone.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};

use crate::acl::{AclEntryKind, PosixAcl};

/// ACL mode flags.
pub const ACL_AUTO_INHERIT: u16 = 0x01;
pub const ACL_PROTECTED: u16 = 0x02;
pub const ACL_DEFAULTED: u16 = 0x04;
pub const ACL_AUTO_SET_MODE: u16 = 0x20;
pub const ACL_WRITE_THROUGH: u16 = 0x40;
pub const ACL_MASKED: u16 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AceType {
    Allow = 0,
    Deny = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ace {
    pub acetype: AceType,
    pub flags: u16,
    pub mask: u32,
    pub id: u32,
}

impl Ace {
    /// flag bits
    pub const FILE_INHERIT: u16 = 0x0001;
    pub const DIRECTORY_INHERIT: u16 = 0x0002;
    pub const NO_PROPAGATE_INHERIT: u16 = 0x0004;
    pub const INHERIT_ONLY: u16 = 0x0008;
    pub const IDENTIFIER_GROUP: u16 = 0x0040;
    pub const INHERITED_ACE: u16 = 0x0080;
    pub const SPECIAL_WHO: u16 = 0x0100;

    pub const INHERITANCE_FLAGS: u16 = Self::FILE_INHERIT
        | Self::DIRECTORY_INHERIT
        | Self::NO_PROPAGATE_INHERIT
        | Self::INHERIT_ONLY
        | Self::INHERITED_ACE;

    /// mask bits
    pub const READ_DATA: u32 = 0x0000_0001;
    pub const LIST_DIRECTORY: u32 = 0x0000_0001;
    pub const WRITE_DATA: u32 = 0x0000_0002;
    pub const ADD_FILE: u32 = 0x0000_0002;
    pub const APPEND_DATA: u32 = 0x0000_0004;
    pub const ADD_SUBDIRECTORY: u32 = 0x0000_0004;
    pub const READ_NAMED_ATTRS: u32 = 0x0000_0008;
    pub const WRITE_NAMED_ATTRS: u32 = 0x0000_0010;
    pub const EXECUTE: u32 = 0x0000_0020;
    pub const DELETE_CHILD: u32 = 0x0000_0040;
    pub const READ_ATTRIBUTES: u32 = 0x0000_0080;
    pub const WRITE_ATTRIBUTES: u32 = 0x0000_0100;
    pub const WRITE_RETENTION: u32 = 0x0000_0200;
    pub const WRITE_RETENTION_HOLD: u32 = 0x0000_0400;
    pub const DELETE: u32 = 0x0001_0000;
    pub const READ_ACL: u32 = 0x0002_0000;
    pub const WRITE_ACL: u32 = 0x0004_0000;
    pub const WRITE_OWNER: u32 = 0x0008_0000;
    pub const SYNCHRONIZE: u32 = 0x0010_0000;

    /// special identifiers
    pub const OWNER_SPECIAL_ID: u32 = 0;
    pub const GROUP_SPECIAL_ID: u32 = 1;
    pub const EVERYONE_SPECIAL_ID: u32 = 2;

    pub const POSIX_MODE_READ: u32 = Self::READ_DATA | Self::LIST_DIRECTORY;
    pub const POSIX_MODE_WRITE: u32 = Self::WRITE_DATA
        | Self::ADD_FILE
        | Self::APPEND_DATA
        | Self::ADD_SUBDIRECTORY
        | Self::DELETE_CHILD;
    pub const POSIX_MODE_EXEC: u32 = Self::EXECUTE;
    pub const POSIX_ALWAYS_ALLOWED: u32 =
        Self::SYNCHRONIZE | Self::READ_ATTRIBUTES | Self::READ_ACL;
    pub const POSIX_OWNER_ALLOWED: u32 =
        Self::WRITE_ATTRIBUTES | Self::WRITE_OWNER | Self::WRITE_ACL;

    pub const VALID_MASK: u32 = Self::READ_DATA
        | Self::WRITE_DATA
        | Self::APPEND_DATA
        | Self::READ_NAMED_ATTRS
        | Self::WRITE_NAMED_ATTRS
        | Self::EXECUTE
        | Self::DELETE_CHILD
        | Self::READ_ATTRIBUTES
        | Self::WRITE_ATTRIBUTES
        | Self::WRITE_RETENTION
        | Self::WRITE_RETENTION_HOLD
        | Self::DELETE
        | Self::READ_ACL
        | Self::WRITE_ACL
        | Self::WRITE_OWNER
        | Self::SYNCHRONIZE;

    pub fn new(acetype: AceType, flags: u16, mask: u32, id: u32) -> Self {
        Ace {
            acetype,
            flags,
            mask,
            id,
        }
    }

    pub fn allow(flags: u16, mask: u32, id: u32) -> Self {
        Ace::new(AceType::Allow, flags, mask, id)
    }

    pub fn deny(flags: u16, mask: u32, id: u32) -> Self {
        Ace::new(AceType::Deny, flags, mask, id)
    }

    pub fn is_allow(&self) -> bool {
        self.acetype == AceType::Allow
    }

    pub fn is_deny(&self) -> bool {
        self.acetype == AceType::Deny
    }

    pub fn is_owner(&self) -> bool {
        self.flags & Self::SPECIAL_WHO != 0 && self.id == Self::OWNER_SPECIAL_ID
    }

    pub fn is_group(&self) -> bool {
        self.flags & Self::SPECIAL_WHO != 0 && self.id == Self::GROUP_SPECIAL_ID
    }

    pub fn is_everyone(&self) -> bool {
        self.flags & Self::SPECIAL_WHO != 0 && self.id == Self::EVERYONE_SPECIAL_ID
    }

    pub fn is_unix_user(&self) -> bool {
        self.flags & (Self::SPECIAL_WHO | Self::IDENTIFIER_GROUP) == 0
    }

    pub fn is_unix_group(&self) -> bool {
        self.flags & Self::SPECIAL_WHO == 0 && self.flags & Self::IDENTIFIER_GROUP != 0
    }

    pub fn is_inheritable(&self) -> bool {
        self.flags & (Self::FILE_INHERIT | Self::DIRECTORY_INHERIT) != 0
    }

    pub fn is_inherit_only(&self) -> bool {
        self.flags & Self::INHERIT_ONLY != 0
    }

    pub fn is_same_identifier(&self, other: &Ace) -> bool {
        (self.flags ^ other.flags) & (Self::SPECIAL_WHO | Self::IDENTIFIER_GROUP) == 0
            && self.id == other.id
    }

    pub fn inherits_to_directory(&self) -> bool {
        if self.flags & Self::DIRECTORY_INHERIT != 0 {
            return true;
        }
        self.flags & Self::FILE_INHERIT != 0 && self.flags & Self::NO_PROPAGATE_INHERIT == 0
    }
}

/// Compute the rich ACL mask equivalent to the lowest three mode bits.
pub fn mode_to_mask(mode: u16) -> u32 {
    let mut mask = 0;
    if mode & 0o4 != 0 {
        mask |= Ace::POSIX_MODE_READ;
    }
    if mode & 0o2 != 0 {
        mask |= Ace::POSIX_MODE_WRITE;
    }
    if mode & 0o1 != 0 {
        mask |= Ace::POSIX_MODE_EXEC;
    }
    mask
}

/// Compute permission bits from a rich ACL mask.
pub fn mask_to_mode(mask: u32) -> u16 {
    let mut mode = 0;
    if mask & Ace::POSIX_MODE_READ != 0 {
        mode |= 0o4;
    }
    if mask & Ace::POSIX_MODE_WRITE != 0 {
        mode |= 0o2;
    }
    if mask & Ace::POSIX_MODE_EXEC != 0 {
        mode |= 0o1;
    }
    mode
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RichAcl {
    owner_mask: u32,
    group_mask: u32,
    other_mask: u32,
    flags: u16,
    aces: Vec<Ace>,
}

impl RichAcl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        owner_mask: u32,
        group_mask: u32,
        other_mask: u32,
        flags: u16,
        aces: Vec<Ace>,
    ) -> Self {
        RichAcl {
            owner_mask,
            group_mask,
            other_mask,
            flags,
            aces,
        }
    }

    pub fn owner_mask(&self) -> u32 {
        self.owner_mask
    }

    pub fn group_mask(&self) -> u32 {
        self.group_mask
    }

    pub fn other_mask(&self) -> u32 {
        self.other_mask
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn set_owner_mask(&mut self, mask: u32) {
        self.owner_mask = mask;
    }

    pub fn set_group_mask(&mut self, mask: u32) {
        self.group_mask = mask;
    }

    pub fn set_other_mask(&mut self, mask: u32) {
        self.other_mask = mask;
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = flags;
    }

    pub fn aces(&self) -> &[Ace] {
        &self.aces
    }

    pub fn insert(&mut self, ace: Ace) {
        self.aces.push(ace);
    }

    pub fn len(&self) -> usize {
        self.aces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aces.is_empty()
    }

    pub fn clear(&mut self) {
        self.owner_mask = 0;
        self.group_mask = 0;
        self.other_mask = 0;
        self.flags = 0;
        self.aces.clear();
    }

    pub fn is_auto_inherit(&self) -> bool {
        self.flags & ACL_AUTO_INHERIT != 0
    }

    pub fn is_protected(&self) -> bool {
        self.flags & ACL_PROTECTED != 0
    }

    pub fn is_masked(&self) -> bool {
        self.flags & ACL_MASKED != 0
    }

    pub fn is_auto_set_mode(&self) -> bool {
        self.flags & ACL_AUTO_SET_MODE != 0
    }

    /// The mode bits this ACL exposes: the masked projections of the three
    /// file masks.
    pub fn mode(&self) -> u16 {
        mask_to_mode(self.owner_mask) << 6
            | mask_to_mode(self.group_mask) << 3
            | mask_to_mode(self.other_mask)
    }

    pub fn set_mode(&mut self, mode: u16, is_dir: bool) {
        let excluded = if is_dir { 0 } else { Ace::DELETE_CHILD };
        self.flags |= ACL_MASKED | ACL_WRITE_THROUGH;
        self.owner_mask = mode_to_mask(mode >> 6) & !excluded;
        self.group_mask = mode_to_mask(mode >> 3) & !excluded;
        self.other_mask = mode_to_mask(mode) & !excluded;
    }

    pub fn is_same_mode(&self, mode: u16, is_dir: bool) -> bool {
        let excluded = if is_dir { 0 } else { Ace::DELETE_CHILD };
        mode_to_mask(mode >> 6) & !excluded == self.owner_mask
            && mode_to_mask(mode >> 3) & !excluded == self.group_mask
            && mode_to_mask(mode) & !excluded == self.other_mask
            && self.is_masked()
            && self.flags & ACL_WRITE_THROUGH != 0
            && (!self.is_auto_inherit() || !self.is_protected())
    }

    /// An ACL which grants exactly the permissions of `mode`.
    pub fn from_mode(mode: u16, is_dir: bool) -> Self {
        let excluded = if is_dir { 0 } else { Ace::DELETE_CHILD };
        let owner_mask = mode_to_mask(mode >> 6) & !excluded;
        let group_mask = mode_to_mask(mode >> 3) & !excluded;
        let other_mask = mode_to_mask(mode) & !excluded;

        let mut acl = RichAcl {
            owner_mask,
            group_mask,
            other_mask,
            ..Default::default()
        };

        let denied = !owner_mask & (group_mask | other_mask);
        if denied != 0 {
            acl.insert(Ace::deny(Ace::SPECIAL_WHO, denied, Ace::OWNER_SPECIAL_ID));
        }
        if owner_mask & !(group_mask & other_mask) != 0 {
            acl.insert(Ace::allow(Ace::SPECIAL_WHO, owner_mask, Ace::OWNER_SPECIAL_ID));
        }
        let denied = !group_mask & other_mask;
        if denied != 0 {
            acl.insert(Ace::deny(Ace::SPECIAL_WHO, denied, Ace::GROUP_SPECIAL_ID));
        }
        if group_mask & !other_mask != 0 {
            acl.insert(Ace::allow(Ace::SPECIAL_WHO, group_mask, Ace::GROUP_SPECIAL_ID));
        }
        if other_mask != 0 {
            acl.insert(Ace::allow(
                Ace::SPECIAL_WHO,
                other_mask,
                Ace::EVERYONE_SPECIAL_ID,
            ));
        }
        acl
    }

    /// Permissions the entry list grants to `who`, processed back to front.
    pub fn allowed_to_who(&self, who: &Ace) -> u32 {
        let mut allowed = 0;
        for ace in self.aces.iter().rev() {
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_same_identifier(who) || ace.is_everyone() {
                if ace.is_allow() {
                    allowed |= ace.mask;
                } else {
                    allowed &= !ace.mask;
                }
            }
        }
        allowed
    }

    fn group_class_allowed(&self) -> u32 {
        let mut everyone_allowed = 0;
        let mut group_class_allowed = 0;
        let mut had_group_ace = false;

        for ace in self.aces.iter().rev() {
            if ace.is_inherit_only() || ace.is_owner() {
                continue;
            }
            if ace.is_everyone() {
                if ace.is_allow() {
                    everyone_allowed |= ace.mask;
                } else {
                    everyone_allowed &= !ace.mask;
                }
            } else {
                group_class_allowed |= self.allowed_to_who(ace);
                if ace.is_group() {
                    had_group_ace = true;
                }
            }
        }
        if !had_group_ace {
            group_class_allowed |= everyone_allowed;
        }
        group_class_allowed
    }

    /// Compute upper bound file masks so no permission the entries allow is
    /// disabled. No assumption is made about who the owner is, so a later
    /// owner change does not alter the masks.
    pub fn compute_max_masks(&mut self) {
        self.owner_mask = 0;
        self.group_mask = 0;
        self.other_mask = 0;

        let mut gmask = !0u32;
        for ace in &self.aces {
            if ace.is_inherit_only() {
                continue;
            }
            if !ace.is_owner() && !ace.is_everyone() && ace.is_deny() {
                gmask = self.group_class_allowed();
                break;
            }
        }

        for index in (0..self.aces.len()).rev() {
            let ace = self.aces[index];
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_owner() {
                if ace.is_allow() {
                    self.owner_mask |= ace.mask;
                } else {
                    self.owner_mask &= !ace.mask;
                }
            } else if ace.is_everyone() {
                if ace.is_allow() {
                    self.owner_mask |= ace.mask;
                    self.group_mask |= ace.mask & gmask;
                    self.other_mask |= ace.mask;
                } else {
                    self.owner_mask &= !ace.mask;
                    self.group_mask &= !ace.mask;
                    self.other_mask &= !ace.mask;
                }
            } else if ace.is_allow() {
                self.owner_mask |= ace.mask & gmask;
                self.group_mask |= ace.mask & gmask;
            }
        }

        self.flags &= !(ACL_WRITE_THROUGH | ACL_MASKED);
    }

    /// Adjust the mask of the entry at `index`; returns the index of the
    /// next entry to process.
    fn change_mask(&mut self, index: usize, mask: u32) -> usize {
        let ace = self.aces[index];
        if mask != 0 && ace.mask == mask {
            self.aces[index].flags &= !Ace::INHERIT_ONLY;
        } else if mask & !Ace::POSIX_ALWAYS_ALLOWED != 0 {
            let mut index = index;
            if ace.is_inheritable() {
                let mut copy = ace;
                copy.flags |= Ace::INHERIT_ONLY;
                self.aces.insert(index, copy);
                index += 1;
                self.aces[index].flags &= !Ace::INHERITANCE_FLAGS | Ace::INHERITED_ACE;
            }
            self.aces[index].mask = mask;
            return index + 1;
        } else {
            if ace.is_inheritable() {
                self.aces[index].flags |= Ace::INHERIT_ONLY;
            } else {
                self.aces.remove(index);
                return index;
            }
        }
        index + 1
    }

    fn move_everyone_aces_down(&mut self) {
        let mut allowed = 0u32;
        let mut denied = 0u32;

        let mut index = 0;
        while index < self.aces.len() {
            let ace = self.aces[index];
            if ace.is_inherit_only() {
                index += 1;
                continue;
            }
            if ace.is_everyone() {
                if ace.is_allow() {
                    allowed |= ace.mask & !denied;
                } else {
                    denied |= ace.mask & !allowed;
                }
                index = self.change_mask(index, 0);
                continue;
            }
            index = if ace.is_allow() {
                self.change_mask(index, allowed | (ace.mask & !denied))
            } else {
                self.change_mask(index, denied | (ace.mask & !allowed))
            };
        }

        if allowed & !Ace::POSIX_ALWAYS_ALLOWED != 0 {
            if let Some(last) = self.aces.last_mut() {
                if last.is_everyone() && last.is_allow() && last.is_inherit_only() && last.mask == allowed
                {
                    last.flags &= !Ace::INHERIT_ONLY;
                    return;
                }
            }
            self.aces.push(Ace::allow(
                Ace::SPECIAL_WHO,
                allowed,
                Ace::EVERYONE_SPECIAL_ID,
            ));
        }
    }

    fn propagate_everyone_to(&mut self, who: Ace, mut allow: u32) {
        let mut allow_last = None;
        for (index, ace) in self.aces.iter().enumerate() {
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_allow() {
                if ace.is_same_identifier(&who) {
                    allow &= !ace.mask;
                    allow_last = Some(index);
                }
            } else if ace.is_deny() {
                if ace.is_same_identifier(&who) {
                    allow &= !ace.mask;
                } else if allow & ace.mask != 0 {
                    allow_last = None;
                }
            }
        }

        let last = self.aces.len() - 1;
        let last_ace = self.aces[last];
        if !last_ace.is_owner()
            && last_ace.is_everyone()
            && allow & !(last_ace.mask & self.other_mask) == 0
        {
            allow = 0;
        }

        if allow != 0 {
            if let Some(index) = allow_last {
                let mask = self.aces[index].mask | allow;
                self.change_mask(index, mask);
                return;
            }
            self.aces.insert(
                last,
                Ace::allow(who.flags & !Ace::INHERITANCE_FLAGS, allow, who.id),
            );
        }
    }

    fn propagate_everyone(&mut self) {
        if self.aces.is_empty() {
            return;
        }
        let last_ace = *self.aces.last().unwrap();
        if last_ace.is_inherit_only() || !last_ace.is_everyone() {
            return;
        }

        let owner_allow = last_ace.mask & self.owner_mask;
        let group_allow = last_ace.mask & self.group_mask;

        if owner_allow & !(self.group_mask & self.other_mask) != 0 {
            self.propagate_everyone_to(
                Ace::allow(Ace::SPECIAL_WHO, 0, Ace::OWNER_SPECIAL_ID),
                owner_allow,
            );
        }

        if group_allow & !self.other_mask != 0 {
            self.propagate_everyone_to(
                Ace::allow(Ace::SPECIAL_WHO, 0, Ace::GROUP_SPECIAL_ID),
                group_allow,
            );
            for index in (0..self.aces.len().saturating_sub(1)).rev() {
                let ace = self.aces[index];
                if ace.is_inherit_only() || ace.is_owner() || ace.is_group() {
                    continue;
                }
                self.propagate_everyone_to(ace, group_allow);
            }
        }
    }

    fn apply_masks_to_aces(&mut self, owner: u32) {
        let mut index = 0;
        while index < self.aces.len() {
            let ace = self.aces[index];
            if ace.is_inherit_only() || !ace.is_allow() {
                index += 1;
                continue;
            }
            let mask = if ace.is_owner() || (ace.is_unix_user() && ace.id == owner) {
                self.owner_mask
            } else if ace.is_everyone() {
                self.other_mask
            } else {
                self.group_mask
            };
            index = self.change_mask(index, ace.mask & mask);
        }
    }

    fn set_owner_permissions(&mut self) {
        if self.flags & ACL_WRITE_THROUGH == 0 {
            return;
        }
        let mut owner_mask = self.owner_mask & !Ace::POSIX_ALWAYS_ALLOWED;
        let mut denied = 0;

        let mut index = 0;
        while index < self.aces.len() {
            let ace = self.aces[index];
            if ace.is_owner() {
                if ace.is_allow() && owner_mask & denied == 0 {
                    index = self.change_mask(index, owner_mask);
                    owner_mask = 0;
                } else {
                    index = self.change_mask(index, 0);
                }
            } else {
                if ace.is_deny() {
                    denied |= ace.mask;
                }
                index += 1;
            }
        }

        if owner_mask & (denied | !self.other_mask | !self.group_mask) != 0 {
            self.aces.insert(
                0,
                Ace::allow(Ace::SPECIAL_WHO, owner_mask, Ace::OWNER_SPECIAL_ID),
            );
        }
    }

    fn set_other_permissions(&mut self) -> u32 {
        let other_mask = self.other_mask & !Ace::POSIX_ALWAYS_ALLOWED;
        if other_mask == 0 || self.flags & ACL_WRITE_THROUGH == 0 {
            return 0;
        }

        let mut added = other_mask;
        let needs_new_entry = match self.aces.last() {
            Some(last) => !last.is_everyone() || last.is_inherit_only(),
            None => true,
        };
        if needs_new_entry {
            self.aces.push(Ace::allow(
                Ace::SPECIAL_WHO,
                other_mask,
                Ace::EVERYONE_SPECIAL_ID,
            ));
        } else {
            let index = self.aces.len() - 1;
            added &= !self.aces[index].mask;
            self.change_mask(index, other_mask);
        }
        added
    }

    fn max_allowed(&self) -> u32 {
        let mut allowed = 0;
        for ace in self.aces.iter().rev() {
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_allow() {
                allowed |= ace.mask;
            } else if ace.is_deny() && ace.is_everyone() {
                allowed &= !ace.mask;
            }
        }
        allowed
    }

    fn isolate_owner_class(&mut self) {
        let deny = self.max_allowed() & !self.owner_mask;
        if deny == 0 {
            return;
        }

        for index in 0..self.aces.len() {
            let ace = self.aces[index];
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_allow() {
                break;
            }
            if ace.is_owner() {
                let mask = ace.mask | deny;
                self.change_mask(index, mask);
                return;
            }
        }
        self.aces
            .insert(0, Ace::deny(Ace::SPECIAL_WHO, deny, Ace::OWNER_SPECIAL_ID));
    }

    fn isolate_who(&mut self, who: Ace, mut deny: u32) {
        for ace in &self.aces {
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_same_identifier(&who) {
                deny &= !ace.mask;
            }
        }
        if deny == 0 {
            return;
        }

        for index in (0..self.aces.len().saturating_sub(1)).rev() {
            let ace = self.aces[index];
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_deny() {
                if ace.is_same_identifier(&who) {
                    let mask = ace.mask | deny;
                    self.change_mask(index, mask);
                    return;
                }
            } else if ace.is_allow() && ace.mask & deny != 0 {
                break;
            }
        }

        let last = self.aces.len() - 1;
        self.aces.insert(
            last,
            Ace::deny(who.flags & !Ace::INHERITANCE_FLAGS, deny, who.id),
        );
    }

    fn isolate_group_class(&mut self, mut deny: u32) {
        if self.aces.is_empty() {
            return;
        }
        let last_ace = *self.aces.last().unwrap();
        if last_ace.is_inherit_only() || !last_ace.is_everyone() {
            return;
        }

        deny |= last_ace.mask & !self.group_mask;
        if deny == 0 {
            return;
        }

        self.isolate_who(
            Ace::allow(Ace::SPECIAL_WHO, 0, Ace::GROUP_SPECIAL_ID),
            deny,
        );
        for index in (0..self.aces.len().saturating_sub(1)).rev() {
            let ace = self.aces[index];
            if ace.is_inherit_only() || ace.is_owner() || ace.is_group() {
                continue;
            }
            self.isolate_who(ace, deny);
        }
    }

    /// Rewrite the entry list so the standard NFSv4 permission check (which
    /// is unaware of the file masks) computes the same decisions as the
    /// masked check. Clears the `MASKED` and `WRITE_THROUGH` flags.
    pub fn apply_masks(&mut self, owner: u32) {
        if !self.is_masked() {
            return;
        }

        self.move_everyone_aces_down();
        self.propagate_everyone();
        self.apply_masks_to_aces(owner);
        let added = self.set_other_permissions();
        self.isolate_group_class(added);
        self.set_owner_permissions();
        self.isolate_owner_class();

        self.flags &= !(ACL_WRITE_THROUGH | ACL_MASKED);
    }

    fn has_group_entry(&self) -> bool {
        self.aces
            .iter()
            .any(|ace| !ace.is_inherit_only() && ace.is_group())
    }

    /// Append entries granting the same permissions as `posix_acl`.
    pub fn append_posix_acl(&mut self, posix_acl: &PosixAcl, is_dir: bool) {
        let excluded = if is_dir { 0 } else { Ace::DELETE_CHILD };

        self.flags = 0;
        self.owner_mask = 0;
        self.group_mask = 0;
        self.other_mask = 0;

        if posix_acl.is_minimal() {
            // a minimal POSIX ACL becomes a rich ACL with masks only
            self.owner_mask = mode_to_mask(posix_acl.owner_rights() as u16) & !excluded;
            self.group_mask = mode_to_mask(posix_acl.group_rights() as u16) & !excluded;
            self.other_mask = mode_to_mask(posix_acl.other_rights() as u16) & !excluded;
            self.flags |= ACL_MASKED | ACL_WRITE_THROUGH;
            return;
        }

        let mask = mode_to_mask(posix_acl.owner_rights() as u16) & !excluded;
        self.insert(Ace::allow(Ace::SPECIAL_WHO, mask, Ace::OWNER_SPECIAL_ID));

        let mask = mode_to_mask(posix_acl.group_rights() as u16) & !excluded;
        self.insert(Ace::allow(Ace::SPECIAL_WHO, mask, Ace::GROUP_SPECIAL_ID));

        for entry in posix_acl.entries() {
            let mask = mode_to_mask(entry.rights as u16) & !excluded;
            match entry.kind {
                AclEntryKind::NamedUser => self.insert(Ace::allow(0, mask, entry.id)),
                AclEntryKind::NamedGroup => {
                    self.insert(Ace::allow(Ace::IDENTIFIER_GROUP, mask, entry.id))
                }
                _ => {}
            }
        }

        let everyone_mask = mode_to_mask(posix_acl.other_rights() as u16) & !excluded;
        self.insert(Ace::allow(
            Ace::SPECIAL_WHO,
            everyone_mask,
            Ace::EVERYONE_SPECIAL_ID,
        ));

        // deny Everyone the permissions it would otherwise leak to the
        // owner and group classes, so it behaves like the POSIX Other entry
        self.isolate_who(
            Ace::allow(Ace::SPECIAL_WHO, 0, Ace::OWNER_SPECIAL_ID),
            everyone_mask,
        );
        self.isolate_group_class(everyone_mask);

        self.owner_mask =
            self.allowed_to_who(&Ace::allow(Ace::SPECIAL_WHO, 0, Ace::OWNER_SPECIAL_ID));
        self.group_mask =
            self.allowed_to_who(&Ace::allow(Ace::SPECIAL_WHO, 0, Ace::GROUP_SPECIAL_ID));
        self.other_mask =
            self.allowed_to_who(&Ace::allow(Ace::SPECIAL_WHO, 0, Ace::EVERYONE_SPECIAL_ID));

        // the POSIX mask entry is simulated by the group mask: the group
        // entry keeps the owning group permissions while the group mask
        // carries the mask permissions
        if let Some(entry) = posix_acl.get_entry(AclEntryKind::Mask, 0) {
            self.group_mask = mode_to_mask(entry.rights as u16) & !excluded;
            self.flags |= ACL_MASKED;
        }
    }

    /// Append inherit-only entries matching a default POSIX ACL.
    pub fn append_default_posix_acl(&mut self, posix_acl: &PosixAcl) {
        let mut dir_acl = RichAcl::new();
        dir_acl.append_posix_acl(posix_acl, true);
        let default_flags = Ace::FILE_INHERIT | Ace::DIRECTORY_INHERIT | Ace::INHERIT_ONLY;
        for mut ace in dir_acl.aces.into_iter() {
            ace.flags |= default_flags;
            self.insert(ace);
        }
    }

    /// Approximate this ACL as a POSIX ACL. Returns None for an ACL with no
    /// masked flag and no entries (nothing to express).
    pub fn to_posix_acl(&self) -> Option<PosixAcl> {
        if !self.is_masked() && self.aces.is_empty() {
            return None;
        }

        let mut posix_acl = PosixAcl::new();
        let write_through = self.flags & ACL_WRITE_THROUGH != 0;

        let mut mask = if write_through {
            self.owner_mask
        } else {
            self.allowed_to_who(&Ace::allow(Ace::SPECIAL_WHO, 0, Ace::OWNER_SPECIAL_ID))
        };
        if self.is_masked() {
            mask &= self.owner_mask;
        }
        let mut mode = mask_to_mode(mask) << 6;

        let mut mask =
            self.allowed_to_who(&Ace::allow(Ace::SPECIAL_WHO, 0, Ace::GROUP_SPECIAL_ID));
        if write_through && !self.has_group_entry() {
            mask = self.group_mask;
        }
        mode |= mask_to_mode(mask) << 3;

        let mut mask = if write_through {
            self.other_mask
        } else {
            self.allowed_to_who(&Ace::allow(Ace::SPECIAL_WHO, 0, Ace::EVERYONE_SPECIAL_ID))
        };
        if self.is_masked() {
            mask &= self.other_mask;
        }
        mode |= mask_to_mode(mask);

        posix_acl.set_mode(mode);

        for ace in &self.aces {
            if ace.is_inherit_only() {
                continue;
            }
            if ace.is_unix_user() {
                if posix_acl.get_entry(AclEntryKind::NamedUser, ace.id).is_some() {
                    continue;
                }
                let mask = self.allowed_to_who(ace);
                posix_acl.set_entry(AclEntryKind::NamedUser, ace.id, mask_to_mode(mask) as u8);
            }
            if ace.is_unix_group() {
                if posix_acl.get_entry(AclEntryKind::NamedGroup, ace.id).is_some() {
                    continue;
                }
                let mask = self.allowed_to_who(ace);
                posix_acl.set_entry(AclEntryKind::NamedGroup, ace.id, mask_to_mode(mask) as u8);
            }
        }

        if self.is_masked() && self.has_group_entry() {
            posix_acl.set_entry(
                AclEntryKind::Mask,
                0,
                mask_to_mode(self.group_mask) as u8,
            );
        }

        Some(posix_acl)
    }

    /// Approximate the inheritable entries as a default POSIX ACL.
    pub fn to_default_posix_acl(&self) -> Option<PosixAcl> {
        let mut rich_acl = RichAcl::new();
        for ace in &self.aces {
            if !ace.is_inheritable() {
                continue;
            }
            let mut ace = *ace;
            ace.flags &= !Ace::INHERIT_ONLY;
            rich_acl.insert(ace);
        }
        let mut posix_acl = rich_acl.to_posix_acl()?;
        posix_acl.set_entry(AclEntryKind::Mask, 0, 0o7);
        Some(posix_acl)
    }

    /// Remove entries with (or, inverted, without) the inherit-only flag.
    pub fn remove_inherit_only(&mut self, remove_with_flag_set: bool) {
        self.aces
            .retain(|ace| ace.is_inherit_only() != remove_with_flag_set);
    }

    pub fn check_inherit_flags(&self, is_directory: bool) -> bool {
        for ace in &self.aces {
            if ace.is_inherit_only() && !ace.is_inheritable() {
                return false;
            }
        }
        if is_directory {
            return true;
        }
        self.aces
            .iter()
            .all(|ace| !ace.is_inherit_only() && !ace.is_inheritable())
    }

    /// Duplicate inheritable entries into an effective entry and an
    /// inherit-only one.
    pub fn create_explicit_inheritance(&mut self) {
        let count = self.aces.len();
        for index in 0..count {
            let ace = self.aces[index];
            if ace.is_inherit_only() || !ace.is_inheritable() {
                continue;
            }
            let mut copy = ace;
            copy.flags |= Ace::INHERIT_ONLY;
            self.aces[index].flags &=
                !(Ace::INHERIT_ONLY | Ace::FILE_INHERIT | Ace::DIRECTORY_INHERIT);
            self.aces.push(copy);
        }
    }

    fn inherit(dir_acl: &RichAcl, is_dir: bool) -> RichAcl {
        let mut acl = RichAcl::new();

        if is_dir {
            for dir_ace in &dir_acl.aces {
                if !dir_ace.inherits_to_directory() {
                    continue;
                }
                let mut ace = *dir_ace;
                if dir_ace.flags & Ace::NO_PROPAGATE_INHERIT != 0 {
                    ace.flags &= !Ace::INHERITANCE_FLAGS;
                } else if dir_ace.flags & Ace::DIRECTORY_INHERIT != 0 {
                    ace.flags &= !Ace::INHERIT_ONLY;
                } else {
                    ace.flags |= Ace::INHERIT_ONLY;
                }
                acl.insert(ace);
            }
        } else {
            for dir_ace in &dir_acl.aces {
                if dir_ace.flags & Ace::FILE_INHERIT == 0 {
                    continue;
                }
                let mut ace = *dir_ace;
                ace.flags &= !Ace::INHERITANCE_FLAGS;
                ace.mask &= !Ace::DELETE_CHILD;
                acl.insert(ace);
            }
        }

        if dir_acl.is_auto_inherit() {
            acl.flags = ACL_AUTO_INHERIT;
            for ace in &mut acl.aces {
                ace.flags |= Ace::INHERITED_ACE;
            }
        } else {
            for ace in &mut acl.aces {
                ace.flags &= !Ace::INHERITED_ACE;
            }
        }
        acl
    }

    /// Check whether `acl` is equivalent to a plain file mode; on success the
    /// equivalent mode is merged into `mode`.
    pub fn equiv_mode(acl: &RichAcl, mode: &mut u16, is_dir: bool) -> bool {
        let excluded = if is_dir { 0 } else { Ace::DELETE_CHILD };

        let mut owner_allowed = 0u32;
        let mut owner_defined = Ace::POSIX_ALWAYS_ALLOWED | Ace::POSIX_OWNER_ALLOWED | excluded;
        let mut group_allowed = 0u32;
        let mut group_defined = Ace::POSIX_ALWAYS_ALLOWED | excluded;
        let mut everyone_allowed = 0u32;
        let mut everyone_defined = Ace::POSIX_ALWAYS_ALLOWED | excluded;

        if acl.flags & !(ACL_WRITE_THROUGH | ACL_MASKED) != 0 {
            return false;
        }
        if acl.is_auto_set_mode() && acl.aces.is_empty() {
            return true;
        }

        for ace in &acl.aces {
            if ace.flags & !Ace::SPECIAL_WHO != 0 {
                return false;
            }

            if ace.is_owner() || ace.is_everyone() {
                let bits = ace.mask & !owner_defined;
                if ace.is_allow() {
                    let group_denied = group_defined & !group_allowed;
                    if bits & group_denied != 0 {
                        return false;
                    }
                    owner_allowed |= bits;
                } else if bits & group_allowed != 0 {
                    return false;
                }
                owner_defined |= bits;

                if ace.is_everyone() {
                    let bits = ace.mask;
                    if ace.is_allow() {
                        group_allowed |= bits & !group_defined;
                        everyone_allowed |= bits & !everyone_defined;
                    }
                    group_defined |= bits;
                    everyone_defined |= bits;
                }
            } else if ace.is_group() {
                let bits = ace.mask & !group_defined;
                if ace.is_allow() {
                    group_allowed |= bits;
                }
                group_defined |= bits;
            } else {
                return false;
            }
        }

        if group_allowed & !owner_defined != 0 {
            return false;
        }

        if acl.is_masked() {
            if acl.flags & ACL_WRITE_THROUGH != 0 {
                owner_allowed = acl.owner_mask;
                everyone_allowed = acl.other_mask;
            } else {
                owner_allowed &= acl.owner_mask;
                everyone_allowed &= acl.other_mask;
            }
            group_allowed &= acl.group_mask;
        }

        let new_mode = (*mode & !0o777)
            | mask_to_mode(owner_allowed) << 6
            | mask_to_mode(group_allowed) << 3
            | mask_to_mode(everyone_allowed);

        if (mode_to_mask(new_mode >> 6) ^ owner_allowed) & !excluded != 0
            || (mode_to_mask(new_mode >> 3) ^ group_allowed) & !excluded != 0
            || (mode_to_mask(new_mode) ^ everyone_allowed) & !excluded != 0
        {
            return false;
        }

        *mode = new_mode;
        true
    }

    /// Build the ACL a fresh inode inherits from its parent directory.
    /// Returns None when the inherited ACL collapses to plain mode bits; in
    /// both cases `mode` is updated accordingly.
    pub fn inherit_inode(
        dir_acl: &RichAcl,
        mode: &mut u16,
        umask: u16,
        is_dir: bool,
    ) -> Option<RichAcl> {
        let mut acl = Self::inherit(dir_acl, is_dir);
        if acl.is_empty() {
            *mode &= !umask;
            return None;
        }

        let mut equiv = *mode;
        if Self::equiv_mode(&acl, &mut equiv, is_dir) {
            *mode &= equiv;
            return None;
        }

        if acl.is_auto_inherit() {
            acl.flags |= ACL_PROTECTED;
        }
        acl.compute_max_masks();
        acl.flags |= ACL_MASKED;
        acl.owner_mask &= mode_to_mask(*mode >> 6);
        acl.group_mask &= mode_to_mask(*mode >> 3);
        acl.other_mask &= mode_to_mask(*mode);
        *mode = acl.mode();

        Some(acl)
    }
}

// ---- string form ----

const ACL_FLAG_CHARS: &[(char, u16)] = &[
    ('m', ACL_MASKED),
    ('w', ACL_WRITE_THROUGH),
    ('a', ACL_AUTO_INHERIT),
    ('p', ACL_PROTECTED),
    ('d', ACL_DEFAULTED),
];

const ACE_FLAG_CHARS: &[(char, u16)] = &[
    ('f', Ace::FILE_INHERIT),
    ('d', Ace::DIRECTORY_INHERIT),
    ('n', Ace::NO_PROPAGATE_INHERIT),
    ('i', Ace::INHERIT_ONLY),
    ('a', Ace::INHERITED_ACE),
    ('S', Ace::SPECIAL_WHO),
];

const ACE_MASK_CHARS: &[(char, u32)] = &[
    ('r', Ace::READ_DATA),
    ('w', Ace::WRITE_DATA),
    ('p', Ace::APPEND_DATA),
    ('x', Ace::EXECUTE),
    ('d', Ace::DELETE_CHILD),
    ('D', Ace::DELETE),
    ('a', Ace::READ_ATTRIBUTES),
    ('A', Ace::WRITE_ATTRIBUTES),
    ('R', Ace::READ_NAMED_ATTRS),
    ('W', Ace::WRITE_NAMED_ATTRS),
    ('c', Ace::READ_ACL),
    ('C', Ace::WRITE_ACL),
    ('o', Ace::WRITE_OWNER),
    ('S', Ace::SYNCHRONIZE),
    ('e', Ace::WRITE_RETENTION),
    ('E', Ace::WRITE_RETENTION_HOLD),
];

fn write_acl_flags(out: &mut String, mut flags: u16) {
    for (chr, bit) in ACL_FLAG_CHARS {
        if flags & bit != 0 {
            flags &= !bit;
            out.push(*chr);
        }
    }
}

fn write_ace_flags(out: &mut String, flags: u16) {
    let mut flags = flags & !(Ace::IDENTIFIER_GROUP | Ace::SPECIAL_WHO);
    for (chr, bit) in ACE_FLAG_CHARS {
        if flags & bit != 0 {
            flags &= !bit;
            out.push(*chr);
        }
    }
}

fn write_mask(out: &mut String, mut mask: u32) {
    for (chr, bit) in ACE_MASK_CHARS {
        if mask & bit != 0 {
            mask &= !bit;
            out.push(*chr);
        }
    }
}

fn parse_acl_flags(text: &str) -> Result<u16, Error> {
    let mut flags = 0;
    for chr in text.chars() {
        let (_, bit) = ACL_FLAG_CHARS
            .iter()
            .find(|(have, _)| *have == chr)
            .ok_or_else(|| format_err!("unsupported acl flag '{}'", chr))?;
        flags |= bit;
    }
    Ok(flags)
}

fn parse_ace_flags(text: &str) -> Result<u16, Error> {
    let mut flags = 0;
    for chr in text.chars() {
        let (_, bit) = ACE_FLAG_CHARS
            .iter()
            .find(|(have, _)| *have == chr)
            .ok_or_else(|| format_err!("unsupported ace flag '{}'", chr))?;
        flags |= bit;
    }
    Ok(flags)
}

fn parse_mask(text: &str) -> Result<u32, Error> {
    let mut mask = 0;
    for chr in text.chars() {
        let (_, bit) = ACE_MASK_CHARS
            .iter()
            .find(|(have, _)| *have == chr)
            .ok_or_else(|| format_err!("unsupported ace mask '{}'", chr))?;
        mask |= bit;
    }
    Ok(mask)
}

impl fmt::Display for Ace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        write_mask(&mut out, self.mask);
        out.push(':');
        write_ace_flags(&mut out, self.flags);
        out.push(':');
        out.push(if self.is_allow() { 'A' } else { 'D' });
        out.push(':');
        if self.flags & Ace::SPECIAL_WHO != 0 {
            match self.id {
                Ace::OWNER_SPECIAL_ID => out.push('O'),
                Ace::GROUP_SPECIAL_ID => out.push('G'),
                Ace::EVERYONE_SPECIAL_ID => out.push('E'),
                _ => {}
            }
        } else if self.flags & Ace::IDENTIFIER_GROUP != 0 {
            out.push('g');
            out.push_str(&self.id.to_string());
        } else {
            out.push('u');
            out.push_str(&self.id.to_string());
        }
        out.push('/');
        f.write_str(&out)
    }
}

impl fmt::Display for RichAcl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        write_acl_flags(&mut out, self.flags);
        out.push('|');
        write_mask(&mut out, self.owner_mask);
        out.push('|');
        write_mask(&mut out, self.group_mask);
        out.push('|');
        write_mask(&mut out, self.other_mask);
        out.push('|');
        f.write_str(&out)?;
        for ace in &self.aces {
            write!(f, "{}", ace)?;
        }
        Ok(())
    }
}

impl FromStr for RichAcl {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let mut fields = text.splitn(5, '|');
        let mut next = |what: &str| {
            fields
                .next()
                .ok_or_else(|| format_err!("string too short, cannot parse {}", what))
        };

        let mut acl = RichAcl::new();
        acl.flags = parse_acl_flags(next("acl flags")?)?;
        acl.owner_mask = parse_mask(next("acl owner mask")?)?;
        acl.group_mask = parse_mask(next("acl group mask")?)?;
        acl.other_mask = parse_mask(next("acl other mask")?)?;

        let mut rest = next("ace list")?;
        while !rest.is_empty() {
            let (mask_text, tail) = rest
                .split_once(':')
                .ok_or_else(|| format_err!("string too short, cannot parse ace mask"))?;
            let (flags_text, tail) = tail
                .split_once(':')
                .ok_or_else(|| format_err!("string too short, cannot parse ace flags"))?;
            let (type_text, tail) = tail
                .split_once(':')
                .ok_or_else(|| format_err!("string too short, cannot parse ace type"))?;
            let (id_text, tail) = tail
                .split_once('/')
                .ok_or_else(|| format_err!("string too short, cannot parse ace id"))?;

            let mut ace = Ace::allow(0, 0, 0);
            ace.mask = parse_mask(mask_text)?;
            ace.flags |= parse_ace_flags(flags_text)?;
            ace.acetype = match type_text {
                "A" => AceType::Allow,
                "D" => AceType::Deny,
                other => bail!("unsupported ace type '{}'", other),
            };

            let mut chars = id_text.chars();
            match chars.next() {
                Some('O') => {
                    ace.id = Ace::OWNER_SPECIAL_ID;
                    ace.flags |= Ace::SPECIAL_WHO;
                }
                Some('G') => {
                    ace.id = Ace::GROUP_SPECIAL_ID;
                    ace.flags |= Ace::SPECIAL_WHO;
                }
                Some('E') => {
                    ace.id = Ace::EVERYONE_SPECIAL_ID;
                    ace.flags |= Ace::SPECIAL_WHO;
                }
                Some('u') => {
                    ace.id = chars.as_str().parse().unwrap_or(u32::MAX);
                }
                Some('g') => {
                    ace.id = chars.as_str().parse().unwrap_or(u32::MAX);
                    ace.flags |= Ace::IDENTIFIER_GROUP;
                }
                _ => bail!("unsupported ace identifier '{}'", id_text),
            }

            acl.insert(ace);
            rest = tail;
        }
        Ok(acl)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_round_trip() {
        for text in [
            "|rwxcC|rwxcC|rwxcC|r::D:u1000/wxC::A:g1000/rwxcC::A:E/",
            "mw|rwx|rx|r|",
            "|rwpxd|rwpxd|rwpxd|rwpxdaRcS:fd:A:O/rxaRcS::A:G/",
        ] {
            let acl: RichAcl = text.parse().unwrap();
            assert_eq!(acl.to_string(), text, "round-trip of '{}'", text);
        }
    }

    #[test]
    fn mode_round_trip() {
        let mut acl = RichAcl::new();
        acl.set_mode(0o640, false);
        assert_eq!(acl.mode(), 0o640);
        assert!(acl.is_same_mode(0o640, false));
        assert!(!acl.is_same_mode(0o600, false));
    }

    #[test]
    fn from_mode_grants_exactly_mode() {
        let acl = RichAcl::from_mode(0o750, false);
        let owner = Ace::allow(Ace::SPECIAL_WHO, 0, Ace::OWNER_SPECIAL_ID);
        let group = Ace::allow(Ace::SPECIAL_WHO, 0, Ace::GROUP_SPECIAL_ID);
        let everyone = Ace::allow(Ace::SPECIAL_WHO, 0, Ace::EVERYONE_SPECIAL_ID);
        assert_eq!(mask_to_mode(acl.allowed_to_who(&owner)), 0o7);
        assert_eq!(mask_to_mode(acl.allowed_to_who(&group)), 0o5);
        assert_eq!(mask_to_mode(acl.allowed_to_who(&everyone)), 0o0);
        assert_eq!(acl.mode(), 0o750);
    }

    #[test]
    fn minimal_posix_acl_becomes_masks_only() {
        let posix: PosixAcl = "A750".parse().unwrap();
        let mut acl = RichAcl::new();
        acl.append_posix_acl(&posix, false);
        assert!(acl.is_empty());
        assert!(acl.is_masked());
        assert_eq!(acl.mode(), 0o750);

        let back = acl.to_posix_acl().unwrap();
        assert_eq!(back.mode(), 0o750);
        assert!(back.is_minimal());
    }

    #[test]
    fn extended_posix_acl_round_trips_through_rich_acl() {
        let posix: PosixAcl = "A770/u:123:7/g:166:4/m::6".parse().unwrap();
        let mut acl = RichAcl::new();
        acl.append_posix_acl(&posix, false);
        assert!(acl.is_masked());

        let back = acl.to_posix_acl().unwrap();
        assert_eq!(back.mode(), posix.mode());
        let user = back.get_entry(AclEntryKind::NamedUser, 123).unwrap();
        assert_eq!(user.rights, 0o7);
        let group = back.get_entry(AclEntryKind::NamedGroup, 166).unwrap();
        assert_eq!(group.rights, 0o4);
        assert!(back.get_entry(AclEntryKind::Mask, 0).is_some());
    }

    #[test]
    fn mode_projection_matches_masked_entries() {
        // the invariant behind getMode: mode bits equal the masked
        // projections of the effective entries
        let posix: PosixAcl = "A764/u:5:6/m::6".parse().unwrap();
        let mut acl = RichAcl::new();
        acl.append_posix_acl(&posix, false);
        assert_eq!(acl.mode(), posix.mode());
    }

    #[test]
    fn apply_masks_preserves_allowed_permissions() {
        let mut acl = RichAcl::new();
        acl.insert(Ace::allow(
            Ace::SPECIAL_WHO,
            mode_to_mask(0o7),
            Ace::EVERYONE_SPECIAL_ID,
        ));
        acl.compute_max_masks();
        acl.flags |= ACL_MASKED;
        acl.set_group_mask(mode_to_mask(0o5));
        acl.set_other_mask(mode_to_mask(0o5));

        acl.apply_masks(1000);
        assert!(!acl.is_masked());

        let everyone = Ace::allow(Ace::SPECIAL_WHO, 0, Ace::EVERYONE_SPECIAL_ID);
        assert_eq!(mask_to_mode(acl.allowed_to_who(&everyone)), 0o5);
        let owner = Ace::allow(Ace::SPECIAL_WHO, 0, Ace::OWNER_SPECIAL_ID);
        assert_eq!(mask_to_mode(acl.allowed_to_who(&owner)), 0o7);
    }

    #[test]
    fn equiv_mode_detects_plain_modes() {
        let acl = RichAcl::from_mode(0o644, false);
        let mut mode = 0;
        assert!(RichAcl::equiv_mode(&acl, &mut mode, false));
        assert_eq!(mode & 0o777, 0o644);

        let mut acl = RichAcl::from_mode(0o644, false);
        acl.insert(Ace::allow(0, mode_to_mask(0o7), 1000));
        let mut mode = 0;
        assert!(!RichAcl::equiv_mode(&acl, &mut mode, false));
    }

    #[test]
    fn inherit_inode_applies_umask_without_parent_acl() {
        let dir_acl = RichAcl::new();
        let mut mode = 0o666;
        let inherited = RichAcl::inherit_inode(&dir_acl, &mut mode, 0o022, false);
        assert!(inherited.is_none());
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn inherit_inode_propagates_file_inherit_aces() {
        let mut dir_acl = RichAcl::new();
        dir_acl.insert(Ace::allow(
            Ace::SPECIAL_WHO | Ace::FILE_INHERIT,
            mode_to_mask(0o7),
            Ace::OWNER_SPECIAL_ID,
        ));
        dir_acl.insert(Ace::allow(Ace::FILE_INHERIT, mode_to_mask(0o6), 1234));

        let mut mode = 0o644;
        let inherited = RichAcl::inherit_inode(&dir_acl, &mut mode, 0o022, false).unwrap();
        assert!(inherited.is_masked());
        assert!(inherited
            .aces()
            .iter()
            .all(|ace| !ace.is_inheritable() && !ace.is_inherit_only()));
    }
}

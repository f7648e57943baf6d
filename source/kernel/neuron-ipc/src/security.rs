// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Security context captured into messages and connection attempts
//! OWNERS: @kernel-team
//! PUBLIC API: SecurityContext, Privileges, UserId, GroupId, MAX_GROUPS
//! INVARIANTS: A captured snapshot is a value copy; later changes to the process never reach it

use bitflags::bitflags;

use crate::status::{Result, Status};

/// Maximum number of supplementary groups.
pub const MAX_GROUPS: usize = 32;

/// User identifier.
pub type UserId = u32;
/// Group identifier.
pub type GroupId = u32;

bitflags! {
    /// Privilege set (128-bit bitmap).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Privileges: u128 {
        /// Shut down or reboot the system.
        const SHUTDOWN = 1 << 0;
        /// Mark processes as fatal to the system.
        const FATAL = 1 << 1;
        /// Load kernel modules.
        const MODULE = 1 << 2;
        /// Change user and group identity.
        const CHANGE_IDENTITY = 1 << 3;
        /// Change ownership of objects.
        const CHANGE_OWNER = 1 << 4;
        /// Filesystem administration.
        const FS_ADMIN = 1 << 5;
        /// Change the filesystem root.
        const FS_SETROOT = 1 << 6;
        /// Mount and unmount filesystems.
        const FS_MOUNT = 1 << 7;
        /// Process administration.
        const PROCESS_ADMIN = 1 << 8;
    }
}

/// Identity and privileges of a process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecurityContext {
    /// User ID.
    pub uid: UserId,
    /// Primary group ID.
    pub gid: GroupId,
    groups: [Option<GroupId>; MAX_GROUPS],
    /// Effective privileges.
    pub privileges: Privileges,
    /// Privileges passed on to child processes.
    pub inherit: Privileges,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl SecurityContext {
    /// Context with no supplementary groups and no privileges.
    pub fn new(uid: UserId, gid: GroupId) -> Self {
        Self {
            uid,
            gid,
            groups: [None; MAX_GROUPS],
            privileges: Privileges::empty(),
            inherit: Privileges::empty(),
        }
    }

    /// Builder-style privilege grant.
    pub fn with_privileges(mut self, privileges: Privileges) -> Self {
        self.privileges |= privileges;
        self
    }

    /// Supplementary groups in slot order.
    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.groups.iter().flatten().copied()
    }

    /// First populated supplementary group slot.
    pub fn primary_group(&self) -> Option<GroupId> {
        self.groups().next()
    }

    /// Whether `gid` is the primary group or a supplementary group.
    pub fn has_group(&self, gid: GroupId) -> bool {
        self.gid == gid || self.groups().any(|g| g == gid)
    }

    /// Adds a supplementary group into the first free slot. Adding a present group is a no-op.
    pub fn add_group(&mut self, gid: GroupId) -> Result<()> {
        if self.groups().any(|g| g == gid) {
            return Ok(());
        }
        let slot = self.groups.iter_mut().find(|slot| slot.is_none()).ok_or(Status::NoMemory)?;
        *slot = Some(gid);
        Ok(())
    }

    /// Removes a supplementary group; the slot becomes free.
    pub fn remove_group(&mut self, gid: GroupId) {
        for slot in self.groups.iter_mut().filter(|slot| **slot == Some(gid)) {
            *slot = None;
        }
    }

    /// Whether every privilege in `privilege` is held.
    pub fn has_privilege(&self, privilege: Privileges) -> bool {
        self.privileges.contains(privilege)
    }

    /// Grants `privilege`.
    pub fn set_privilege(&mut self, privilege: Privileges) {
        self.privileges.insert(privilege);
    }

    /// Revokes `privilege`.
    pub fn unset_privilege(&mut self, privilege: Privileges) {
        self.privileges.remove(privilege);
    }

    /// Context a child process starts with.
    pub fn inherited(&self) -> Self {
        let mut child = self.clone();
        child.privileges &= self.inherit;
        child
    }
}

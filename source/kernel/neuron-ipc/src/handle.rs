// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process handle table mapping integer IDs to kernel objects
//! OWNERS: @kernel-team
//! PUBLIC API: HandleTable, HandleId, HandleFlags, InheritPolicy
//! DEPENDS_ON: object::KernelObject
//! INVARIANTS:
//!   - Allocation always picks the smallest free ID
//!   - TRANSFERABLE/INHERITABLE only ever set on transferable object types
//!   - Attach/detach hooks run under the table write lock (lock order: table -> port -> connection)
//!   - A looked-up object is an owned reference, so reusing its ID cannot invalidate it
//! TEST_COVERAGE: unit tests below + tests_prop.rs

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::object::{KernelObject, ObjectType};
use crate::process::ProcessId;
use crate::status::{Result, Status};

/// Per-process handle identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u32);

impl HandleId {
    /// Sentinel naming the calling process' root port wherever a port handle is accepted.
    pub const ROOT_PORT: Self = Self(u32::MAX);

    /// Wraps a raw ID.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric ID.
    pub const fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Per-entry flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HandleFlags: u32 {
        /// Copied into child processes created without an explicit map.
        const INHERITABLE = 1 << 0;
        /// May be attached to an outgoing message.
        const TRANSFERABLE = 1 << 1;
    }
}

/// How handles reach a newly created process.
#[derive(Clone, Copy, Debug)]
pub enum InheritPolicy<'a> {
    /// Copy every INHERITABLE entry to the same ID.
    Inheritable,
    /// Copy exactly these `(parent source, child destination)` pairs, ignoring INHERITABLE.
    Map(&'a [(HandleId, HandleId)]),
}

struct Entry {
    object: KernelObject,
    flags: HandleFlags,
}

/// Handle table owned by one process.
pub struct HandleTable {
    owner: ProcessId,
    slots: RwLock<Vec<Option<Entry>>>,
}

impl HandleTable {
    pub(crate) fn new(owner: ProcessId, size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self { owner, slots: RwLock::new(slots) }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no handle is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether at least one slot is free.
    pub fn has_free_slot(&self) -> bool {
        self.slots.read().iter().any(Option::is_none)
    }

    /// Installs `object` at the smallest free ID with the default flags for its type.
    pub fn attach(&self, object: KernelObject) -> Result<HandleId> {
        let flags = if object.object_type().is_transferable() {
            HandleFlags::TRANSFERABLE
        } else {
            HandleFlags::empty()
        };
        self.attach_with_flags(object, flags)
    }

    pub(crate) fn attach_with_flags(&self, object: KernelObject, flags: HandleFlags) -> Result<HandleId> {
        let flags = sanitize(object.object_type(), flags);
        let mut slots = self.slots.write();
        let index = slots.iter().position(Option::is_none).ok_or(Status::NoHandles)?;
        object.on_attach(self.owner);
        slots[index] = Some(Entry { object, flags });
        Ok(HandleId(index as u32))
    }

    fn attach_at(&self, dest: HandleId, object: KernelObject, flags: HandleFlags) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(dest.index()).ok_or(Status::InvalidHandle)?;
        if slot.is_some() {
            return Err(Status::AlreadyExists);
        }
        object.on_attach(self.owner);
        *slot = Some(Entry { flags: sanitize(object.object_type(), flags), object });
        Ok(())
    }

    /// Returns a reference to the object at `id`, checking its type when `expected` is given.
    pub fn lookup(&self, id: HandleId, expected: Option<ObjectType>) -> Result<KernelObject> {
        let slots = self.slots.read();
        let entry = slots.get(id.index()).and_then(Option::as_ref).ok_or(Status::InvalidHandle)?;
        match expected {
            Some(ty) if ty != entry.object.object_type() => Err(Status::InvalidHandle),
            _ => Ok(entry.object.clone()),
        }
    }

    /// Looks up `id` and returns the object together with its entry flags.
    pub(crate) fn lookup_with_flags(&self, id: HandleId) -> Result<(KernelObject, HandleFlags)> {
        let slots = self.slots.read();
        let entry = slots.get(id.index()).and_then(Option::as_ref).ok_or(Status::InvalidHandle)?;
        Ok((entry.object.clone(), entry.flags))
    }

    /// Removes the binding at `id` and returns the object.
    pub fn detach(&self, id: HandleId) -> Result<KernelObject> {
        let mut slots = self.slots.write();
        let entry = slots.get_mut(id.index()).and_then(Option::take).ok_or(Status::InvalidHandle)?;
        entry.object.on_detach(self.owner);
        Ok(entry.object)
    }

    /// Removes the binding at `id` only if it still refers to `object`.
    pub(crate) fn detach_if_same(&self, id: HandleId, object: &KernelObject) -> Option<KernelObject> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id.index())?;
        if !slot.as_ref().is_some_and(|entry| entry.object.same_object(object)) {
            return None;
        }
        let entry = slot.take()?;
        entry.object.on_detach(self.owner);
        Some(entry.object)
    }

    /// Flags of the entry at `id`.
    pub fn flags(&self, id: HandleId) -> Result<HandleFlags> {
        let slots = self.slots.read();
        slots.get(id.index()).and_then(Option::as_ref).map(|e| e.flags).ok_or(Status::InvalidHandle)
    }

    /// Replaces the flags of the entry at `id`.
    pub fn set_flags(&self, id: HandleId, flags: HandleFlags) -> Result<()> {
        let mut slots = self.slots.write();
        let entry = slots.get_mut(id.index()).and_then(Option::as_mut).ok_or(Status::InvalidHandle)?;
        if !flags.is_empty() && !entry.object.object_type().is_transferable() {
            return Err(Status::NotSupported);
        }
        entry.flags = flags;
        Ok(())
    }

    /// Installs another reference to the object at `id`, at `dest` or the smallest free ID.
    pub fn duplicate(&self, id: HandleId, dest: Option<HandleId>) -> Result<HandleId> {
        let (object, flags) = self.lookup_with_flags(id)?;
        match dest {
            Some(dest) => self.attach_at(dest, object, flags).map(|()| dest),
            None => self.attach_with_flags(object, flags),
        }
    }

    /// Copies entries into `child` according to `policy`.
    pub fn inherit_into(&self, child: &HandleTable, policy: InheritPolicy<'_>) -> Result<()> {
        match policy {
            InheritPolicy::Inheritable => {
                let inheritable: Vec<(HandleId, KernelObject, HandleFlags)> = {
                    let slots = self.slots.read();
                    slots
                        .iter()
                        .enumerate()
                        .filter_map(|(index, slot)| {
                            let entry = slot.as_ref()?;
                            entry.flags.contains(HandleFlags::INHERITABLE).then(|| {
                                (HandleId(index as u32), entry.object.clone(), entry.flags)
                            })
                        })
                        .collect()
                };
                for (id, object, flags) in inheritable {
                    child.attach_at(id, object, flags)?;
                }
                Ok(())
            }
            InheritPolicy::Map(pairs) => {
                for &(source, dest) in pairs {
                    let (object, flags) = self.lookup_with_flags(source)?;
                    if dest.index() >= child.capacity() {
                        return Err(Status::InvalidHandle);
                    }
                    if !object.object_type().is_transferable() {
                        return Err(Status::NotSupported);
                    }
                    child.attach_at(dest, object, flags)?;
                }
                Ok(())
            }
        }
    }

    /// Detaches every entry (process exit). Objects are returned so they drop outside the lock.
    pub(crate) fn drain(&self) -> Vec<KernelObject> {
        let mut slots = self.slots.write();
        let owner = self.owner;
        slots
            .iter_mut()
            .filter_map(Option::take)
            .map(|entry| {
                entry.object.on_detach(owner);
                entry.object
            })
            .collect()
    }
}

fn sanitize(ty: ObjectType, flags: HandleFlags) -> HandleFlags {
    if ty.is_transferable() {
        flags
    } else {
        HandleFlags::empty()
    }
}

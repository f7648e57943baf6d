// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel objects reachable through handles
//! OWNERS: @kernel-team
//! PUBLIC API: KernelObject, ObjectType, Resource
//! DEPENDS_ON: port::Port, connection::EndpointHandle

use std::fmt;
use std::sync::Arc;

use crate::connection::EndpointHandle;
use crate::port::Port;
use crate::process::ProcessId;

/// Object type tag used for lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// IPC port.
    Port,
    /// One end of an IPC connection.
    Connection,
    /// Generic named kernel resource.
    Resource,
}

impl ObjectType {
    /// Whether handles to objects of this type may cross process boundaries.
    pub const fn is_transferable(self) -> bool {
        !matches!(self, Self::Connection)
    }
}

/// Generic kernel resource (file, timer, ...) used where only identity matters.
#[derive(Debug, PartialEq, Eq)]
pub struct Resource {
    name: String,
}

impl Resource {
    /// Creates a named resource.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared reference to a kernel object.
#[derive(Clone)]
pub enum KernelObject {
    /// IPC port.
    Port(Arc<Port>),
    /// Connection endpoint.
    Connection(Arc<EndpointHandle>),
    /// Generic resource.
    Resource(Arc<Resource>),
}

impl KernelObject {
    /// Type tag of the referenced object.
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Port(_) => ObjectType::Port,
            Self::Connection(_) => ObjectType::Connection,
            Self::Resource(_) => ObjectType::Resource,
        }
    }

    /// Whether both references point at the same object.
    pub fn same_object(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Port(a), Self::Port(b)) => Arc::ptr_eq(a, b),
            (Self::Connection(a), Self::Connection(b)) => Arc::ptr_eq(a, b),
            (Self::Resource(a), Self::Resource(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn on_attach(&self, process: ProcessId) {
        if let Self::Port(port) = self {
            port.owner_attach(process);
        }
    }

    pub(crate) fn on_detach(&self, process: ProcessId) {
        if let Self::Port(port) = self {
            port.owner_detach(process);
        }
    }
}

impl fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => f.debug_tuple("Port").field(&port.owner()).finish(),
            Self::Connection(ep) => f.debug_tuple("Connection").field(&ep.role()).finish(),
            Self::Resource(res) => f.debug_tuple("Resource").field(&res.name()).finish(),
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service registry: catalog entries, registered ports and held connections
//! OWNERS: @runtime
//! PUBLIC API: Registry, ServiceSpec, ServiceInfo, Resolution, Generation
//! INVARIANTS:
//!   - At most one port per service; replacing it requires the old one to be dead or cleared
//!   - Every registration change bumps both the service and the registry generation
//!   - Held connections are only handed out once (take_pending)
//! TEST_COVERAGE: unit tests below, tests_prop.rs

use std::collections::HashMap;

use log::info;
use neuron_ipc::{HandleId, ProcessId};
use parking_lot::Mutex;

use crate::{Error, Result};

/// Monotonic generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    const fn first() -> Self {
        Self(1)
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Name clients connect to.
    pub name: String,
    /// Started on the first connection instead of at manager start-up.
    pub on_demand: bool,
    /// Reachable over IPC.
    pub ipc: bool,
}

impl ServiceSpec {
    /// IPC service entry.
    pub fn new(name: impl Into<String>, on_demand: bool) -> Self {
        Self { name: name.into(), on_demand, ipc: true }
    }
}

/// Snapshot of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Catalog entry.
    pub spec: ServiceSpec,
    /// Registered port, as a handle in the manager's table.
    pub port: Option<HandleId>,
    /// Process started for the service, if the manager launched it.
    pub pid: Option<ProcessId>,
    /// Connections held until the port registers.
    pub pending: usize,
    /// Bumped on every registration change.
    pub generation: Generation,
}

/// Where a connection for a name should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Name not in the registry.
    Unknown,
    /// Forward to this port.
    Ready(HandleId),
    /// Hold the connection; `launch` asks the caller to start the service first.
    NotReady {
        /// The service is on-demand and not running.
        launch: bool,
    },
}

struct ServiceRecord {
    spec: ServiceSpec,
    port: Option<HandleId>,
    pid: Option<ProcessId>,
    pending: Vec<HandleId>,
    generation: Generation,
}

impl ServiceRecord {
    fn new(spec: ServiceSpec) -> Self {
        Self { spec, port: None, pid: None, pending: Vec::new(), generation: Generation::first() }
    }

    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            spec: self.spec.clone(),
            port: self.port,
            pid: self.pid,
            pending: self.pending.len(),
            generation: self.generation,
        }
    }
}

struct Inner {
    services: HashMap<String, ServiceRecord>,
    open_registration: bool,
    generation: Generation,
}

impl Inner {
    fn bump(&mut self) -> Generation {
        self.generation = self.generation.next();
        self.generation
    }
}

/// Services known to one manager.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry accepting registrations for unknown names.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                services: HashMap::new(),
                open_registration: true,
                generation: Generation::first(),
            }),
        }
    }

    /// Registry preloaded with `specs`.
    pub fn with_services(specs: impl IntoIterator<Item = ServiceSpec>) -> Result<Self> {
        let registry = Self::new();
        for spec in specs {
            registry.add(spec)?;
        }
        Ok(registry)
    }

    /// Whether REGISTER_PORT may introduce names missing from the catalog.
    pub fn set_open_registration(&self, open: bool) {
        self.inner.lock().open_registration = open;
    }

    /// Adds a catalog entry.
    pub fn add(&self, spec: ServiceSpec) -> Result<()> {
        crate::validate_name(spec.name.as_bytes())?;
        let mut inner = self.inner.lock();
        if inner.services.contains_key(&spec.name) {
            return Err(Error::AlreadyExists);
        }
        inner.services.insert(spec.name.clone(), ServiceRecord::new(spec));
        inner.bump();
        Ok(())
    }

    /// Registry-wide generation.
    pub fn generation(&self) -> Generation {
        self.inner.lock().generation
    }

    /// Snapshot of `name`.
    pub fn service(&self, name: &str) -> Option<ServiceInfo> {
        self.inner.lock().services.get(name).map(ServiceRecord::info)
    }

    /// Catalog entries in name order.
    pub fn specs(&self) -> Vec<ServiceSpec> {
        let inner = self.inner.lock();
        let mut specs: Vec<ServiceSpec> = inner.services.values().map(|r| r.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Decides where a connection for `name` goes.
    pub fn resolve(&self, name: &str) -> Resolution {
        let inner = self.inner.lock();
        match inner.services.get(name) {
            None => Resolution::Unknown,
            Some(record) if !record.spec.ipc => Resolution::Unknown,
            Some(record) => match record.port {
                Some(port) => Resolution::Ready(port),
                None => Resolution::NotReady { launch: record.spec.on_demand && record.pid.is_none() },
            },
        }
    }

    /// Records the process started for `name`.
    pub fn mark_started(&self, name: &str, pid: ProcessId) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.services.get_mut(name).ok_or(Error::NotFound)?;
        record.pid = Some(pid);
        Ok(())
    }

    /// Forgets the process of `name`, e.g. after a failed launch.
    pub fn mark_stopped(&self, name: &str) {
        if let Some(record) = self.inner.lock().services.get_mut(name) {
            record.pid = None;
        }
    }

    /// Holds a half-open connection until `name` registers its port.
    pub fn hold(&self, name: &str, connection: HandleId) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.services.get_mut(name).ok_or(Error::NotFound)?;
        record.pending.push(connection);
        Ok(())
    }

    /// Takes the connections held for `name`.
    pub fn take_pending(&self, name: &str) -> Vec<HandleId> {
        let mut inner = self.inner.lock();
        inner.services.get_mut(name).map(|record| std::mem::take(&mut record.pending)).unwrap_or_default()
    }

    /// Every held connection, across all services.
    pub fn held(&self) -> Vec<HandleId> {
        let inner = self.inner.lock();
        inner.services.values().flat_map(|record| record.pending.iter().copied()).collect()
    }

    /// Forgets a held connection wherever it is parked. Returns `true` if it was found.
    pub fn release_pending(&self, connection: HandleId) -> bool {
        let mut inner = self.inner.lock();
        for record in inner.services.values_mut() {
            if let Some(index) = record.pending.iter().position(|h| *h == connection) {
                record.pending.remove(index);
                return true;
            }
        }
        false
    }

    /// Records `port` for `name` on behalf of process `caller`.
    ///
    /// `is_live` reports whether an already registered port still has an owner.
    /// Returns the port it replaced, which the caller must close.
    pub fn register(
        &self,
        name: &str,
        port: HandleId,
        caller: ProcessId,
        is_live: impl FnOnce(HandleId) -> bool,
    ) -> Result<(Generation, Option<HandleId>)> {
        crate::validate_name(name.as_bytes())?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.services.contains_key(name) {
            if !inner.open_registration {
                return Err(Error::NotFound);
            }
            inner.services.insert(name.to_owned(), ServiceRecord::new(ServiceSpec::new(name, false)));
        }
        let Some(record) = inner.services.get_mut(name) else {
            return Err(Error::NotFound);
        };
        if record.pid.is_some_and(|pid| pid != caller) {
            return Err(Error::AccessDenied);
        }
        if record.port.is_some_and(is_live) {
            return Err(Error::AlreadyExists);
        }
        let replaced = record.port.replace(port);
        record.pid = Some(caller);
        record.generation = record.generation.next();
        let generation = record.generation;
        inner.bump();
        info!("samgr: registered {name} ({caller}), generation {}", generation.value());
        Ok((generation, replaced))
    }

    /// Clears the port of `name` once its owner is gone. Returns the stale handle.
    pub fn clear_port(&self, name: &str) -> Option<HandleId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let record = inner.services.get_mut(name)?;
        let stale = record.port.take()?;
        record.pid = None;
        record.generation = record.generation.next();
        inner.bump();
        Some(stale)
    }
}

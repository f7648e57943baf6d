// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Service-manager daemon: TOML service catalog, scope selection and entry loop
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - ServiceCatalog / CatalogService / Scope: catalog file model
//!   - Daemon: manager wired from a catalog
//!   - service_main_loop(): build and run until stopped
//!   - ReadyNotifier: readiness callback
//!
//! DEPENDENCIES:
//!   - samgr: registry, manager loop and protocol
//!   - serde/toml: catalog parsing
//!   - thiserror: CatalogError, DaemonError

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use neuron_ipc::{HandleId, KernelObject, ObjectType, Port, Status, Thread};
use samgr::{Launcher, Manager, Registry, ServiceSpec, StopHandle};
use serde::Deserialize;

/// Which manager a daemon instance plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The system-wide manager; unknown names are rejected.
    #[default]
    System,
    /// A per-session manager; unknown names go to the system manager behind the root port.
    Session,
}

/// One `[[service]]` table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogService {
    /// Service name as clients pass it to `connect_to_service`.
    pub name: String,
    /// Start on first connect rather than at daemon start.
    #[serde(default)]
    pub on_demand: bool,
    /// Whether the service registers a port.
    #[serde(default = "default_true")]
    pub ipc: bool,
}

/// Service catalog file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceCatalog {
    /// Manager scope.
    pub scope: Scope,
    /// Accept registrations for names missing from the catalog.
    pub open_registration: bool,
    /// Known services.
    #[serde(rename = "service")]
    pub services: Vec<CatalogService>,
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        Self { scope: Scope::System, open_registration: true, services: Vec::new() }
    }
}

fn default_true() -> bool {
    true
}

/// Errors raised while loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Reading the file failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// Catalog location.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// TOML parsing failed.
    #[error("failed to parse service catalog {path}: {source}")]
    Parse {
        /// Catalog location.
        path: PathBuf,
        /// Deserializer error.
        source: toml::de::Error,
    },
    /// Parsed but unusable.
    #[error("invalid service catalog: {reason}")]
    Invalid {
        /// Violated constraint.
        reason: String,
    },
}

impl ServiceCatalog {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        Self::parse(raw, Path::new("<inline>"))
    }

    /// Reads, parses and validates the catalog at `path`.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CatalogError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, CatalogError> {
        let catalog: Self = toml::from_str(raw)
            .map_err(|source| CatalogError::Parse { path: path.to_path_buf(), source })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Rejects invalid and duplicate service names.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if samgr::validate_name(service.name.as_bytes()).is_err() {
                return Err(CatalogError::Invalid { reason: format!("bad service name {:?}", service.name) });
            }
            if !seen.insert(service.name.as_str()) {
                return Err(CatalogError::Invalid { reason: format!("duplicate service {}", service.name) });
            }
        }
        Ok(())
    }

    /// Builds a registry holding every catalog entry.
    pub fn registry(&self) -> Result<Registry, CatalogError> {
        let specs = self.services.iter().map(|service| ServiceSpec {
            name: service.name.clone(),
            on_demand: service.on_demand,
            ipc: service.ipc,
        });
        let registry = Registry::with_services(specs)
            .map_err(|err| CatalogError::Invalid { reason: err.to_string() })?;
        registry.set_open_registration(self.open_registration);
        Ok(registry)
    }
}

/// Errors surfaced by the daemon entry points.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Catalog could not be used.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Setting up the manager port failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] Status),
    /// The manager loop failed.
    #[error("manager error: {0}")]
    Manager(#[from] samgr::Error),
}

/// Readiness callback invoked once the manager port exists.
pub struct ReadyNotifier(Box<dyn FnOnce() + Send>);

impl ReadyNotifier {
    /// Creates a notifier from the provided closure.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Signals readiness to the caller.
    pub fn notify(self) {
        (self.0)();
    }
}

/// A manager built from a catalog, owning its port.
pub struct Daemon<'t> {
    thread: &'t Thread,
    port: HandleId,
    scope: Scope,
    manager: Manager<'t>,
}

impl<'t> Daemon<'t> {
    /// Creates the manager port and wires the manager for the catalog's scope.
    pub fn new(thread: &'t Thread, catalog: &ServiceCatalog) -> Result<Self, DaemonError> {
        let registry = Arc::new(catalog.registry()?);
        let port = thread.port_create()?;
        let mut manager = Manager::new(thread, port, registry);
        if catalog.scope == Scope::Session {
            manager = manager.with_upstream(HandleId::ROOT_PORT);
        }
        Ok(Self { thread, port, scope: catalog.scope, manager })
    }

    /// Installs the launcher used for catalog services.
    pub fn with_launcher(mut self, launcher: Box<dyn Launcher + 't>) -> Self {
        self.manager = self.manager.with_launcher(launcher);
        self
    }

    /// Manager port handle in the daemon's process.
    pub fn port(&self) -> HandleId {
        self.port
    }

    /// Manager port object, for installing as other processes' root port.
    pub fn port_object(&self) -> Result<Arc<Port>, DaemonError> {
        match self.thread.process().handles().lookup(self.port, Some(ObjectType::Port))? {
            KernelObject::Port(port) => Ok(port),
            _ => Err(DaemonError::Kernel(Status::IncorrectType)),
        }
    }

    /// Scope the daemon was configured with.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        self.manager.registry()
    }

    /// Handle stopping [`Daemon::run`] from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.manager.stop_handle()
    }

    /// Notifies readiness, then serves until stopped.
    pub fn run(mut self, notifier: ReadyNotifier) -> Result<(), DaemonError> {
        info!("samgr: {:?} manager ready", self.scope);
        notifier.notify();
        self.manager.run()?;
        let _ = self.thread.handle_close(self.port);
        Ok(())
    }
}

/// Builds a daemon for `catalog` on `thread` and runs it until stopped.
pub fn service_main_loop(
    thread: &Thread,
    catalog: &ServiceCatalog,
    launcher: Option<Box<dyn Launcher + '_>>,
    notifier: ReadyNotifier,
) -> Result<(), DaemonError> {
    let mut daemon = Daemon::new(thread, catalog)?;
    if let Some(launcher) = launcher {
        daemon = daemon.with_launcher(launcher);
    }
    daemon.run(notifier)
}

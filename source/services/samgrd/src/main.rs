// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: samgrd entrypoint: hosts a kernel context and runs the system manager
//! USAGE: samgrd [CATALOG.toml [IPC.toml]]

use std::path::Path;
use std::process::ExitCode;

use neuron_ipc::{IpcConfig, Kernel, ProcessSpec, SecurityContext};
use samgrd::{DaemonError, ReadyNotifier, ServiceCatalog};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("samgrd: {err}");
            eprintln!("samgrd: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), DaemonError> {
    let mut args = std::env::args().skip(1);
    let catalog = match args.next() {
        Some(path) => ServiceCatalog::load(Path::new(&path))?,
        None => ServiceCatalog::default(),
    };
    let config = match args.next() {
        Some(path) => IpcConfig::load(Path::new(&path)).map_err(config_error)?,
        None => IpcConfig::default(),
    };
    let kernel = Kernel::new(config).map_err(config_error)?;
    let process = kernel.create_process(ProcessSpec::new(SecurityContext::default()))?;
    let thread = process.spawn_thread();
    samgrd::service_main_loop(&thread, &catalog, None, ReadyNotifier::new(|| eprintln!("samgrd: ready")))
}

fn config_error(err: neuron_ipc::ConfigError) -> DaemonError {
    DaemonError::Catalog(samgrd::CatalogError::Invalid { reason: err.to_string() })
}

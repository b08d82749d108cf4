//! Service bootstrap
//!
//! Command-line parsing, logging setup and the startup checks that must pass
//! before the collector starts: configuration, register catalog and the
//! lookup tables it references.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::service_bootstrap::{self, ServiceInfo};
use errors::VoltageResult;
use tracing::info;

use crate::catalog::{deye_catalog, RegisterCatalog};
use crate::config::AppConfig;
use crate::decode::{DecodeEngine, LookupTables};
use crate::error::Result;
use crate::session::ChunkPlan;

pub use common::bootstrap_args::ServiceArgs;

/// Command-line arguments for invsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "invsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inverter Service",
    long_about = None
)]
pub struct Args {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// YAML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Read the inverter once, print the decoded values as JSON and exit
    #[arg(long)]
    pub once: bool,
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "invsrv",
        env!("CARGO_PKG_VERSION"),
        "Inverter Service - Deye polling, Prometheus and MQTT fan-out",
        8181,
    )
}

/// Initialize logging from the CLI, falling back to `logging.dir`
///
/// In `--once` mode the console stays at `warn` unless asked otherwise.
pub fn initialize_logging(
    args: &Args,
    service: &ServiceInfo,
    config: &AppConfig,
) -> VoltageResult<()> {
    let mut service_args = args.service.clone();
    if service_args.log_dir.is_none() {
        service_args.log_dir = config
            .logging
            .dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned());
    }
    if args.once && !service_args.is_development() && service_args.log_level == "info" {
        service_args.log_level = "warn".to_string();
    }

    service_bootstrap::init_logging(service, &service_args)
}

/// Built-in Deye map, or the YAML register map named in the config
pub fn load_catalog(config: &AppConfig) -> Result<RegisterCatalog> {
    match &config.register_map {
        Some(path) => {
            info!("Loading register map from {}", path.display());
            RegisterCatalog::from_file(path)
        },
        None => Ok(deye_catalog()),
    }
}

/// Catalog plus a decode engine known to hold every table it references
pub fn prepare_decoding(config: &AppConfig) -> Result<(Arc<RegisterCatalog>, DecodeEngine)> {
    let catalog = load_catalog(config)?;
    let engine = DecodeEngine::new(LookupTables::deye());
    engine.check_catalog(&catalog)?;

    let plan = ChunkPlan::for_catalog(&catalog, config.device.max_span);
    info!(
        "Register catalog: {} entries, highest register {}, {} reads per cycle",
        catalog.len(),
        catalog.highest_register(),
        plan.len()
    );
    Ok((Arc::new(catalog), engine))
}

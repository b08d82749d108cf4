//! Unified service bootstrap utilities
//!
//! Provides common initialization functionality for all VoltageEMS services,
//! including startup banners and logging initialization.

use std::path::PathBuf;

use errors::{VoltageError, VoltageResult};
use tracing::info;

use crate::bootstrap_args::ServiceArgs;
use crate::logging::{self, LogConfig};

/// Service metadata for startup
pub struct ServiceInfo {
    /// Service name (e.g., "invsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
    /// Default port
    pub default_port: u16,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        default_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            default_port,
        }
    }
}

/// Print unified startup banner for any service
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = match service.name.as_str() {
        "invsrv" => {
            r#"
 ██╗███╗   ██╗██╗   ██╗███████╗██████╗ ██╗   ██╗
 ██║████╗  ██║██║   ██║██╔════╝██╔══██╗██║   ██║
 ██║██╔██╗ ██║██║   ██║███████╗██████╔╝██║   ██║
 ██║██║╚██╗██║╚██╗ ██╔╝╚════██║██╔══██╗╚██╗ ██╔╝
 ██║██║ ╚████║ ╚████╔╝ ███████║██║  ██║ ╚████╔╝
 ╚═╝╚═╝  ╚═══╝  ╚═══╝  ╚══════╝╚═╝  ╚═╝  ╚═══╝
            "#
        },
        _ => {
            r#"
 ██╗   ██╗ ██████╗ ██╗  ████████╗ █████╗  ██████╗ ███████╗
 ██║   ██║██╔═══██╗██║  ╚══██╔══╝██╔══██╗██╔════╝ ██╔════╝
 ██║   ██║██║   ██║██║     ██║   ███████║██║  ███╗█████╗
 ╚██╗ ██╔╝██║   ██║██║     ██║   ██╔══██║██║   ██║██╔══╝
  ╚████╔╝ ╚██████╔╝███████╗██║   ██║  ██║╚██████╔╝███████╗
   ╚═══╝   ╚═════╝ ╚══════╝╚═╝   ╚═╝  ╚═╝ ╚═════╝ ╚══════╝
            "#
        },
    };

    info!("{}", banner);
    info!("");
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Default Port: {}", service.default_port);
    info!("");
}

/// Initialize logging for a service from its command-line arguments
pub fn init_logging(service: &ServiceInfo, args: &ServiceArgs) -> VoltageResult<()> {
    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: args
            .log_dir
            .as_ref()
            .map(|dir| PathBuf::from(dir).join(&service.name)),
        console_level: args.parse_log_level(),
        ansi: !args.no_color,
    };

    logging::init_with_config(log_config)
        .map_err(|e| VoltageError::Configuration(format!("Failed to init logging: {}", e)))
}

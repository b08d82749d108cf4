//! Inverter Service (invsrv)
//!
//! Deye inverter poller with Prometheus and MQTT fan-out.

use clap::Parser;
use tracing::{error, info};

use common::service_bootstrap;
use common::shutdown::shutdown_token;
use errors::{VoltageError, VoltageResult};

use invsrv::{
    bootstrap::{self, Args},
    config::AppConfig,
    runtime,
};

#[tokio::main]
async fn main() -> VoltageResult<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = AppConfig::load(args.config.as_deref())?;
    bootstrap::initialize_logging(&args, &service_info, &config)?;
    if !args.service.no_color && !args.once {
        service_bootstrap::print_startup_banner(&service_info);
    }

    let (catalog, engine) = bootstrap::prepare_decoding(&config)?;

    if args.service.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    if args.once {
        let snapshot = runtime::run_once(&config, &catalog, &engine).await?;
        let json = serde_json::to_string_pretty(&snapshot.to_payload())
            .map_err(|e| VoltageError::Serialization(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    info!(
        "Polling {} every {}s",
        config.device.endpoint(),
        config.collector.period_secs
    );
    let shutdown = shutdown_token();
    if let Err(e) = runtime::run_service(config, catalog, engine, shutdown).await {
        error!("Service terminated: {}", e);
        return Err(e.into());
    }

    info!("Service shutdown complete");
    Ok(())
}

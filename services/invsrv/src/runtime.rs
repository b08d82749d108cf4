//! Service runtime
//!
//! Wires the collector, the distributor and the consumers together and
//! supervises them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::RegisterCatalog;
use crate::clock::{Clock, SystemClock};
use crate::collector::Collector;
use crate::config::AppConfig;
use crate::decode::DecodeEngine;
use crate::distributor::Distributor;
use crate::error::{InvSrvError, Result};
use crate::exporter::{self, MetricsExporter};
use crate::publisher::{MessagePublisher, MessageSink, MqttSink};
use crate::session::{ChunkedReader, ReadError};
use crate::snapshot::Snapshot;
use crate::transport::solarman::SolarmanTransport;
use crate::transport::Transport;

/// Time given to workers to stop after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn solarman(config: &AppConfig) -> SolarmanTransport {
    SolarmanTransport::new(config.device.connect_timeout(), config.device.read_timeout())
}

/// Run the service against the configured Solarman logger and MQTT broker
pub async fn run_service(
    config: AppConfig,
    catalog: Arc<RegisterCatalog>,
    engine: DecodeEngine,
    shutdown: CancellationToken,
) -> Result<()> {
    let transport = solarman(&config);
    let sink = config.mqtt.settings().map(MqttSink::new);
    run_with(
        config,
        catalog,
        engine,
        transport,
        sink,
        Arc::new(SystemClock::new()),
        shutdown,
    )
    .await
}

/// Run the service with an explicit transport, sink and clock
///
/// Returns `Ok` after `shutdown` fires. A collector that stops on its own is
/// an error so the process supervisor can restart the service.
pub async fn run_with<T, S>(
    config: AppConfig,
    catalog: Arc<RegisterCatalog>,
    engine: DecodeEngine,
    transport: T,
    sink: Option<S>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> Result<()>
where
    T: Transport + 'static,
    S: MessageSink + 'static,
{
    let mut distributor = Distributor::new();

    let exporter = Arc::new(MetricsExporter::new(
        distributor.register("exporter"),
        config.exporter.freshness(),
        config.exporter.metric_prefix.clone(),
        clock.clone(),
    ));
    let listener = exporter::bind(config.exporter.socket_addr()?).await?;

    let publisher = match sink {
        Some(sink) => Some(MessagePublisher::new(
            sink,
            distributor.register("publisher"),
            config.mqtt.topic.clone(),
            config.mqtt.timing(),
            clock.clone(),
        )),
        None => {
            info!("MQTT publishing disabled (no mqtt.host)");
            None
        },
    };

    let reader = ChunkedReader::new(
        transport,
        config.device.endpoint(),
        config.device.max_span,
        config.device.retry_policy(),
        clock.clone(),
    );
    let collector = Collector::new(
        reader,
        engine,
        catalog,
        distributor,
        clock,
        config.collector.timing(),
    );

    let workers = shutdown.child_token();
    let server_handle = tokio::spawn(exporter::serve(listener, exporter, workers.clone()));
    let publisher_handle = publisher.map(|p| tokio::spawn(p.run(workers.clone())));
    let mut collector_handle = tokio::spawn(collector.run(workers.clone()));

    info!("Service started");
    let outcome = watch_collector(&mut collector_handle, &shutdown).await;

    workers.cancel();
    if outcome.is_ok() {
        join_worker("collector", collector_handle).await;
    }
    if let Some(handle) = publisher_handle {
        join_worker("publisher", handle).await;
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
        Ok(Ok(Err(e))) => error!("Metrics endpoint failed: {}", e),
        Ok(Err(e)) => error!("Metrics endpoint task failed: {}", e),
        Err(_) => warn!("Metrics endpoint did not stop within {:?}", SHUTDOWN_GRACE),
        Ok(Ok(Ok(()))) => {},
    }

    info!("Service stopped");
    outcome
}

/// Wait for shutdown; a collector exit before that is fatal
pub async fn watch_collector(
    handle: &mut JoinHandle<()>,
    shutdown: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        result = handle => {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let reason = match result {
                Ok(()) => "collector stopped unexpectedly".to_string(),
                Err(e) => format!("collector task failed: {}", e),
            };
            error!("{}", reason);
            Err(InvSrvError::internal(reason))
        },
    }
}

async fn join_worker(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!("{} task failed: {}", name, e),
        Err(_) => warn!("{} did not stop within {:?}", name, SHUTDOWN_GRACE),
    }
}

/// One read (with retries) and decode, without consumers
pub async fn run_once(
    config: &AppConfig,
    catalog: &RegisterCatalog,
    engine: &DecodeEngine,
) -> Result<Snapshot> {
    collect_once(config, catalog, engine, solarman(config), Arc::new(SystemClock::new())).await
}

pub async fn collect_once<T: Transport>(
    config: &AppConfig,
    catalog: &RegisterCatalog,
    engine: &DecodeEngine,
    transport: T,
    clock: Arc<dyn Clock>,
) -> Result<Snapshot> {
    let reader = ChunkedReader::new(
        transport,
        config.device.endpoint(),
        config.device.max_span,
        config.device.retry_policy(),
        clock.clone(),
    );

    let raw = reader
        .read(catalog, &CancellationToken::new())
        .await
        .map_err(|e| match e {
            ReadError::Protocol(msg) => InvSrvError::ProtocolError(msg),
            other => InvSrvError::TransportError(other.to_string()),
        })?;
    let decoded = engine.decode(&raw, catalog);
    if decoded.values.is_empty() {
        return Err(InvSrvError::DecodeError(format!(
            "no field could be decoded ({} failures)",
            decoded.failures.len()
        )));
    }
    Ok(Snapshot::new(decoded.values, clock.stamp()))
}

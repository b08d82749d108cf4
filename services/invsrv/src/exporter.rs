//! Prometheus metrics exporter
//!
//! Pull-based consumer: every scrape drains the exporter's queue without
//! blocking, keeps the newest snapshot it has seen, and renders it unless
//! it is older than the freshness threshold.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::distributor::SnapshotReceiver;
use crate::error::{InvSrvError, Result};
use crate::snapshot::{Snapshot, Value};

pub const DEFAULT_METRIC_PREFIX: &str = "deye_inverter_metrics";

pub struct MetricsExporter {
    receiver: SnapshotReceiver,
    held: Mutex<Option<Snapshot>>,
    freshness: Duration,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl MetricsExporter {
    pub fn new(
        receiver: SnapshotReceiver,
        freshness: Duration,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            receiver,
            held: Mutex::new(None),
            freshness,
            prefix: prefix.into(),
            clock,
        }
    }

    /// Snapshot to expose right now, if any
    ///
    /// A queued snapshot replaces the held one; a held snapshot older than
    /// the freshness threshold is discarded.
    pub fn current(&self) -> Option<Snapshot> {
        let mut held = self.held.lock();
        if let Some(latest) = self.receiver.try_recv() {
            *held = Some(latest);
        }

        let age = held.as_ref()?.age(self.clock.monotonic());
        if age > self.freshness {
            warn!(
                "Discarding stale snapshot: {}s old (limit {}s)",
                age.as_secs(),
                self.freshness.as_secs()
            );
            *held = None;
            return None;
        }
        held.clone()
    }

    /// Prometheus text exposition of the current snapshot
    pub fn render(&self) -> Result<String> {
        let registry = Registry::new();
        let exporter_err = |e: prometheus::Error| InvSrvError::ExporterError(e.to_string());

        let gauges = GaugeVec::new(
            Opts::new(self.prefix.as_str(), "Inverter measurements"),
            &["metric_name", "metric_unit"],
        )
        .map_err(exporter_err)?;
        let info = GaugeVec::new(
            Opts::new(format!("{}_info", self.prefix), "Inverter status values"),
            &["metric_name", "metric_string_value"],
        )
        .map_err(exporter_err)?;
        registry
            .register(Box::new(gauges.clone()))
            .map_err(exporter_err)?;
        registry
            .register(Box::new(info.clone()))
            .map_err(exporter_err)?;

        if let Some(snapshot) = self.current() {
            for metric in snapshot.values() {
                match &metric.value {
                    Value::Number(v) => gauges
                        .with_label_values(&[metric.name.as_str(), metric.unit.as_str()])
                        .set(*v),
                    Value::Text(text) => info
                        .with_label_values(&[metric.name.as_str(), text.as_str()])
                        .set(1.0),
                }
            }
            debug!("Rendering {} metrics", snapshot.len());
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(exporter_err)?;
        String::from_utf8(buffer).map_err(|e| InvSrvError::ExporterError(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    /// Collection time of the snapshot being exposed
    last_collection: Option<String>,
}

async fn metrics_handler(State(exporter): State<Arc<MetricsExporter>>) -> Response {
    match exporter.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        },
    }
}

async fn health_handler(State(exporter): State<Arc<MetricsExporter>>) -> Json<HealthStatus> {
    let last = exporter.current().map(|s| s.collected_at().to_rfc3339());
    Json(HealthStatus {
        status: if last.is_some() { "healthy" } else { "no_data" },
        service: "invsrv",
        version: env!("CARGO_PKG_VERSION"),
        last_collection: last,
    })
}

pub fn router(exporter: Arc<MetricsExporter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(exporter)
}

/// Bind the metrics listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| InvSrvError::ExporterError(format!("Failed to bind to {}: {}", addr, e)))
}

/// Serve the exporter until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    exporter: Arc<MetricsExporter>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics endpoint listening on http://{}/metrics", addr);
    }

    axum::serve(listener, router(exporter))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| InvSrvError::ExporterError(format!("Server error: {}", e)))
}

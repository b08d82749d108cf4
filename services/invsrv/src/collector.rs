//! Collector loop
//!
//! Two states: `Idle` between periods and `Reading` while a read and decode
//! are in flight. A successful cycle is stamped, handed to the distributor
//! and followed by the normal period; a failed one is logged and followed
//! by the error back-off instead.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::catalog::RegisterCatalog;
use crate::clock::Clock;
use crate::decode::DecodeEngine;
use crate::distributor::{Distributor, PublishOutcome};
use crate::session::{ChunkedReader, ReadError};
use crate::snapshot::Snapshot;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Reading,
}

/// Sleep intervals of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorTiming {
    /// Wait after a successful cycle
    pub period: Duration,
    /// Wait after a failed cycle
    pub error_backoff: Duration,
}

impl Default for CollectorTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(20),
            error_backoff: Duration::from_secs(60),
        }
    }
}

/// Why a collection cycle produced no snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("no field could be decoded ({failures} failures)")]
    NothingDecoded { failures: usize },
}

pub struct Collector<T: Transport> {
    reader: ChunkedReader<T>,
    engine: DecodeEngine,
    catalog: Arc<RegisterCatalog>,
    distributor: Distributor,
    clock: Arc<dyn Clock>,
    timing: CollectorTiming,
    state: CollectorState,
}

impl<T: Transport> Collector<T> {
    pub fn new(
        reader: ChunkedReader<T>,
        engine: DecodeEngine,
        catalog: Arc<RegisterCatalog>,
        distributor: Distributor,
        clock: Arc<dyn Clock>,
        timing: CollectorTiming,
    ) -> Self {
        Self {
            reader,
            engine,
            catalog,
            distributor,
            clock,
            timing,
            state: CollectorState::Idle,
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// One read + decode, published to every consumer on success
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<Snapshot, CollectError> {
        self.state = CollectorState::Reading;
        let result = self.collect(cancel).await;
        self.state = CollectorState::Idle;

        let snapshot = result?;
        if let PublishOutcome::Delivered { overwritten, .. } =
            self.distributor.publish(snapshot.clone())
        {
            if overwritten > 0 {
                debug!("{} consumer queue(s) overwritten", overwritten);
            }
        }
        Ok(snapshot)
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Snapshot, CollectError> {
        let raw = self.reader.read(&self.catalog, cancel).await?;
        let decoded = self.engine.decode(&raw, &self.catalog);

        if decoded.values.is_empty() {
            return Err(CollectError::NothingDecoded {
                failures: decoded.failures.len(),
            });
        }

        let snapshot = Snapshot::new(decoded.values, self.clock.stamp());
        info!(
            "Collected {} values from {} ({} skipped)",
            snapshot.len(),
            self.reader.endpoint(),
            decoded.failures.len()
        );
        Ok(snapshot)
    }

    /// Run until `cancel` fires
    ///
    /// Returning is only expected after cancellation; the caller treats any
    /// other exit as fatal.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Collector started: period {}s, error back-off {}s",
            self.timing.period.as_secs(),
            self.timing.error_backoff.as_secs()
        );

        while !cancel.is_cancelled() {
            let wait = match self.run_cycle(&cancel).await {
                Ok(_) => self.timing.period,
                Err(CollectError::Read(ReadError::Cancelled)) => break,
                Err(e) => {
                    error!(
                        "Collection failed: {}. Sleeping {}s",
                        e,
                        self.timing.error_backoff.as_secs()
                    );
                    self.timing.error_backoff
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(wait) => {},
            }
        }

        info!("Collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::deye_catalog;
    use crate::session::RetryPolicy;
    use crate::snapshot::Value;
    use crate::test_utils::{test_endpoint, Attempt, ManualClock, ScriptedTransport};
    use crate::transport::TransportError;

    fn collector(
        transport: ScriptedTransport,
        clock: ManualClock,
        distributor: Distributor,
    ) -> Collector<ScriptedTransport> {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let reader = ChunkedReader::new(
            transport,
            test_endpoint(),
            125,
            RetryPolicy {
                max_attempts: 2,
                backoff: Duration::from_secs(5),
            },
            clock.clone(),
        );
        Collector::new(
            reader,
            DecodeEngine::default(),
            Arc::new(deye_catalog()),
            distributor,
            clock,
            CollectorTiming::default(),
        )
    }

    #[tokio::test]
    async fn test_cycle_stamps_and_publishes() {
        let clock = ManualClock::at_start();
        let mut distributor = Distributor::new();
        let rx = distributor.register("test");
        let transport = ScriptedTransport::with_registers(&[(184, 87), (59, 2)]);
        let mut collector = collector(transport, clock.clone(), distributor);

        let snapshot = collector.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(snapshot.collected_at(), clock.now());
        assert_eq!(snapshot.get("battery_soc").unwrap().value, Value::Number(87.0));
        assert_eq!(collector.state(), CollectorState::Idle);
        assert_eq!(rx.try_recv(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_failed_cycle_publishes_nothing() {
        let mut distributor = Distributor::new();
        let rx = distributor.register("test");
        let transport = ScriptedTransport::new(vec![]).otherwise(Attempt::RefuseConnect(
            TransportError::Unreachable("no route".into()),
        ));
        let mut collector = collector(transport, ManualClock::at_start(), distributor);

        let err = collector.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            CollectError::Read(ReadError::Unreachable { attempts: 2, .. })
        ));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_loop_sleeps_period_or_backoff() {
        let clock = ManualClock::at_start();
        let transport = ScriptedTransport::with_registers(&[(184, 87)])
            .then(Attempt::FailChunk {
                index: 0,
                error: TransportError::Protocol("bad frame".into()),
            })
            .then(Attempt::Succeed);
        let collector = collector(transport.clone(), clock.clone(), Distributor::new());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(collector.run(cancel.clone()));

        while clock.sleeps().len() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let sleeps = clock.sleeps();
        assert_eq!(sleeps[0], Duration::from_secs(60));
        assert_eq!(sleeps[1], Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_loop_stops_when_cancelled() {
        let transport = ScriptedTransport::new(vec![]).otherwise(Attempt::Hang);
        let collector = collector(transport, ManualClock::at_start(), Distributor::new());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(collector.run(cancel.clone()));
        tokio::task::yield_now().await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

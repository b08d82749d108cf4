//! Chunked read session
//!
//! Covers every cataloged register with as few bulk reads as the device's
//! span ceiling allows. A whole collection attempt runs on one fresh
//! transport session; a transient failure anywhere abandons the attempt and,
//! after a back-off, restarts it from register 0 on a new session.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::RegisterCatalog;
use crate::clock::Clock;
use crate::decode::RawRegisterBlock;
use crate::transport::{Endpoint, RegisterSession, Transport, TransportError};

/// One bulk read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRead {
    pub start: u16,
    pub count: u16,
}

/// Consecutive reads covering `[0, highest_register]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    reads: Vec<ChunkRead>,
}

impl ChunkPlan {
    /// `ceil((highest_register + 1) / max_span)` reads of `max_span` words
    /// each, starting at 0. The last read may run past `highest_register`.
    pub fn new(highest_register: u16, max_span: u16) -> Self {
        let span = u32::from(max_span.max(1));
        let needed = u32::from(highest_register) + 1;
        let count = needed.div_ceil(span);

        let reads = (0..count)
            .map(|i| {
                let start = i * span;
                // Never address past 0xFFFF
                let words = span.min(0x1_0000 - start);
                ChunkRead {
                    start: start as u16,
                    count: words as u16,
                }
            })
            .collect();

        Self { reads }
    }

    /// Plan covering every register the catalog touches, spans included
    pub fn for_catalog(catalog: &RegisterCatalog, max_span: u16) -> Self {
        Self::new(catalog.highest_register(), max_span)
    }

    pub fn reads(&self) -> &[ChunkRead] {
        &self.reads
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Words fetched by the whole plan
    pub fn total_words(&self) -> usize {
        self.reads.iter().map(|r| usize::from(r.count)).sum()
    }
}

/// Bounded retry with a fixed back-off between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Sleep between a failed attempt and the next one
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_secs(60),
        }
    }
}

/// Collection-cycle read failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("device unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("read cancelled")]
    Cancelled,
}

/// Reads the whole register bank through a [`Transport`]
pub struct ChunkedReader<T: Transport> {
    transport: T,
    endpoint: Endpoint,
    max_span: u16,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<T: Transport> ChunkedReader<T> {
    pub fn new(
        transport: T,
        endpoint: Endpoint,
        max_span: u16,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            max_span,
            retry,
            clock,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Read registers `[0, highest]` for the catalog
    ///
    /// Cancelling `cancel` aborts an in-flight attempt (dropping its
    /// session) or a pending back-off.
    pub async fn read(
        &self,
        catalog: &RegisterCatalog,
        cancel: &CancellationToken,
    ) -> Result<RawRegisterBlock, ReadError> {
        let plan = ChunkPlan::for_catalog(catalog, self.max_span);
        let max_attempts = self.retry.max_attempts.max(1);
        debug!(
            "Reading {} words from {} in {} chunks",
            plan.total_words(),
            self.endpoint,
            plan.len()
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ReadError::Cancelled),
                result = self.attempt(&plan) => result,
            };

            let error = match result {
                Ok(block) => {
                    if attempt > 1 {
                        info!("Read from {} succeeded on attempt {}", self.endpoint, attempt);
                    }
                    return Ok(block);
                },
                Err(TransportError::Protocol(msg)) => return Err(ReadError::Protocol(msg)),
                Err(error) => error,
            };

            if attempt >= max_attempts {
                return Err(ReadError::Unreachable {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            warn!(
                "Attempt {}/{} failed: {}. Retrying in {}s",
                attempt,
                max_attempts,
                error,
                self.retry.backoff.as_secs()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadError::Cancelled),
                _ = self.clock.sleep(self.retry.backoff) => {},
            }
        }
    }

    async fn attempt(&self, plan: &ChunkPlan) -> Result<RawRegisterBlock, TransportError> {
        let mut session = self.transport.open(&self.endpoint).await?;
        let mut block = RawRegisterBlock::default();

        for chunk in plan.reads() {
            let words = session
                .read_holding_registers(chunk.start, chunk.count)
                .await?;
            if words.len() != usize::from(chunk.count) {
                return Err(TransportError::Protocol(format!(
                    "asked for {} registers at {}, got {}",
                    chunk.count,
                    chunk.start,
                    words.len()
                )));
            }
            block.extend_from_slice(&words);
        }

        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{deye_catalog, RegisterSpec};
    use crate::test_utils::{test_endpoint, Attempt, ManualClock, ScriptedTransport};

    fn reader(transport: ScriptedTransport, clock: ManualClock) -> ChunkedReader<ScriptedTransport> {
        ChunkedReader::new(
            transport,
            test_endpoint(),
            125,
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_secs(60),
            },
            Arc::new(clock),
        )
    }

    fn refused() -> TransportError {
        TransportError::Unreachable("connection refused".into())
    }

    #[test]
    fn test_plan_for_194() {
        let plan = ChunkPlan::new(194, 125);
        assert_eq!(
            plan.reads(),
            &[
                ChunkRead { start: 0, count: 125 },
                ChunkRead { start: 125, count: 125 },
            ]
        );
    }

    #[test]
    fn test_plan_boundaries() {
        assert_eq!(ChunkPlan::new(124, 125).len(), 1);
        assert_eq!(ChunkPlan::new(125, 125).len(), 2);
        assert_eq!(ChunkPlan::new(0, 125).len(), 1);
        assert_eq!(ChunkPlan::new(315, 125).len(), 3);
    }

    #[test]
    fn test_plan_stays_in_address_space() {
        let plan = ChunkPlan::new(u16::MAX, 125);
        let last = plan.reads().last().unwrap();
        assert_eq!(u32::from(last.start) + u32::from(last.count), 0x1_0000);
    }

    #[test]
    fn test_plan_includes_span() {
        let catalog = RegisterCatalog::new([(
            "faults",
            RegisterSpec::new(123, "").span(4).decoder(crate::catalog::Decoder::Bitmask {
                table: "faults".into(),
            }),
        )])
        .unwrap();
        // Last register 126 needs a second read
        assert_eq!(ChunkPlan::for_catalog(&catalog, 125).len(), 2);
    }

    #[tokio::test]
    async fn test_read_concatenates_chunks() {
        let transport = ScriptedTransport::with_registers(&[(0, 7), (184, 87), (315, 100)]);
        let reader = reader(transport.clone(), ManualClock::at_start());

        let block = reader
            .read(&deye_catalog(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(block.len(), 375);
        assert_eq!(block.words()[0], 7);
        assert_eq!(block.words()[184], 87);
        assert_eq!(block.words()[315], 100);
        assert_eq!(transport.reads(), vec![(0, 125), (125, 125), (250, 125)]);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_exact() {
        let transport = ScriptedTransport::new(vec![]).otherwise(Attempt::RefuseConnect(refused()));
        let clock = ManualClock::at_start();
        let reader = reader(transport.clone(), clock.clone());

        let err = reader
            .read(&deye_catalog(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReadError::Unreachable { attempts: 3, .. }));
        assert_eq!(transport.opens(), 3);
        // Back-off only between attempts
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60); 2]);
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_restarts_from_zero() {
        let transport = ScriptedTransport::with_registers(&[(184, 87)]).then(Attempt::FailChunk {
            index: 1,
            error: refused(),
        });
        let clock = ManualClock::at_start();
        let reader = reader(transport.clone(), clock.clone());

        let block = reader
            .read(&deye_catalog(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(block.words()[184], 87);
        assert_eq!(transport.opens(), 2);
        assert_eq!(
            transport.reads(),
            vec![(0, 125), (0, 125), (125, 125), (250, 125)]
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![]).then(Attempt::FailChunk {
            index: 0,
            error: TransportError::Protocol("bad checksum".into()),
        });
        let clock = ManualClock::at_start();
        let reader = reader(transport.clone(), clock.clone());

        let err = reader
            .read(&deye_catalog(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ReadError::Protocol("bad checksum".into()));
        assert_eq!(transport.opens(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_inflight_read() {
        let transport = ScriptedTransport::new(vec![]).otherwise(Attempt::Hang);
        let reader = reader(transport, ManualClock::at_start());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });

        let err = reader.read(&deye_catalog(), &cancel).await.unwrap_err();
        assert_eq!(err, ReadError::Cancelled);
    }
}

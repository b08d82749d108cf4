//! Latest-wins fan-out from the collector to its consumers
//!
//! Each consumer owns one single-slot queue. Publishing replaces whatever
//! the consumer has not drained yet, so the collector never blocks and no
//! queue ever holds more than one snapshot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::snapshot::Snapshot;

/// Capacity-1 holder where a new value replaces any undelivered one
///
/// Replacement happens under the slot's lock, so a concurrent `take` sees
/// either the old value or the new one, never an empty slot in between.
#[derive(Debug)]
pub struct LatestSlot<T> {
    cell: Mutex<Option<T>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(None),
        }
    }

    /// Store `value`; returns the undelivered value it replaced, if any
    pub fn put(&self, value: T) -> Option<T> {
        self.cell.lock().replace(value)
    }

    /// Remove and return the stored value without blocking
    pub fn take(&self) -> Option<T> {
        self.cell.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.lock().is_none()
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of one queue
#[derive(Debug, Clone)]
pub struct SnapshotReceiver {
    name: String,
    slot: Arc<LatestSlot<Snapshot>>,
}

impl SnapshotReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest undelivered snapshot, if any
    pub fn try_recv(&self) -> Option<Snapshot> {
        self.slot.take()
    }
}

/// Result of [`Distributor::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored in every queue; `overwritten` queues still held an older one
    Delivered { consumers: usize, overwritten: usize },
    /// Older than a snapshot already published; dropped
    OutOfOrder,
}

/// Producer side: one slot per registered consumer
#[derive(Debug, Default)]
pub struct Distributor {
    consumers: Vec<SnapshotReceiver>,
    last_published: Option<Duration>,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer queue and hand back its receiving end
    pub fn register(&mut self, name: impl Into<String>) -> SnapshotReceiver {
        let receiver = SnapshotReceiver {
            name: name.into(),
            slot: Arc::new(LatestSlot::new()),
        };
        debug!("Registered consumer queue '{}'", receiver.name);
        self.consumers.push(receiver.clone());
        receiver
    }

    /// Push a copy of `snapshot` into every consumer queue
    ///
    /// Snapshots stamped before the last published one are dropped, so
    /// consumers only ever see non-decreasing collection times. Ordering uses
    /// the monotonic stamp; a wall-clock step does not reorder anything.
    pub fn publish(&mut self, snapshot: Snapshot) -> PublishOutcome {
        let stamp = snapshot.stamp();
        if let Some(last) = self.last_published {
            if stamp.monotonic < last {
                warn!(
                    "Dropping snapshot collected at {} ({:?} behind the last published one)",
                    stamp.wall,
                    last - stamp.monotonic
                );
                return PublishOutcome::OutOfOrder;
            }
        }

        let mut overwritten = 0;
        for consumer in &self.consumers {
            if consumer.slot.put(snapshot.clone()).is_some() {
                overwritten += 1;
                debug!(
                    "Consumer '{}' had not drained its queue, replaced with newer snapshot",
                    consumer.name
                );
            }
        }
        self.last_published = Some(stamp.monotonic);

        PublishOutcome::Delivered {
            consumers: self.consumers.len(),
            overwritten,
        }
    }
}

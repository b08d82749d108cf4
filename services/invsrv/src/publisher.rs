//! Message-bus publisher
//!
//! Push-based consumer with its own pacing: take the newest snapshot (or
//! sleep when there is none), publish its name → value mapping and wait for
//! the broker's acknowledgement, then sleep the send interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::distributor::SnapshotReceiver;
use crate::snapshot::Snapshot;

pub const DEFAULT_TOPIC: &str = "homeassistant/sensor/inverter/state";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),
}

/// Destination for serialized snapshots
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Deliver `payload` to `topic`; returns once the bus acknowledged it
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub ack_timeout: Duration,
}

/// MQTT sink: one connection per publish, QoS 1, clean disconnect
#[derive(Debug, Clone)]
pub struct MqttSink {
    settings: MqttSettings,
}

impl MqttSink {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self) -> MqttOptions {
        let s = &self.settings;
        let mut options = MqttOptions::new(s.client_id.as_str(), s.host.as_str(), s.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some(username) = &s.username {
            options.set_credentials(username.as_str(), s.password.clone().unwrap_or_default());
        }
        options
    }
}

#[async_trait]
impl MessageSink for MqttSink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let acked = async {
            let mut pkid = None;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Publish(id))) => pkid = Some(id),
                    Ok(Event::Incoming(Packet::PubAck(ack))) if Some(ack.pkid) == pkid => {
                        return Ok(());
                    },
                    Ok(event) => debug!("MQTT event: {:?}", event),
                    Err(e) => return Err(PublishError::Connection(e.to_string())),
                }
            }
        };

        let timeout = self.settings.ack_timeout;
        tokio::time::timeout(timeout, acked)
            .await
            .map_err(|_| PublishError::AckTimeout(timeout))??;

        // Flush the DISCONNECT packet before dropping the event loop
        if client.disconnect().await.is_ok() {
            let closed = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {},
                    }
                }
            };
            if tokio::time::timeout(timeout, closed).await.is_err() {
                debug!("MQTT disconnect not confirmed within {:?}", timeout);
            }
        }

        Ok(())
    }
}

/// Pacing of the publish loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherTiming {
    /// Sleep when no snapshot is waiting
    pub empty_sleep: Duration,
    /// Sleep after each publish attempt
    pub send_interval: Duration,
}

impl Default for PublisherTiming {
    fn default() -> Self {
        Self {
            empty_sleep: Duration::from_secs(10),
            send_interval: Duration::from_secs(30),
        }
    }
}

pub struct MessagePublisher<S: MessageSink> {
    sink: S,
    receiver: SnapshotReceiver,
    topic: String,
    timing: PublisherTiming,
    clock: Arc<dyn Clock>,
}

impl<S: MessageSink> MessagePublisher<S> {
    pub fn new(
        sink: S,
        receiver: SnapshotReceiver,
        topic: impl Into<String>,
        timing: PublisherTiming,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            receiver,
            topic: topic.into(),
            timing,
            clock,
        }
    }

    /// Serialize the name → value mapping (collection time stripped) and
    /// hand it to the sink
    pub async fn publish_snapshot(&self, snapshot: &Snapshot) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&snapshot.to_payload())
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.sink.publish(&self.topic, payload).await
    }

    /// Drain the queue once; returns how long to sleep before the next turn
    pub async fn step(&self) -> Duration {
        let Some(snapshot) = self.receiver.try_recv() else {
            debug!("No snapshot queued, sleeping {}s", self.timing.empty_sleep.as_secs());
            return self.timing.empty_sleep;
        };

        match self.publish_snapshot(&snapshot).await {
            Ok(()) => info!(
                "Published {} values to {} (collected {})",
                snapshot.len(),
                self.topic,
                snapshot.collected_at()
            ),
            Err(e) => error!("Publish to {} failed: {}", self.topic, e),
        }
        self.timing.send_interval
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!("Publisher started on topic {}", self.topic);
        while !cancel.is_cancelled() {
            let wait = tokio::select! {
                _ = cancel.cancelled() => break,
                wait = self.step() => wait,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(wait) => {},
            }
        }
        info!("Publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::Distributor;
    use crate::snapshot::{MetricValue, Value};
    use crate::test_utils::{stamp_at, ManualClock};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Connection("broker down".into()));
            }
            let payload = String::from_utf8(payload).unwrap();
            self.sent.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn snapshot(secs: u64, soc: f64) -> Snapshot {
        let mut values = BTreeMap::new();
        for (name, unit, value) in [
            ("battery_soc", "%", Value::Number(soc)),
            ("overall_state", "", Value::Text("ok".into())),
        ] {
            values.insert(
                name.to_string(),
                MetricValue {
                    name: name.to_string(),
                    unit: unit.to_string(),
                    value,
                },
            );
        }
        Snapshot::new(values, stamp_at(secs))
    }

    fn publisher(
        sink: RecordingSink,
        distributor: &mut Distributor,
    ) -> MessagePublisher<RecordingSink> {
        MessagePublisher::new(
            sink,
            distributor.register("publisher"),
            DEFAULT_TOPIC,
            PublisherTiming::default(),
            Arc::new(ManualClock::at_start()),
        )
    }

    #[tokio::test]
    async fn test_publishes_latest_without_timestamp() {
        let sink = RecordingSink::default();
        let mut distributor = Distributor::new();
        let publisher = publisher(sink.clone(), &mut distributor);

        distributor.publish(snapshot(100, 50.0));
        distributor.publish(snapshot(120, 51.5));

        assert_eq!(publisher.step().await, Duration::from_secs(30));
        let sent = sink.sent.lock().clone();
        assert_eq!(
            sent,
            vec![(
                DEFAULT_TOPIC.to_string(),
                r#"{"battery_soc":51.5,"overall_state":"ok"}"#.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_empty_queue_sleeps() {
        let sink = RecordingSink::default();
        let mut distributor = Distributor::new();
        let publisher = publisher(sink.clone(), &mut distributor);

        assert_eq!(publisher.step().await, Duration::from_secs(10));
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_pacing() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut distributor = Distributor::new();
        let publisher = publisher(sink, &mut distributor);

        distributor.publish(snapshot(100, 50.0));
        assert_eq!(publisher.step().await, Duration::from_secs(30));
        // The failed snapshot is not re-queued
        assert_eq!(publisher.step().await, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let sink = RecordingSink::default();
        let mut distributor = Distributor::new();
        let publisher = publisher(sink.clone(), &mut distributor);
        distributor.publish(snapshot(100, 50.0));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(publisher.run(cancel.clone()));
        while sink.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_mqtt_sink_reports_unreachable_broker() {
        // Nothing listens on this port
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink = MqttSink::new(MqttSettings {
            host: "127.0.0.1".into(),
            port,
            username: None,
            password: None,
            client_id: "invsrv-test".into(),
            ack_timeout: Duration::from_secs(5),
        });
        let err = sink.publish(DEFAULT_TOPIC, b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, PublishError::Connection(_)));
    }
}

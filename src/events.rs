//! Lifecycle events
//!
//! Every event of a batch carries the batch's correlation id so consumers can group
//! them. Publishing is fire-and-forget: [`EventPublisher::publish`] never blocks the
//! caller and never fails it. Delivery is at most once; failures are logged.

use crate::config::EventsConfig;
use crate::error::EventError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Type tag of a batch-started event
pub const BATCH_STARTED: &str = "batch-started";
/// Type tag of a batch-ended event
pub const BATCH_ENDED: &str = "batch-ended";
/// Type tag of an extract-started event
pub const EXTRACT_STARTED: &str = "extract-started";
/// Type tag of an extract-ended event
pub const EXTRACT_ENDED: &str = "extract-ended";
/// Type tag of an extract-upload-started event
pub const EXTRACT_UPLOAD_STARTED: &str = "extract-upload-started";
/// Type tag of an extract-upload-ended event
pub const EXTRACT_UPLOAD_ENDED: &str = "extract-upload-ended";

/// Type-specific event data
///
/// Serialized without a tag (the envelope carries the type); variants are declared
/// from most to least specific so untagged decoding picks the right one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Upload of a finished extract ended
    ExtractUploadEnded {
        /// Job name
        query: String,
        /// Destination bucket
        bucket: String,
        /// Destination key
        key: String,
        /// Time spent uploading
        #[serde(with = "duration_millis", rename = "duration_ms")]
        duration: Duration,
        /// Failure, if any
        error: Option<EventError>,
    },

    /// Upload of a finished extract started
    ExtractUploadStarted {
        /// Job name
        query: String,
        /// Destination bucket
        bucket: String,
        /// Destination key
        key: String,
    },

    /// A job's fetch-and-write ended
    ExtractEnded {
        /// Job name
        query: String,
        /// Bytes copied from the agent
        bytes: u64,
        /// Time spent fetching and writing
        #[serde(with = "duration_millis", rename = "duration_ms")]
        duration: Duration,
        /// Failure, if any
        error: Option<EventError>,
    },

    /// A job's fetch-and-write started
    ExtractStarted {
        /// Job name
        query: String,
    },

    /// A batch ended after every job finished
    BatchEnded {
        /// Wall time of the whole batch
        #[serde(with = "duration_millis", rename = "duration_ms")]
        duration: Duration,
    },

    /// A batch started
    BatchStarted {},
}

impl EventPayload {
    /// Type tag for this payload
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::BatchStarted {} => BATCH_STARTED,
            EventPayload::BatchEnded { .. } => BATCH_ENDED,
            EventPayload::ExtractStarted { .. } => EXTRACT_STARTED,
            EventPayload::ExtractEnded { .. } => EXTRACT_ENDED,
            EventPayload::ExtractUploadStarted { .. } => EXTRACT_UPLOAD_STARTED,
            EventPayload::ExtractUploadEnded { .. } => EXTRACT_UPLOAD_ENDED,
        }
    }
}

/// Envelope every published event is wrapped in
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id
    pub id: String,
    /// Type tag (see [`EventPayload::event_type`])
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp in seconds
    pub time: i64,
    /// Type-specific data
    pub data: EventPayload,
    /// Batch the event belongs to
    pub correlation_id: String,
}

impl Event {
    /// Wrap a payload in a fresh envelope
    pub fn new(correlation_id: &str, data: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            event_type: data.event_type().to_string(),
            time: chrono::Utc::now().timestamp(),
            data,
            correlation_id: correlation_id.to_string(),
        }
    }
}

/// Capability to publish lifecycle events
///
/// Implementations must be safe to call concurrently from every worker, must not block,
/// and must swallow (and log) their own failures. Callers must not assume delivery.
pub trait EventPublisher: Send + Sync {
    /// Publish `payload` on `topic` as part of the batch `correlation_id`
    fn publish(&self, topic: &str, correlation_id: &str, payload: EventPayload);
}

/// Log a publish that could not be delivered
fn log_publish_failed(topic: &str, event: &Event, error: &str) {
    let data = serde_json::to_string(event).unwrap_or_default();
    tracing::warn!(topic = %topic, error = %error, data = %data, "event publish failed");
}

/// Publishes events by logging them
///
/// Used when no other delivery is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, topic: &str, correlation_id: &str, payload: EventPayload) {
        let event = Event::new(correlation_id, payload);
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(topic = %topic, event = %json, "event"),
            Err(e) => log_publish_failed(topic, &event, &e.to_string()),
        }
    }
}

/// Publishes events to in-process subscribers over a broadcast channel
///
/// Subscribers that fall behind lose events; publishing with no subscribers is not an error.
#[derive(Clone, Debug)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<(String, Event)>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to `(topic, event)` pairs published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<(String, Event)> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, topic: &str, correlation_id: &str, payload: EventPayload) {
        let event = Event::new(correlation_id, payload);
        if self.tx.send((topic.to_string(), event)).is_err() {
            tracing::trace!(topic = %topic, "no event subscribers");
        }
    }
}

/// Publishes events as JSON POSTs to a webhook
///
/// Events are handed to a single background task so they are delivered in publish
/// order. The topic is sent in the `X-Event-Topic` header. Call [`flush`] before the
/// runtime shuts down or queued events are lost.
///
/// [`flush`]: WebhookPublisher::flush
#[derive(Clone, Debug)]
pub struct WebhookPublisher {
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
enum Delivery {
    Event(String, Event),
    Flush(oneshot::Sender<()>),
}

impl WebhookPublisher {
    /// Start the delivery task; must be called within a tokio runtime
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver_webhooks(url.into(), timeout, rx));
        Self { tx }
    }

    /// Build from configuration, if a webhook is configured
    pub fn from_config(config: &EventsConfig) -> Option<Self> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.webhook_timeout))
    }

    /// Wait until every event published before this call has been delivered or failed
    ///
    /// Returns `false` if the delivery task stopped or `timeout` elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Delivery::Flush(done_tx)).is_err() {
            tracing::warn!("webhook delivery task stopped before flush");
            return false;
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::warn!("webhook delivery task stopped before flush");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out flushing webhook events"
                );
                false
            }
        }
    }
}

impl EventPublisher for WebhookPublisher {
    fn publish(&self, topic: &str, correlation_id: &str, payload: EventPayload) {
        let event = Event::new(correlation_id, payload);
        if let Err(mpsc::error::SendError(Delivery::Event(topic, event))) =
            self.tx.send(Delivery::Event(topic.to_string(), event))
        {
            log_publish_failed(&topic, &event, "webhook delivery task stopped");
        }
    }
}

async fn deliver_webhooks(
    url: String,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    let client = reqwest::Client::new();

    while let Some(delivery) = rx.recv().await {
        let (topic, event) = match delivery {
            Delivery::Event(topic, event) => (topic, event),
            Delivery::Flush(done) => {
                // The caller may have given up waiting
                let _ = done.send(());
                continue;
            }
        };

        let request = client
            .post(&url)
            .header("X-Event-Topic", &topic)
            .json(&event)
            .timeout(timeout);

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %url, event_type = %event.event_type, "event delivered");
            }
            Ok(response) => {
                let error = format!(
                    "webhook returned status {}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                );
                log_publish_failed(&topic, &event, &error);
            }
            Err(e) => log_publish_failed(&topic, &event, &e.to_string()),
        }
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn payload_type_tags() {
        assert_eq!(EventPayload::BatchStarted {}.event_type(), "batch-started");
        assert_eq!(
            EventPayload::ExtractUploadEnded {
                query: "q".into(),
                bucket: "b".into(),
                key: "k".into(),
                duration: Duration::ZERO,
                error: None,
            }
            .event_type(),
            "extract-upload-ended"
        );
    }

    #[test]
    fn envelope_serialization() {
        let event = Event::new(
            "corr-1",
            EventPayload::ExtractEnded {
                query: "users".into(),
                bytes: 1024,
                duration: Duration::from_millis(1500),
                error: Some(EventError {
                    kind: ErrorKind::Remote,
                    message: "HTTP status 500: boom".into(),
                }),
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "extract-ended");
        assert_eq!(json["correlation_id"], "corr-1");
        assert_eq!(json["data"]["query"], "users");
        assert_eq!(json["data"]["bytes"], 1024);
        assert_eq!(json["data"]["duration_ms"], 1500);
        assert_eq!(json["data"]["error"]["kind"], "remote");
        assert!(!event.id.is_empty());
    }

    #[test]
    fn event_ids_are_unique() {
        let a = Event::new("c", EventPayload::BatchStarted {});
        let b = Event::new("c", EventPayload::BatchStarted {});
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn broadcast_publisher_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::default();
        let mut rx = publisher.subscribe();

        publisher.publish(
            "extracts",
            "corr-2",
            EventPayload::ExtractStarted {
                query: "orders".into(),
            },
        );

        let (topic, event) = rx.recv().await.unwrap();
        assert_eq!(topic, "extracts");
        assert_eq!(event.correlation_id, "corr-2");
        assert_eq!(event.event_type, EXTRACT_STARTED);
    }

    #[test]
    fn broadcast_publisher_without_subscribers_does_not_fail() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish("t", "c", EventPayload::BatchStarted {});
    }

    #[tokio::test]
    async fn webhook_publisher_posts_events_in_order() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header("X-Event-Topic", "extracts"))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&mock_server)
            .await;

        let publisher = WebhookPublisher::new(
            format!("{}/events", mock_server.uri()),
            Duration::from_secs(5),
        );
        publisher.publish("extracts", "corr-3", EventPayload::BatchStarted {});
        publisher.publish(
            "extracts",
            "corr-3",
            EventPayload::BatchEnded {
                duration: Duration::from_millis(10),
            },
        );

        assert!(publisher.flush(Duration::from_secs(5)).await);
        let received = mock_server.received_requests().await.unwrap();

        assert_eq!(received.len(), 2);
        let first: Event = serde_json::from_slice(&received[0].body).unwrap();
        let second: Event = serde_json::from_slice(&received[1].body).unwrap();
        assert_eq!(first.event_type, BATCH_STARTED);
        assert_eq!(second.event_type, BATCH_ENDED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flushed_webhook_events_survive_runtime_shutdown() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
            .mount(&mock_server)
            .await;

        let uri = mock_server.uri();
        tokio::task::spawn_blocking(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let publisher = WebhookPublisher::new(uri, Duration::from_secs(5));
                publisher.publish(
                    "t",
                    "c",
                    EventPayload::ExtractStarted {
                        query: "users".into(),
                    },
                );
                publisher.publish(
                    "t",
                    "c",
                    EventPayload::BatchEnded {
                        duration: Duration::from_secs(1),
                    },
                );
                assert!(publisher.flush(Duration::from_secs(5)).await);
            });
            // Dropping the runtime kills the delivery task
        })
        .await
        .unwrap();

        let received = mock_server.received_requests().await.unwrap();
        let types: Vec<String> = received
            .iter()
            .map(|r| serde_json::from_slice::<Event>(&r.body).unwrap().event_type)
            .collect();
        assert_eq!(types, [EXTRACT_STARTED, BATCH_ENDED]);
    }

    #[tokio::test]
    async fn flush_times_out_on_slow_webhook() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let publisher = WebhookPublisher::new(mock_server.uri(), Duration::from_secs(10));
        publisher.publish("t", "c", EventPayload::BatchStarted {});
        assert!(!publisher.flush(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn webhook_failures_are_swallowed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&mock_server)
            .await;

        let publisher = WebhookPublisher::new(mock_server.uri(), Duration::from_secs(5));
        publisher.publish("t", "c", EventPayload::BatchStarted {});
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

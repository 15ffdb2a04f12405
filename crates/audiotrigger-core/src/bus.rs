//! Message bus seam
//!
//! The engine never talks to a broker directly. It hands [`BusMessage`]s to
//! a [`Publisher`], which queues them (bounded, non-blocking) for a
//! dedicated `bus-publisher` thread that calls the [`MessageBus`]
//! implementation. A slow or unavailable bus therefore costs dropped
//! messages, counted in [`EngineCounters`], never delayed audio.
//!
//! Topics, all under the configured base:
//! - `event` - one notification per persisted event
//! - `spectrum` - periodic third-octave spectrum
//! - `status` - periodic engine snapshot
//! - `level/fast`, `level/slow` - per-block live levels
//! - `availability` - `online` / `offline` (retained)

use crate::error::PublishError;
use crate::status::EngineCounters;
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::broadcast;

/// One message for the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
    /// Broker should keep this as the topic's last value
    #[serde(default)]
    pub retain: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Publish side of a message bus client
pub trait MessageBus: Send + Sync {
    fn publish(&self, message: &BusMessage) -> Result<(), PublishError>;
}

/// Topic names under a common base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.base, leaf)
    }

    pub fn event(&self) -> String {
        self.topic("event")
    }

    pub fn spectrum(&self) -> String {
        self.topic("spectrum")
    }

    pub fn status(&self) -> String {
        self.topic("status")
    }

    pub fn level_fast(&self) -> String {
        self.topic("level/fast")
    }

    pub fn level_slow(&self) -> String {
        self.topic("level/slow")
    }

    pub fn availability(&self) -> String {
        self.topic("availability")
    }
}

/// In-process bus fanning messages out to any number of subscribers
///
/// Retained messages are kept per topic so late subscribers can catch up.
/// Used by the status server to mirror the bus over WebSocket.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
    retained: Arc<Mutex<BTreeMap<String, BusMessage>>>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            retained: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Last retained message per topic
    pub fn retained(&self) -> Vec<BusMessage> {
        self.retained
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MessageBus for BroadcastBus {
    fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        if message.retain {
            let mut retained = self
                .retained
                .lock()
                .map_err(|_| PublishError::Unavailable("retained store poisoned".into()))?;
            retained.insert(message.topic.clone(), message.clone());
        }
        // No subscribers is not an error: messages are simply not observed
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

/// Bus that only logs, for running without any subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBus;

impl MessageBus for LogBus {
    fn publish(&self, message: &BusMessage) -> Result<(), PublishError> {
        tracing::debug!(topic = %message.topic, payload = %message.payload, "Publish");
        Ok(())
    }
}

/// Non-blocking handle used by the engine and the event writer
#[derive(Clone)]
pub struct Publisher {
    tx: Sender<BusMessage>,
    counters: Arc<EngineCounters>,
}

impl Publisher {
    /// Queue a message; a full queue drops it
    pub fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
                Err(PublishError::QueueFull {
                    topic: message.topic,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(PublishError::Stopped),
        }
    }

    pub fn publish_text(&self, topic: String, payload: String, retain: bool) -> Result<(), PublishError> {
        self.publish(BusMessage {
            topic,
            payload,
            retain,
        })
    }

    /// Serialize `value` as JSON and queue it
    pub fn publish_json<T: Serialize>(&self, topic: String, value: &T) -> Result<(), PublishError> {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(source) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                return Err(PublishError::Encode { topic, source });
            }
        };
        self.publish_text(topic, payload, false)
    }
}

/// Owns the `bus-publisher` thread
pub struct PublisherHandle {
    thread: Option<JoinHandle<()>>,
}

impl PublisherHandle {
    /// Wait for the thread to drain the queue and exit
    ///
    /// The thread exits once every [`Publisher`] clone has been dropped.
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

/// Start the publisher thread in front of `bus`
///
/// # Arguments
/// * `bus` - Bus implementation receiving the messages
/// * `capacity` - Maximum queued messages before new ones are dropped
/// * `counters` - Shared counters for dropped and failed messages
pub fn spawn_publisher(
    bus: Arc<dyn MessageBus>,
    capacity: usize,
    counters: Arc<EngineCounters>,
) -> std::io::Result<(Publisher, PublisherHandle)> {
    let (tx, rx) = crossbeam_channel::bounded::<BusMessage>(capacity.max(1));
    let thread_counters = Arc::clone(&counters);
    let thread = std::thread::Builder::new()
        .name("bus-publisher".into())
        .spawn(move || {
            let mut failures = 0u64;
            for message in rx.iter() {
                if let Err(e) = bus.publish(&message) {
                    thread_counters
                        .publish_failures
                        .fetch_add(1, Ordering::Relaxed);
                    failures += 1;
                    // Log the first failure and then every 100th
                    if failures % 100 == 1 {
                        tracing::warn!(topic = %message.topic, error = %e, failures, "Publish failed");
                    }
                }
            }
            tracing::debug!("Bus publisher thread exited");
        })?;

    Ok((
        Publisher { tx, counters },
        PublisherHandle {
            thread: Some(thread),
        },
    ))
}

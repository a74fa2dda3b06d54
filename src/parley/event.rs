//! Negotiation event system.
//!
//! Every observable milestone of a session is published as an [`Event`]
//! with a uniform envelope: `{event_type, negotiation_id, timestamp, data}`.
//! Subscribers register for a negotiation id via [`EventBus::subscribe`]
//! and receive all subsequent events for that session in publish order;
//! joining mid-session delivers from that point forward.
//!
//! # Delivery policy
//!
//! Delivery is best-effort with back-pressure bounded by a timeout: each
//! subscriber owns a bounded channel, and a publish waits at most
//! [`EventBus::publish_timeout`] per subscriber. A subscriber that stays
//! full past the timeout (or whose receiver was dropped) is evicted, and
//! the eviction is reported back to the publisher so the engine can record
//! it in the session's trace chain. A slow subscriber therefore never
//! blocks publication indefinitely, and the engine never loses track of a
//! drop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

/// The closed set of event types a session can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// The demand was formulated. Data: the formulated demand struct.
    #[serde(rename = "formulation.ready")]
    FormulationReady,
    /// Participants were selected. Data: ordered
    /// `{agent_id, display_name, score}` list.
    #[serde(rename = "resonance.activated")]
    ResonanceActivated,
    /// One offer settled. Data: `{agent_id, text, confidence, declined}`.
    #[serde(rename = "offer.received")]
    OfferReceived,
    /// All offer tasks settled. Data: `{offered, timed_out, exited}`.
    #[serde(rename = "barrier.complete")]
    BarrierComplete,
    /// The coordinator invoked a tool. Data:
    /// `{round, tool_name, arguments, result_summary}`.
    #[serde(rename = "center.tool_call")]
    CenterToolCall,
    /// The final plan is available. Data: the plan struct.
    #[serde(rename = "plan.ready")]
    PlanReady,
    /// Terminal: the session completed successfully.
    #[serde(rename = "negotiation.completed")]
    NegotiationCompleted,
    /// Terminal: the session failed. Data carries the error detail.
    #[serde(rename = "negotiation.error")]
    NegotiationError,
    /// Terminal: the session was cancelled externally.
    #[serde(rename = "negotiation.cancelled")]
    NegotiationCancelled,
}

impl EventType {
    /// The wire name of this event type (e.g. `"plan.ready"`).
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::FormulationReady => "formulation.ready",
            EventType::ResonanceActivated => "resonance.activated",
            EventType::OfferReceived => "offer.received",
            EventType::BarrierComplete => "barrier.complete",
            EventType::CenterToolCall => "center.tool_call",
            EventType::PlanReady => "plan.ready",
            EventType::NegotiationCompleted => "negotiation.completed",
            EventType::NegotiationError => "negotiation.error",
            EventType::NegotiationCancelled => "negotiation.cancelled",
        }
    }

    /// Whether this type terminates its session's event stream.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::NegotiationCompleted
                | EventType::NegotiationError
                | EventType::NegotiationCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named milestone delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Which milestone this is.
    pub event_type: EventType,
    /// The session the milestone belongs to.
    pub negotiation_id: String,
    /// Publish time, serialised as ISO-8601 UTC.
    pub timestamp: DateTime<Utc>,
    /// Per-type payload (see [`EventType`] docs).
    pub data: serde_json::Value,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn now(
        event_type: EventType,
        negotiation_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            negotiation_id: negotiation_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// What happened during one publish.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Subscribers the event was delivered to.
    pub delivered: usize,
    /// Subscriber ids evicted during this publish (buffer stayed full past
    /// the timeout, or the receiver was dropped).
    pub evicted: Vec<u64>,
}

/// Pushes typed events to subscribers keyed by negotiation id.
///
/// The bus is shared as `Arc<EventBus>` between the engine (publisher) and
/// any number of observers. See the module docs for the delivery policy.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: Mutex<u64>,
    capacity: usize,
    publish_timeout: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64, Duration::from_millis(250))
    }
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity and
    /// per-subscriber publish timeout.
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            capacity: capacity.max(1),
            publish_timeout,
        }
    }

    /// The per-subscriber wait bound applied by [`publish`](EventBus::publish).
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Register for all subsequent events of one negotiation.
    pub async fn subscribe(&self, negotiation_id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = {
            let mut next = self.next_id.lock().await;
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .await
            .entry(negotiation_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        rx
    }

    /// Like [`subscribe`](EventBus::subscribe), wrapped as a `Stream`.
    pub async fn subscribe_stream(&self, negotiation_id: &str) -> impl Stream<Item = Event> {
        ReceiverStream::new(self.subscribe(negotiation_id).await)
    }

    /// Deliver `event` to every subscriber of its negotiation, in
    /// registration order, evicting subscribers per the delivery policy.
    pub async fn publish(&self, event: Event) -> PublishReport {
        let mut report = PublishReport::default();
        let mut subscribers = self.subscribers.lock().await;
        let Some(entry) = subscribers.get_mut(&event.negotiation_id) else {
            return report;
        };

        let mut kept = Vec::with_capacity(entry.len());
        for subscriber in entry.drain(..) {
            let send = subscriber.tx.send(event.clone());
            match tokio::time::timeout(self.publish_timeout, send).await {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    kept.push(subscriber);
                }
                Ok(Err(_)) | Err(_) => {
                    log::warn!(
                        "evicting event subscriber {} of negotiation {}",
                        subscriber.id,
                        event.negotiation_id
                    );
                    report.evicted.push(subscriber.id);
                }
            }
        }
        *entry = kept;
        report
    }

    /// Close the stream for one negotiation: all subscriber channels are
    /// dropped, so receivers observe end-of-stream. Called by the engine
    /// after the terminal event.
    pub async fn complete(&self, negotiation_id: &str) {
        self.subscribers.lock().await.remove(negotiation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip_through_serde() {
        for event_type in [
            EventType::FormulationReady,
            EventType::ResonanceActivated,
            EventType::OfferReceived,
            EventType::BarrierComplete,
            EventType::CenterToolCall,
            EventType::PlanReady,
            EventType::NegotiationCompleted,
            EventType::NegotiationError,
            EventType::NegotiationCancelled,
        ] {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
            let back: EventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event_type);
        }
    }

    #[test]
    fn terminal_types() {
        assert!(EventType::NegotiationCompleted.is_terminal());
        assert!(EventType::NegotiationError.is_terminal());
        assert!(EventType::NegotiationCancelled.is_terminal());
        assert!(!EventType::PlanReady.is_terminal());
    }
}

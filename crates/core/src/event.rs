//! Inbound events, sense events, and the domain event bus.
//!
//! [`InboundEvent`] is a conversational record read from a cursor-addressable
//! source (a message database). [`SenseEvent`] is a self-contained JSON
//! document dropped into a sense directory. Both are consumed by watchers and
//! discarded once dispatched.
//!
//! [`DomainEvent`]s are published on the [`EventBus`] when something
//! interesting happens in the pipeline, so observers can react without
//! coupling to the components that produced them.

use crate::tier::FallbackTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A conversational record from a watched source.
///
/// `cursor_id` is strictly increasing per source. Delivery is at-least-once:
/// a crash between dispatch and cursor persistence redelivers the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub cursor_id: u64,
    pub thread_id: String,
    pub sender_id: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

/// What an inbound event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Text {
        text: String,
    },
    Attachment {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Reaction {
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl Payload {
    /// Create a text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// A short human-readable rendering, used for prompts and log previews.
    pub fn describe(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Attachment {
                filename,
                mime_type,
                caption,
            } => {
                let name = filename.as_deref().unwrap_or("unnamed");
                let kind = mime_type.as_deref().unwrap_or("unknown type");
                match caption {
                    Some(c) if !c.is_empty() => format!("[attachment: {name} ({kind})] {c}"),
                    _ => format!("[attachment: {name} ({kind})]"),
                }
            }
            Self::Reaction { kind, target } => match target {
                Some(t) => format!("[reaction: {kind} to \"{t}\"]"),
                None => format!("[reaction: {kind}]"),
            },
        }
    }
}

/// Delivery priority of a sense event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensePriority {
    Immediate,
    #[default]
    Normal,
    Background,
}

/// A self-contained record of one external occurrence.
///
/// Wire format: `{sense, timestamp, priority, data, context?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseEvent {
    pub sense: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: SensePriority,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SenseEvent {
    /// The conversation this event belongs to, if the producer named one.
    ///
    /// Looks at `context.thread_id`, then `data.thread_id`, then `data.chat_id`.
    pub fn thread_hint(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.get("thread_id"))
            .or_else(|| self.data.get("thread_id"))
            .or_else(|| self.data.get("chat_id"))
            .and_then(|v| v.as_str())
    }
}

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A watcher handed a record to its handler
    EventDispatched {
        source: String,
        cursor_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A sanitized response was handed to the responder
    ResponseDelivered {
        thread_id: String,
        tier: FallbackTier,
        chars: usize,
        timestamp: DateTime<Utc>,
    },

    /// A request was deferred to the queue tier
    RequestQueued {
        thread_id: String,
        queue_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A session was replaced and a handoff snapshot written
    HandoffCreated {
        thread_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A tier failed during a fallback walk
    TierFailed {
        tier: FallbackTier,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A watcher raised an operator-visible alert
    WatcherAlert {
        source: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sense_event_decodes_wire_format() {
        let json = r#"{
            "sense": "calendar",
            "timestamp": "2026-03-01T09:30:00Z",
            "priority": "immediate",
            "data": {"title": "standup", "chat_id": "chat42"}
        }"#;
        let event: SenseEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.sense, "calendar");
        assert_eq!(event.priority, SensePriority::Immediate);
        assert_eq!(event.thread_hint(), Some("chat42"));
        assert!(event.context.is_none());
    }

    #[test]
    fn sense_event_priority_defaults_to_normal() {
        let json = r#"{"sense": "battery", "timestamp": "2026-03-01T09:30:00Z"}"#;
        let event: SenseEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.priority, SensePriority::Normal);
        assert!(event.data.is_empty());
        assert_eq!(event.thread_hint(), None);
    }

    #[test]
    fn context_thread_id_wins_over_data() {
        let json = r#"{
            "sense": "mail",
            "timestamp": "2026-03-01T09:30:00Z",
            "data": {"thread_id": "from-data"},
            "context": {"thread_id": "from-context"}
        }"#;
        let event: SenseEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.thread_hint(), Some("from-context"));
    }

    #[test]
    fn payload_describe_variants() {
        assert_eq!(Payload::text("hi").describe(), "hi");
        let attachment = Payload::Attachment {
            filename: Some("photo.heic".into()),
            mime_type: Some("image/heic".into()),
            caption: None,
        };
        assert_eq!(attachment.describe(), "[attachment: photo.heic (image/heic)]");
        let reaction = Payload::Reaction {
            kind: "loved".into(),
            target: Some("see you soon".into()),
        };
        assert!(reaction.describe().contains("loved"));
    }

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::EventDispatched {
            source: "messages".into(),
            cursor_id: 101,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::EventDispatched { source, cursor_id, .. } => {
                assert_eq!(source, "messages");
                assert_eq!(*cursor_id, 101);
            }
            _ => panic!("Expected EventDispatched event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::WatcherAlert {
            source: "sense".into(),
            consecutive_failures: 5,
            timestamp: Utc::now(),
        });
    }
}

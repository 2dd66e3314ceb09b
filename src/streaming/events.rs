//! Typed publish/subscribe for connection events

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::protocol::{AiResponse, AudioProcessed, RealTimeFeedback, SessionUpdate, Transcription};

/// Everything the ConnectionManager reports to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Transport opened, handshake not yet done
    Connected,
    Disconnected {
        clean: bool,
        reason: Option<String>,
    },
    Authenticated {
        user_id: String,
    },
    Error {
        message: String,
    },
    HeartbeatAck {
        at: DateTime<Utc>,
    },
    SessionUpdated(SessionUpdate),
    AudioProcessed(AudioProcessed),
    Transcription(Transcription),
    AiResponse(AiResponse),
    RealTimeFeedback(RealTimeFeedback),
    /// Inbound message of a type we don't model
    Message(Value),
    ParseError {
        raw: String,
        error: String,
    },
    /// Terminal: reconnection gave up
    ReconnectionFailed {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Authenticated,
    Error,
    HeartbeatAck,
    SessionUpdated,
    AudioProcessed,
    Transcription,
    AiResponse,
    RealTimeFeedback,
    Message,
    ParseError,
    ReconnectionFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Authenticated => "authenticated",
            EventKind::Error => "error",
            EventKind::HeartbeatAck => "heartbeatAck",
            EventKind::SessionUpdated => "sessionUpdated",
            EventKind::AudioProcessed => "audioProcessed",
            EventKind::Transcription => "transcription",
            EventKind::AiResponse => "aiResponse",
            EventKind::RealTimeFeedback => "realTimeFeedback",
            EventKind::Message => "message",
            EventKind::ParseError => "parseError",
            EventKind::ReconnectionFailed => "reconnectionFailed",
        }
    }
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected => EventKind::Connected,
            ConnectionEvent::Disconnected { .. } => EventKind::Disconnected,
            ConnectionEvent::Authenticated { .. } => EventKind::Authenticated,
            ConnectionEvent::Error { .. } => EventKind::Error,
            ConnectionEvent::HeartbeatAck { .. } => EventKind::HeartbeatAck,
            ConnectionEvent::SessionUpdated(_) => EventKind::SessionUpdated,
            ConnectionEvent::AudioProcessed(_) => EventKind::AudioProcessed,
            ConnectionEvent::Transcription(_) => EventKind::Transcription,
            ConnectionEvent::AiResponse(_) => EventKind::AiResponse,
            ConnectionEvent::RealTimeFeedback(_) => EventKind::RealTimeFeedback,
            ConnectionEvent::Message(_) => EventKind::Message,
            ConnectionEvent::ParseError { .. } => EventKind::ParseError,
            ConnectionEvent::ReconnectionFailed { .. } => EventKind::ReconnectionFailed,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

/// Subscriber registry
///
/// Handlers run on the emitting task, outside the registry lock, so a handler
/// may subscribe or unsubscribe without deadlocking.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push(Subscriber { id, kind, handler });
        id
    }

    /// Returns whether the subscription existed
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to its subscribers in registration order
    pub fn emit(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.handler.clone())
            .collect();

        if handlers.is_empty() {
            log::trace!("EventBus: no subscribers for {}", kind.as_str());
            return;
        }

        for handler in handlers {
            handler(event);
        }
    }
}

//! Live duplex stream to the scoring backend
//!
//! The [`ConnectionManager`] owns one authenticated stream per test attempt.
//! Audio chunks go out, transcription and feedback events come back.
//!
//! # Architecture
//!
//! ```text
//! AudioCapturePipeline ──▶ ConnectionManager::send ──▶ Transport (WebSocket)
//!                                  │                         │
//!                         ChunkBacklog (while               ▼
//!                          reconnecting)              reader task
//!                                                          │
//!                                  EventBus ◀── protocol::decode
//!                                     │
//!                                     ▼
//!                          TestSessionCoordinator
//! ```
//!
//! # Reconnection Strategy
//!
//! - An unexpected close schedules a reconnect after `base × 2^(attempt-1)`
//! - At most 5 attempts, then `reconnectionFailed` fires once and we stop
//! - A clean server close (code 1000) or `disconnect()` never reconnects
//! - Timers carry the session epoch and attempt number and bail out when stale

mod audio_buffer;
mod connection;
mod events;
mod protocol;
mod transcript_aggregator;
mod transport;

pub use audio_buffer::{AudioChunk, ChunkBacklog, ChunkEncoding};
pub use connection::{
    backoff_delay, ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus,
};
pub use events::{ConnectionEvent, EventBus, EventHandler, EventKind, SubscriptionId};
pub use protocol::{
    decode, AiResponse, AudioChunkData, AudioProcessed, ClientMessage, ConversationStart,
    Decoded, RealTimeFeedback, ServerMessage, SessionUpdate, Transcription,
};
pub use transcript_aggregator::TranscriptAggregator;
pub use transport::{Duplex, InboundFrame, OutboundFrame, Transport, WebSocketTransport};

/// Errors that can occur on the live stream
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to open the transport
    ConnectionFailed(String),
    /// No handshake reply within the handshake timeout
    AuthTimeout,
    /// The backend rejected the handshake
    AuthFailed(String),
    /// Operation needs an authenticated stream
    NotConnected,
    /// Reconnection gave up after the attempt cap
    ReconnectionExhausted { attempts: u32 },
    /// Stream closed during the handshake
    Disconnected(String),
    /// Superseded by a newer `connect()` or a `disconnect()`
    Cancelled,
    /// Frame could not be encoded
    ProtocolError(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to the live stream: {}", e)
            }
            ConnectionError::AuthTimeout => {
                write!(f, "Live stream authentication timed out")
            }
            ConnectionError::AuthFailed(e) => write!(f, "Live stream authentication failed: {}", e),
            ConnectionError::NotConnected => write!(f, "Live stream is not authenticated"),
            ConnectionError::ReconnectionExhausted { attempts } => {
                write!(f, "Live stream lost after {} reconnection attempts", attempts)
            }
            ConnectionError::Disconnected(e) => write!(f, "Live stream disconnected: {}", e),
            ConnectionError::Cancelled => write!(f, "Connection attempt superseded"),
            ConnectionError::ProtocolError(e) => write!(f, "Live stream protocol error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

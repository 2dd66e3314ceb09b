//! Live stream protocol types
//!
//! JSON text frames exchanged with the scoring backend over the duplex stream.
//! Every frame carries a `type` discriminator.
//!
//! # Protocol Overview
//!
//! 1. Open the stream and send `auth` with the session token
//! 2. Receive `authenticated` (or `auth_error`)
//! 3. Send `start_conversation` when a task begins
//! 4. Stream audio via `audio_chunk`
//! 5. Receive `transcription`, `ai_response`, `real_time_feedback`, ...
//! 6. `ping` / `pong` every 30 seconds while authenticated

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{Mode, SessionStatus, TestType};

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

/// Payload of an `audio_chunk` message
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioChunkData {
    /// Sequence id of the chunk within its recording
    pub chunk_id: u64,
    /// Base64-encoded PCM16 little-endian audio
    pub audio_buffer: String,
    /// Capture wall-clock time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Payload of a `start_conversation` message
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationStart {
    pub test_type: TestType,
    pub task_type: String,
    pub task_index: u32,
}

/// Messages sent from client to backend
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake: authenticate the raw stream for a session
    Auth { token: String, session_id: String },

    /// Heartbeat
    Ping { timestamp: i64 },

    /// One slice of captured audio
    AudioChunk { data: AudioChunkData },

    /// Prime the backend with the task about to be answered
    StartConversation { data: ConversationStart },
}

impl ClientMessage {
    pub fn auth(token: &str, session_id: &str) -> Self {
        Self::Auth {
            token: token.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn ping(timestamp: i64) -> Self {
        Self::Ping { timestamp }
    }

    /// Create an audio chunk message from raw PCM16 bytes
    pub fn audio_chunk(chunk_id: u64, pcm_le: &[u8], timestamp: i64) -> Self {
        Self::AudioChunk {
            data: AudioChunkData {
                chunk_id,
                audio_buffer: STANDARD.encode(pcm_le),
                timestamp,
            },
        }
    }

    pub fn start_conversation(test_type: TestType, task_type: &str, task_index: u32) -> Self {
        Self::StartConversation {
            data: ConversationStart {
                test_type,
                task_type: task_type.to_string(),
                task_index,
            },
        }
    }

    /// Wire name of this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::AudioChunk { .. } => "audio_chunk",
            ClientMessage::StartConversation { .. } => "start_conversation",
        }
    }
}

// ============================================================================
// Server Messages (received FROM the backend)
// ============================================================================

/// Server-reported session fields. Every field is optional: only the fields
/// present in the update overwrite the local copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionUpdate {
    pub session_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub test_type: Option<TestType>,
    pub mode: Option<Mode>,
    pub owner_user_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Backend acknowledgement that a chunk was processed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioProcessed {
    pub chunk_id: Option<u64>,
    pub duration_ms: Option<u64>,
}

/// Live transcription of the current response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Transcription {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// Examiner/assistant turn generated by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiResponse {
    pub text: String,
    pub audio_url: Option<String>,
}

/// Incremental feedback on the response being given
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealTimeFeedback {
    pub category: Option<String>,
    pub message: String,
    pub score: Option<f32>,
}

/// Messages received from the backend
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    Authenticated {
        #[serde(default)]
        user_id: String,
    },

    /// Handshake rejected
    AuthError {
        #[serde(default)]
        message: String,
    },

    /// Heartbeat reply
    Pong,

    SessionUpdated {
        #[serde(default)]
        data: SessionUpdate,
    },

    AudioProcessed {
        #[serde(default)]
        data: AudioProcessed,
    },

    Transcription {
        #[serde(default)]
        data: Transcription,
    },

    AiResponse {
        #[serde(default)]
        data: AiResponse,
    },

    RealTimeFeedback {
        #[serde(default)]
        data: RealTimeFeedback,
    },

    Error {
        #[serde(default)]
        message: String,
    },

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

/// Outcome of decoding one inbound text frame
#[derive(Debug, Clone)]
pub enum Decoded {
    Known(ServerMessage),
    /// Valid JSON with an unrecognized `type`; the raw value is kept
    Other(Value),
}

/// Decode an inbound text frame.
///
/// Invalid JSON, or a known `type` with malformed fields, is an error.
pub fn decode(text: &str) -> Result<Decoded, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    match serde_json::from_value::<ServerMessage>(value.clone())? {
        ServerMessage::Unknown => Ok(Decoded::Other(value)),
        known => Ok(Decoded::Known(known)),
    }
}

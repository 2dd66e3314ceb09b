//! Test session coordination
//!
//! [`TestSessionCoordinator`] drives one test attempt: it creates the session,
//! sequences tasks, runs capture during each response, submits responses and
//! retrieves the final score. Phase legality comes from
//! [`crate::state_machine::reduce`].

mod live;
mod session;
mod state;

pub use live::LiveFeedback;
pub use session::TestSessionCoordinator;
pub use state::{
    merge_session_update, CoordinatorSnapshot, NextStep, Recording, TestResult, TestState,
};

use crate::audio::CaptureError;
use crate::streaming::ConnectionError;

/// Errors returned by coordinator operations
#[derive(Debug, Clone, PartialEq)]
pub enum TestError {
    /// Nobody is signed in
    AuthRequired,
    SessionCreateFailed(String),
    MicrophoneAccessDenied(String),
    NotInitialized,
    AlreadyRecording,
    /// Audio capture failed after the microphone was acquired
    CaptureFailed(String),
    AuthTimeout,
    NotConnected,
    /// The live stream failed for good
    ReconnectionExhausted,
    ConnectionFailed(String),
    SubmitFailed(String),
    ScoreRetrievalFailed(String),
    /// Operation needs a session
    NoSession,
    /// Operation not legal in the current phase
    InvalidPhase(String),
    TaskFetchFailed(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::AuthRequired => write!(f, "Sign in to start a test"),
            TestError::SessionCreateFailed(e) => write!(f, "Failed to create session: {}", e),
            TestError::MicrophoneAccessDenied(e) => write!(f, "Microphone access denied: {}", e),
            TestError::NotInitialized => write!(f, "Microphone not initialized"),
            TestError::AlreadyRecording => write!(f, "Already recording"),
            TestError::CaptureFailed(e) => write!(f, "Audio capture failed: {}", e),
            TestError::AuthTimeout => write!(f, "Live stream authentication timed out"),
            TestError::NotConnected => write!(f, "Live stream is not connected"),
            TestError::ReconnectionExhausted => {
                write!(f, "Lost connection to the scoring service")
            }
            TestError::ConnectionFailed(e) => write!(f, "Live stream connection failed: {}", e),
            TestError::SubmitFailed(e) => write!(f, "Failed to submit response: {}", e),
            TestError::ScoreRetrievalFailed(e) => write!(f, "Failed to retrieve scores: {}", e),
            TestError::NoSession => write!(f, "No active test session"),
            TestError::InvalidPhase(e) => write!(f, "Not allowed now: {}", e),
            TestError::TaskFetchFailed(e) => write!(f, "Failed to load task: {}", e),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ConnectionError> for TestError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::AuthTimeout => TestError::AuthTimeout,
            ConnectionError::NotConnected => TestError::NotConnected,
            ConnectionError::ReconnectionExhausted { .. } => TestError::ReconnectionExhausted,
            other => TestError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<CaptureError> for TestError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::MicrophoneAccessDenied(e) => TestError::MicrophoneAccessDenied(e),
            CaptureError::NotInitialized => TestError::NotInitialized,
            CaptureError::AlreadyRecording => TestError::AlreadyRecording,
            CaptureError::StreamFailed(e) | CaptureError::EncodeFailed(e) => {
                TestError::CaptureFailed(e)
            }
        }
    }
}

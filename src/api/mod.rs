//! Backend request/response collaborators
//!
//! The coordinator never talks HTTP directly: it is handed trait objects for
//! each collaborator, constructed at test start and dropped at test end.
//!
//! - [`AuthProvider`]: resolves the current user
//! - [`SessionApi`]: create/get/list/status
//! - [`TaskApi`]: start a task, submit a response (parameterized by test type)
//! - [`AudioUploadApi`]: upload a recorded response
//! - [`ScoreApi`]: fetch the aggregate score
//!
//! [`HttpBackend`] implements the four backend traits over reqwest;
//! [`HttpAuthProvider`] and [`StaticUser`] implement [`AuthProvider`].

mod auth;
mod http;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use auth::{AuthUser, HttpAuthProvider, LoginResponse, StaticUser};
pub use http::HttpBackend;
pub use types::{
    AudioUpload, CreateSessionRequest, CreatedSession, CriterionScore, Mode, QualityMetrics,
    ResponseMeta, ResponseTiming, ScoreReport, Session, SessionStatus, SessionStatusReport,
    SubmissionReceipt, TaskContent, TaskSubmission, TestType, UploadMetadata, UploadResult, User,
};

/// Errors returned by backend collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// No credentials, or the backend rejected them
    Unauthorized(String),
    /// Network/HTTP transport error
    Network(String),
    /// The backend answered with a non-success status
    Status { status: u16, message: String },
    /// Failed to parse the backend response
    Parse(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized(e) => write!(f, "Unauthorized: {}", e),
            ApiError::Network(e) => write!(f, "Network error: {}", e),
            ApiError::Status { status, message } => {
                write!(f, "Backend error ({}): {}", status, message)
            }
            ApiError::Parse(e) => write!(f, "Failed to parse backend response: {}", e),
        }
    }
}

impl std::error::Error for ApiError {}

/// Capability that answers "who is signed in"
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The current user, or `None` when nobody is signed in
    async fn current_user(&self) -> Option<User>;

    /// End the user's sign-in
    async fn logout(&self) -> Result<(), ApiError>;
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, ApiError>;
    async fn get(&self, session_id: &str) -> Result<Session, ApiError>;
    async fn list(&self, user_id: &str) -> Result<Vec<Session>, ApiError>;
    async fn status(&self, session_id: &str) -> Result<SessionStatusReport, ApiError>;
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn start(
        &self,
        test_type: TestType,
        session_id: &str,
        task_index: u32,
    ) -> Result<TaskContent, ApiError>;

    async fn submit_response(
        &self,
        test_type: TestType,
        session_id: &str,
        task_index: u32,
        payload: &TaskSubmission,
    ) -> Result<SubmissionReceipt, ApiError>;
}

#[async_trait]
pub trait AudioUploadApi: Send + Sync {
    async fn upload(
        &self,
        file: &AudioUpload,
        session_id: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult, ApiError>;
}

#[async_trait]
pub trait ScoreApi: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<ScoreReport, ApiError>;
}

/// Collaborators injected into the coordinator
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthProvider>,
    pub sessions: Arc<dyn SessionApi>,
    pub tasks: Arc<dyn TaskApi>,
    pub uploads: Arc<dyn AudioUploadApi>,
    pub scores: Arc<dyn ScoreApi>,
}

impl Services {
    /// Wire every backend collaborator to one implementation
    pub fn from_backend<B>(auth: Arc<dyn AuthProvider>, backend: Arc<B>) -> Self
    where
        B: SessionApi + TaskApi + AudioUploadApi + ScoreApi + 'static,
    {
        Self {
            auth,
            sessions: backend.clone(),
            tasks: backend.clone(),
            uploads: backend.clone(),
            scores: backend,
        }
    }
}

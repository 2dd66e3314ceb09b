//! Data structures exchanged with the backend request/response API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which proficiency test is being taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Toefl,
    Ielts,
}

impl TestType {
    /// Number of speaking tasks in one attempt
    pub fn total_tasks(&self) -> u32 {
        match self {
            TestType::Toefl => 4,
            TestType::Ielts => 3,
        }
    }

    /// Path segment used by the task API
    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Toefl => "toefl",
            TestType::Ielts => "ielts",
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestType::Toefl => write!(f, "TOEFL"),
            TestType::Ielts => write!(f, "IELTS"),
        }
    }
}

impl std::str::FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "toefl" => Ok(TestType::Toefl),
            "ielts" => Ok(TestType::Ielts),
            other => Err(format!("unknown test type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Full,
    Practice,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "practice" => Ok(Mode::Practice),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Backend-reported lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// The currently signed-in user, as resolved by the auth collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Backend-tracked record of one test attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub test_type: TestType,
    pub mode: Mode,
    pub owner_user_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Response of session creation: the session plus how to reach its live stream
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSession {
    pub session: Session,
    /// Stream token used in the `auth` handshake
    pub token: String,
    /// Stream endpoint, when it differs from the configured one
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub test_type: TestType,
    pub mode: Mode,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatusReport {
    pub status: SessionStatus,
    #[serde(default)]
    pub current_task: Option<u32>,
}

/// Content of one task, fetched when the task starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContent {
    pub task_index: u32,
    pub task_type: String,
    pub prompt: String,
    #[serde(default)]
    pub reading_text: Option<String>,
    #[serde(default)]
    pub listening_url: Option<String>,
    #[serde(default)]
    pub preparation_secs: u32,
    #[serde(default)]
    pub response_secs: u32,
}

/// Audio file handed to the upload API
#[derive(Debug, Clone, PartialEq)]
pub struct AudioUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub task_index: u32,
    pub test_type: TestType,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityMetrics {
    pub duration_ms: Option<u64>,
    pub clarity: Option<f32>,
    pub volume: Option<f32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadResult {
    pub audio_id: String,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub quality_metrics: QualityMetrics,
}

/// Caller-supplied details about a response
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    /// How much of the preparation time the candidate used
    pub preparation_used_ms: Option<u64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseTiming {
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub preparation_used_ms: Option<u64>,
}

/// Structured response sent to the task-submission API
#[derive(Debug, Clone, Serialize)]
pub struct TaskSubmission {
    pub audio_id: String,
    pub transcript: Option<String>,
    pub timing: ResponseTiming,
    pub quality: QualityMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Reply to a task submission. A missing `accepted` counts as accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmissionReceipt {
    pub accepted: Option<bool>,
    pub message: Option<String>,
}

impl SubmissionReceipt {
    pub fn is_rejected(&self) -> bool {
        self.accepted == Some(false)
    }
}

/// Aggregate score of a completed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub overall: f32,
    #[serde(default)]
    pub band: Option<String>,
    #[serde(default)]
    pub criteria: Vec<CriterionScore>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub name: String,
    pub score: f32,
}

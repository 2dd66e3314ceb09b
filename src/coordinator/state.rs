//! Test attempt state owned by the coordinator

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::{Mode, ScoreReport, Session, TaskContent, TestType};
use crate::state_machine::{Phase, Progress};
use crate::streaming::{ConnectionState, SessionUpdate};

use super::live::LiveFeedback;

/// One accepted response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub task_index: u32,
    pub audio_id: String,
    pub transcript: Option<String>,
    pub duration_ms: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestState {
    pub test_type: TestType,
    pub mode: Mode,
    #[serde(flatten)]
    pub progress: Progress,
    pub recordings: Vec<Recording>,
    pub scores: Option<ScoreReport>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TestState {
    pub fn new(test_type: TestType, mode: Mode) -> Self {
        Self {
            test_type,
            mode,
            progress: Progress::new(test_type.total_tasks()),
            recordings: Vec::new(),
            scores: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn current_task_index(&self) -> u32 {
        self.progress.task_index
    }

    pub fn total_tasks(&self) -> u32 {
        self.progress.total_tasks
    }

    pub fn phase(&self) -> Phase {
        self.progress.phase
    }

    pub fn is_completed(&self) -> bool {
        self.progress.phase == Phase::Completed
    }
}

/// Final outcome of a completed test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub test_type: TestType,
    pub scores: ScoreReport,
    pub recordings: Vec<Recording>,
    pub elapsed_ms: i64,
}

/// What `next_task()` led to
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    Task(TaskContent),
    Completed(TestResult),
}

/// Serializable view for a UI layer
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub session: Option<Session>,
    pub test: Option<TestState>,
    pub current_task: Option<TaskContent>,
    pub connection: ConnectionState,
    pub live: LiveFeedback,
    pub recording: bool,
    pub connectivity_failure: bool,
}

/// Overwrite the fields present in `update` (last write wins).
///
/// Returns false, changing nothing, when the update names another session.
pub fn merge_session_update(session: &mut Session, update: &SessionUpdate) -> bool {
    if let Some(id) = &update.session_id {
        if id != &session.id {
            log::debug!(
                "Coordinator: ignoring update for session {} (current {})",
                id,
                session.id
            );
            return false;
        }
    }

    if let Some(status) = update.status {
        session.status = status;
    }
    if let Some(test_type) = update.test_type {
        session.test_type = test_type;
    }
    if let Some(mode) = update.mode {
        session.mode = mode;
    }
    if let Some(owner) = &update.owner_user_id {
        session.owner_user_id = owner.clone();
    }
    if let Some(created_at) = update.created_at {
        session.created_at = created_at;
    }
    true
}

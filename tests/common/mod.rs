//! Shared fakes for the integration tests
//!
//! - [`MockTransport`]: in-memory duplex streams; the server end of each
//!   opened stream is handed to the test
//! - [`AutoServer`]: a server that authenticates every stream and records
//!   what the client sends
//! - [`FakeBackend`]: the four backend collaborators with injectable failures
//! - [`FakeMicrophone`]: an audio source the test feeds by hand

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use speaking_test::api::{
    ApiError, AudioUpload, AudioUploadApi, CreateSessionRequest, CreatedSession, ScoreApi,
    ScoreReport, Services, Session, SessionApi, SessionStatus, SessionStatusReport, StaticUser,
    SubmissionReceipt, TaskApi, TaskContent, TaskSubmission, TestType, UploadMetadata,
    UploadResult, User,
};
use speaking_test::audio::{
    AudioCapturePipeline, AudioSource, CaptureConfig, CaptureConstraints, CaptureError,
};
use speaking_test::coordinator::TestSessionCoordinator;
use speaking_test::streaming::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, Duplex, EventKind,
    InboundFrame, OutboundFrame, Transport,
};

pub const SESSION_ID: &str = "sess-1";
pub const STREAM_TOKEN: &str = "stream-token";
pub const USER_ID: &str = "user-42";

// ============================================================================
// Transport
// ============================================================================

/// Server side of one in-memory stream
pub struct ServerEnd {
    pub from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    pub to_client: mpsc::UnboundedSender<InboundFrame>,
}

impl ServerEnd {
    /// Next client frame as JSON, heartbeats included. `None` once the client closed.
    pub async fn next_raw(&mut self) -> Option<Value> {
        match self.from_client.recv().await? {
            OutboundFrame::Text(text) => Some(serde_json::from_str(&text).unwrap()),
            OutboundFrame::Close => None,
        }
    }

    /// Next client message, skipping heartbeats
    pub async fn next_message(&mut self) -> Option<Value> {
        loop {
            let value = self.next_raw().await?;
            if value["type"] != "ping" {
                return Some(value);
            }
        }
    }

    pub fn reply(&self, value: Value) {
        let _ = self.to_client.send(InboundFrame::Text(value.to_string()));
    }

    /// Expect the `auth` message and accept it
    pub async fn authenticate(&mut self, user_id: &str) -> Value {
        let auth = self.next_message().await.unwrap();
        assert_eq!(auth["type"], "auth");
        self.reply(json!({"type": "authenticated", "user_id": user_id}));
        auth
    }

    pub fn close(&self, clean: bool) {
        let _ = self.to_client.send(InboundFrame::Closed {
            clean,
            reason: Some(if clean { "bye" } else { "network lost" }.to_string()),
        });
    }
}

/// Transport whose streams are in-memory channel pairs
pub struct MockTransport {
    refuse: AtomicBool,
    opens: Mutex<Vec<(String, Instant)>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            refuse: AtomicBool::new(false),
            opens: Mutex::new(Vec::new()),
            servers,
        });
        (transport, accepted)
    }

    /// Make every following `open` fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.opens.lock().iter().map(|(url, _)| url.clone()).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<Duplex, ConnectionError> {
        self.opens.lock().push((url.to_string(), Instant::now()));

        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            from_client: out_rx,
            to_client: in_tx,
        });

        Ok(Duplex {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Authenticates every stream and records every non-heartbeat message
#[derive(Clone)]
pub struct AutoServer {
    messages: Arc<Mutex<Vec<Value>>>,
    clients: Arc<Mutex<Vec<mpsc::UnboundedSender<InboundFrame>>>>,
}

impl AutoServer {
    pub fn spawn(mut accepted: mpsc::UnboundedReceiver<ServerEnd>) -> Self {
        let server = Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            clients: Arc::new(Mutex::new(Vec::new())),
        };

        let handle = server.clone();
        tokio::spawn(async move {
            while let Some(mut end) = accepted.recv().await {
                handle.clients.lock().push(end.to_client.clone());
                let messages = handle.messages.clone();
                tokio::spawn(async move {
                    while let Some(message) = end.next_message().await {
                        if message["type"] == "auth" {
                            end.reply(json!({"type": "authenticated", "user_id": USER_ID}));
                        } else {
                            messages.lock().push(message);
                        }
                    }
                });
            }
        });

        server
    }

    /// Send a server message on the most recent stream
    pub fn push(&self, value: Value) {
        if let Some(client) = self.clients.lock().last() {
            let _ = client.send(InboundFrame::Text(value.to_string()));
        }
    }

    /// Drop the most recent stream without a clean close
    pub fn cut(&self) {
        if let Some(client) = self.clients.lock().last() {
            let _ = client.send(InboundFrame::Closed {
                clean: false,
                reason: Some("network lost".to_string()),
            });
        }
    }

    pub fn messages_of(&self, kind: &str) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m["type"] == kind)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
pub struct FakeBackend {
    sessions_created: AtomicU32,
    session: Mutex<Option<Session>>,
    endpoint: Mutex<Option<String>>,
    tasks_started: Mutex<Vec<u32>>,
    uploads: Mutex<Vec<UploadMetadata>>,
    submissions: Mutex<Vec<(u32, TaskSubmission)>>,
    fail_task_fetches: AtomicU32,
    fail_uploads: AtomicU32,
    fail_submits: AtomicU32,
    reject_submits: AtomicU32,
    fail_scores: AtomicBool,
}

/// Consume one injected failure, if any are left
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn server_error(what: &str) -> ApiError {
    ApiError::Status {
        status: 500,
        message: format!("{} unavailable", what),
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_stream_endpoint(url: &str) -> Arc<Self> {
        let backend = Self::default();
        *backend.endpoint.lock() = Some(url.to_string());
        Arc::new(backend)
    }

    pub fn fail_next_task_fetches(&self, n: u32) {
        self.fail_task_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    pub fn reject_next_submits(&self, n: u32) {
        self.reject_submits.store(n, Ordering::SeqCst);
    }

    pub fn fail_scores(&self, fail: bool) {
        self.fail_scores.store(fail, Ordering::SeqCst);
    }

    pub fn sessions_created(&self) -> u32 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn tasks_started(&self) -> Vec<u32> {
        self.tasks_started.lock().clone()
    }

    pub fn uploads(&self) -> Vec<UploadMetadata> {
        self.uploads.lock().clone()
    }

    pub fn submitted_tasks(&self) -> Vec<u32> {
        self.submissions.lock().iter().map(|(i, _)| *i).collect()
    }

    pub fn submission(&self, task_index: u32) -> Option<TaskSubmission> {
        self.submissions
            .lock()
            .iter()
            .find(|(i, _)| *i == task_index)
            .map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl SessionApi for FakeBackend {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, ApiError> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        let session = Session {
            id: SESSION_ID.to_string(),
            test_type: request.test_type,
            mode: request.mode,
            owner_user_id: request.user_id.clone(),
            created_at: Utc::now(),
            status: SessionStatus::Created,
        };
        *self.session.lock() = Some(session.clone());
        Ok(CreatedSession {
            session,
            token: STREAM_TOKEN.to_string(),
            endpoint: self.endpoint.lock().clone(),
        })
    }

    async fn get(&self, session_id: &str) -> Result<Session, ApiError> {
        self.session
            .lock()
            .clone()
            .filter(|s| s.id == session_id)
            .ok_or(ApiError::Status {
                status: 404,
                message: "no such session".to_string(),
            })
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Session>, ApiError> {
        Ok(self
            .session
            .lock()
            .iter()
            .filter(|s| s.owner_user_id == user_id)
            .cloned()
            .collect())
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatusReport, ApiError> {
        let session = SessionApi::get(self, session_id).await?;
        Ok(SessionStatusReport {
            status: session.status,
            current_task: self.tasks_started.lock().last().copied(),
        })
    }
}

#[async_trait]
impl TaskApi for FakeBackend {
    async fn start(
        &self,
        test_type: TestType,
        _session_id: &str,
        task_index: u32,
    ) -> Result<TaskContent, ApiError> {
        if take_failure(&self.fail_task_fetches) {
            return Err(server_error("task service"));
        }
        self.tasks_started.lock().push(task_index);
        Ok(TaskContent {
            task_index,
            task_type: format!("{}-task-{}", test_type.as_str(), task_index),
            prompt: format!("Prompt for task {}", task_index),
            reading_text: None,
            listening_url: None,
            preparation_secs: 15,
            response_secs: 45,
        })
    }

    async fn submit_response(
        &self,
        _test_type: TestType,
        _session_id: &str,
        task_index: u32,
        payload: &TaskSubmission,
    ) -> Result<SubmissionReceipt, ApiError> {
        if take_failure(&self.fail_submits) {
            return Err(server_error("submission service"));
        }
        if take_failure(&self.reject_submits) {
            return Ok(SubmissionReceipt {
                accepted: Some(false),
                message: Some("audio too short".to_string()),
            });
        }
        self.submissions.lock().push((task_index, payload.clone()));
        Ok(SubmissionReceipt {
            accepted: Some(true),
            message: None,
        })
    }
}

#[async_trait]
impl AudioUploadApi for FakeBackend {
    async fn upload(
        &self,
        file: &AudioUpload,
        _session_id: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult, ApiError> {
        if take_failure(&self.fail_uploads) {
            return Err(server_error("upload service"));
        }
        assert_eq!(file.mime_type, "audio/wav");
        assert!(file.bytes.starts_with(b"RIFF"));

        let mut uploads = self.uploads.lock();
        uploads.push(metadata.clone());
        Ok(UploadResult {
            audio_id: format!("audio-{}-{}", metadata.task_index, uploads.len()),
            transcript: None,
            quality_metrics: Default::default(),
        })
    }
}

#[async_trait]
impl ScoreApi for FakeBackend {
    async fn get(&self, _session_id: &str) -> Result<ScoreReport, ApiError> {
        if self.fail_scores.load(Ordering::SeqCst) {
            return Err(server_error("scoring service"));
        }
        Ok(ScoreReport {
            overall: 26.0,
            band: None,
            criteria: Vec::new(),
            feedback: Some("Clear delivery".to_string()),
        })
    }
}

pub fn signed_in() -> StaticUser {
    StaticUser::new(User {
        id: USER_ID.to_string(),
        email: Some("candidate@example.com".to_string()),
        name: None,
    })
}

// ============================================================================
// Microphone
// ============================================================================

type Sink = Arc<Mutex<Option<mpsc::Sender<Vec<i16>>>>>;

/// Audio source at 16 kHz that emits `per_recording` samples on every start
pub struct FakeMicrophone {
    per_recording: usize,
    sink: Sink,
    deny: bool,
}

/// Test-side handle for pushing more audio into a running recording
#[derive(Clone)]
pub struct MicFeed {
    sink: Sink,
}

impl MicFeed {
    pub fn push(&self, samples: Vec<i16>) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.try_send(samples).unwrap();
        }
    }
}

impl FakeMicrophone {
    pub fn new(per_recording: usize) -> (Self, MicFeed) {
        let sink = Arc::new(Mutex::new(None));
        let mic = Self {
            per_recording,
            sink: sink.clone(),
            deny: false,
        };
        (mic, MicFeed { sink })
    }

    pub fn denied() -> Self {
        Self {
            per_recording: 0,
            sink: Arc::new(Mutex::new(None)),
            deny: true,
        }
    }
}

pub fn tone(samples: usize) -> Vec<i16> {
    (0..samples).map(|i| ((i % 200) as i16 - 100) * 50).collect()
}

#[async_trait]
impl AudioSource for FakeMicrophone {
    fn acquire(&mut self, _constraints: &CaptureConstraints) -> Result<u32, CaptureError> {
        if self.deny {
            return Err(CaptureError::MicrophoneAccessDenied(
                "permission denied".to_string(),
            ));
        }
        Ok(16000)
    }

    async fn start(&mut self, sink: mpsc::Sender<Vec<i16>>) -> Result<(), CaptureError> {
        if self.per_recording > 0 {
            sink.try_send(tone(self.per_recording))
                .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn stop(&mut self) {
        self.sink.lock().take();
    }

    async fn release(&mut self) {}
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub coordinator: TestSessionCoordinator,
    pub backend: Arc<FakeBackend>,
    pub server: AutoServer,
    pub transport: Arc<MockTransport>,
}

/// Coordinator over fakes; every response captures 1.5 s of audio
pub fn harness(backend: Arc<FakeBackend>, user: StaticUser) -> Harness {
    let (mic, _feed) = FakeMicrophone::new(24000);
    harness_with_mic(backend, user, mic)
}

pub fn harness_with_mic(
    backend: Arc<FakeBackend>,
    user: StaticUser,
    mic: FakeMicrophone,
) -> Harness {
    let (transport, accepted) = MockTransport::new();
    let server = AutoServer::spawn(accepted);

    let services = Services::from_backend(Arc::new(user), backend.clone());
    let connection = ConnectionManager::new(ConnectionConfig::default(), transport.clone());
    let capture = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(mic));

    Harness {
        coordinator: TestSessionCoordinator::new(services, connection, capture),
        backend,
        server,
        transport,
    }
}

/// Collect every event of the given kinds
pub fn record_events(
    manager: &ConnectionManager,
    kinds: &[EventKind],
) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let sink = seen.clone();
        manager.on(
            *kind,
            Arc::new(move |event: &ConnectionEvent| sink.lock().push(event.clone())),
        );
    }
    seen
}

/// Poll `condition` until it holds, sleeping between checks
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

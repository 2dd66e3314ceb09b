//! TestSessionCoordinator
//!
//! # Flow
//!
//! ```text
//! create_session ─▶ start_task ─▶ begin_response ─▶ submit_response ─▶ next_task ─┐
//!                       ▲                                                           │
//!                       └──────────────────── (more tasks) ◀────────────────────────┘
//!                                             (last task) ─▶ complete_test
//! ```
//!
//! Backend calls are never retried here; failures leave the phase unchanged so
//! the caller can retry the same operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::api::{
    AudioUpload, CreateSessionRequest, Mode, ResponseMeta, ResponseTiming, Session, Services,
    TaskContent, TaskSubmission, TestType, UploadMetadata,
};
use crate::audio::{AudioCapturePipeline, CapturedAudio};
use crate::state_machine::{reduce, Effect, Event, Progress, Transition};
use crate::streaming::{
    ClientMessage, ConnectionEvent, ConnectionManager, EventKind, SubscriptionId,
};

use super::live::LiveFeedback;
use super::state::{
    merge_session_update, CoordinatorSnapshot, NextStep, Recording, TestResult, TestState,
};
use super::TestError;

pub struct TestSessionCoordinator {
    services: Services,
    connection: ConnectionManager,
    capture: AudioCapturePipeline,
    session: Arc<Mutex<Option<Session>>>,
    stream_token: Option<String>,
    test: Option<TestState>,
    current_task: Option<TaskContent>,
    /// Audio of the response being answered, kept until it is accepted
    pending_audio: Option<CapturedAudio>,
    response_started_at: Option<DateTime<Utc>>,
    live: Arc<Mutex<LiveFeedback>>,
    connectivity_lost: Arc<AtomicBool>,
    subscriptions: Vec<SubscriptionId>,
}

impl TestSessionCoordinator {
    pub fn new(
        services: Services,
        connection: ConnectionManager,
        capture: AudioCapturePipeline,
    ) -> Self {
        Self {
            services,
            connection,
            capture,
            session: Arc::new(Mutex::new(None)),
            stream_token: None,
            test: None,
            current_task: None,
            pending_audio: None,
            response_started_at: None,
            live: Arc::new(Mutex::new(LiveFeedback::default())),
            connectivity_lost: Arc::new(AtomicBool::new(false)),
            subscriptions: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn test_state(&self) -> Option<&TestState> {
        self.test.as_ref()
    }

    pub fn current_task(&self) -> Option<&TaskContent> {
        self.current_task.as_ref()
    }

    pub fn live_feedback(&self) -> LiveFeedback {
        self.live.lock().clone()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_recording()
    }

    /// The live stream gave up reconnecting
    pub fn connectivity_failure(&self) -> bool {
        self.connectivity_lost.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            session: self.session(),
            test: self.test.clone(),
            current_task: self.current_task.clone(),
            connection: self.connection.state(),
            live: self.live_feedback(),
            recording: self.capture.is_recording(),
            connectivity_failure: self.connectivity_failure(),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Create a session for the signed-in user and open its live stream.
    ///
    /// If the stream cannot be opened the error is returned, but the session
    /// and test state are kept; `reconnect_stream()` retries.
    pub async fn create_session(
        &mut self,
        test_type: TestType,
        mode: Mode,
    ) -> Result<Session, TestError> {
        let user = self
            .services
            .auth
            .current_user()
            .await
            .ok_or(TestError::AuthRequired)?;

        let request = CreateSessionRequest {
            test_type,
            mode,
            user_id: user.id.clone(),
        };
        let created = self
            .services
            .sessions
            .create(&request)
            .await
            .map_err(|e| TestError::SessionCreateFailed(e.to_string()))?;

        log::info!(
            "Coordinator: session {} created ({} {:?}) for {}",
            created.session.id,
            test_type,
            mode,
            user.id
        );

        self.discard_capture().await;
        self.subscribe();

        let session = created.session;
        *self.session.lock() = Some(session.clone());
        self.test = Some(TestState::new(test_type, mode));
        self.stream_token = Some(created.token.clone());
        self.current_task = None;
        self.response_started_at = None;
        self.live.lock().reset();
        self.connectivity_lost.store(false, Ordering::SeqCst);

        if let Some(endpoint) = &created.endpoint {
            self.connection.set_endpoint(endpoint);
        }
        self.capture.set_connection(Some(self.connection.clone()));

        self.connection.connect(&session.id, &created.token).await?;
        Ok(session)
    }

    /// Re-open the live stream for the current session
    pub async fn reconnect_stream(&mut self) -> Result<(), TestError> {
        let session_id = self.session_id()?;
        let token = self.stream_token.clone().ok_or(TestError::NoSession)?;

        self.connectivity_lost.store(false, Ordering::SeqCst);
        self.connection.connect(&session_id, &token).await?;
        Ok(())
    }

    /// Load a task (default: the current one) and enter its Preparation phase
    pub async fn start_task(&mut self, task_index: Option<u32>) -> Result<TaskContent, TestError> {
        let session_id = self.session_id()?;
        let test = self.test.as_ref().ok_or(TestError::NoSession)?;
        let test_type = test.test_type;
        let index = task_index.unwrap_or(test.progress.task_index);

        let transition = reduce(&test.progress, Event::TaskLoaded { index }).ok_or_else(|| {
            TestError::InvalidPhase(format!(
                "cannot start task {} of {} in {:?}",
                index, test.progress.total_tasks, test.progress.phase
            ))
        })?;

        let content = self
            .services
            .tasks
            .start(test_type, &session_id, index)
            .await
            .map_err(|e| TestError::TaskFetchFailed(e.to_string()))?;

        log::info!("Coordinator: task {} ({}) loaded", index, content.task_type);

        self.current_task = Some(content.clone());
        self.apply(transition).await?;
        self.drop_pending_audio();
        Ok(content)
    }

    /// Leave Preparation and start capturing the response
    pub async fn begin_response(&mut self) -> Result<(), TestError> {
        if self.connectivity_failure() {
            return Err(TestError::ReconnectionExhausted);
        }

        let progress = self.progress()?;
        let transition = reduce(&progress, Event::BeginResponse).ok_or_else(|| {
            TestError::InvalidPhase(format!("cannot begin a response in {:?}", progress.phase))
        })?;

        self.apply(transition).await
    }

    /// Upload the response audio and submit it for the current task.
    ///
    /// `audio` overrides the captured recording. On failure the phase stays
    /// Response and the captured audio is kept for another attempt.
    pub async fn submit_response(
        &mut self,
        audio: Option<AudioUpload>,
        meta: ResponseMeta,
    ) -> Result<Recording, TestError> {
        let session_id = self.session_id()?;
        let progress = self.progress()?;
        let test_type = self.test.as_ref().ok_or(TestError::NoSession)?.test_type;

        let transition = reduce(&progress, Event::ResponseAccepted).ok_or_else(|| {
            TestError::InvalidPhase("no response in progress".to_string())
        })?;

        if let Some(captured) = self.capture.stop_recording().await {
            self.pending_audio = Some(captured);
        }

        let task_index = progress.task_index;
        let upload = match audio {
            Some(upload) => upload,
            None => {
                let captured = self
                    .pending_audio
                    .as_ref()
                    .ok_or_else(|| TestError::SubmitFailed("no audio captured".to_string()))?;
                captured
                    .to_upload(&format!("{}-task{}.wav", session_id, task_index))
                    .map_err(|e| TestError::SubmitFailed(e.to_string()))?
            }
        };

        let metadata = UploadMetadata {
            task_index,
            test_type,
            duration_ms: upload.duration_ms,
        };
        let uploaded = self
            .services
            .uploads
            .upload(&upload, &session_id, &metadata)
            .await
            .map_err(|e| TestError::SubmitFailed(format!("upload: {}", e)))?;

        let transcript = uploaded
            .transcript
            .clone()
            .or_else(|| self.live.lock().final_transcript());
        let submitted_at = Utc::now();

        let submission = TaskSubmission {
            audio_id: uploaded.audio_id.clone(),
            transcript: transcript.clone(),
            timing: ResponseTiming {
                started_at: self.response_started_at,
                submitted_at,
                duration_ms: upload.duration_ms,
                preparation_used_ms: meta.preparation_used_ms,
            },
            quality: uploaded.quality_metrics.clone(),
            notes: meta.notes,
        };

        let receipt = self
            .services
            .tasks
            .submit_response(test_type, &session_id, task_index, &submission)
            .await
            .map_err(|e| TestError::SubmitFailed(e.to_string()))?;

        if receipt.is_rejected() {
            return Err(TestError::SubmitFailed(
                receipt
                    .message
                    .unwrap_or_else(|| "response rejected".to_string()),
            ));
        }

        let recording = Recording {
            task_index,
            audio_id: uploaded.audio_id,
            transcript,
            duration_ms: upload.duration_ms,
            captured_at: self.response_started_at.unwrap_or(submitted_at),
        };

        self.apply(transition).await?;
        if let Some(test) = self.test.as_mut() {
            test.recordings.push(recording.clone());
        }
        self.pending_audio = None;
        self.response_started_at = None;

        log::info!(
            "Coordinator: task {} submitted ({}ms, audio {})",
            task_index,
            recording.duration_ms,
            recording.audio_id
        );
        Ok(recording)
    }

    /// Move to the next task, or complete the test after the last one
    pub async fn next_task(&mut self) -> Result<NextStep, TestError> {
        let progress = self.progress()?;

        if progress.is_last_task() {
            return self.complete_test().await.map(NextStep::Completed);
        }

        let transition = reduce(&progress, Event::Advance).ok_or_else(|| {
            TestError::InvalidPhase(format!("cannot advance in {:?}", progress.phase))
        })?;
        let next_index = transition.next.task_index;

        self.apply(transition).await?;
        // The skipped task's audio and content no longer describe progress
        self.drop_pending_audio();
        self.current_task = None;
        self.start_task(Some(next_index)).await.map(NextStep::Task)
    }

    /// Fetch the aggregate score and finish the test
    pub async fn complete_test(&mut self) -> Result<TestResult, TestError> {
        let session_id = self.session_id()?;
        let progress = self.progress()?;

        let transition = reduce(&progress, Event::RequestCompletion).ok_or_else(|| {
            TestError::InvalidPhase(format!(
                "test can only be completed on task {} (currently {}, {:?})",
                progress.total_tasks, progress.task_index, progress.phase
            ))
        })?;
        let finished = reduce(&transition.next, Event::ScoresReady)
            .ok_or_else(|| TestError::InvalidPhase("test already completed".to_string()))?;

        self.apply(transition).await?;

        let scores = self
            .services
            .scores
            .get(&session_id)
            .await
            .map_err(|e| TestError::ScoreRetrievalFailed(e.to_string()))?;

        self.apply(finished).await?;
        self.drop_pending_audio();

        let test = self.test.as_mut().ok_or(TestError::NoSession)?;
        let ended_at = Utc::now();
        test.scores = Some(scores.clone());
        test.ended_at = Some(ended_at);

        let result = TestResult {
            test_type: test.test_type,
            scores,
            recordings: test.recordings.clone(),
            elapsed_ms: (ended_at - test.started_at).num_milliseconds(),
        };

        log::info!(
            "Coordinator: test completed, overall {} after {}ms",
            result.scores.overall,
            result.elapsed_ms
        );
        Ok(result)
    }

    /// Re-read the session from the backend and merge it into the local copy
    pub async fn refresh_session(&mut self) -> Result<Session, TestError> {
        let session_id = self.session_id()?;
        let remote = self
            .services
            .sessions
            .get(&session_id)
            .await
            .map_err(|e| TestError::ConnectionFailed(e.to_string()))?;

        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(TestError::NoSession)?;
        if session.id == remote.id {
            *session = remote;
        }
        Ok(session.clone())
    }

    /// Stop everything and forget the attempt. Safe from any state.
    pub async fn dispose(&mut self) {
        self.discard_capture().await;
        self.capture.cleanup().await;
        self.capture.set_connection(None);
        self.connection.disconnect();
        self.unsubscribe();

        *self.session.lock() = None;
        self.stream_token = None;
        self.test = None;
        self.current_task = None;
        self.response_started_at = None;
        self.live.lock().reset();
        self.connectivity_lost.store(false, Ordering::SeqCst);

        log::info!("Coordinator: disposed");
    }

    /// Sign the user out; the session and test state go with them
    pub async fn logout(&mut self) {
        self.dispose().await;
        if let Err(e) = self.services.auth.logout().await {
            log::warn!("Coordinator: sign-out failed: {}", e);
        }
        log::info!("Coordinator: signed out");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn session_id(&self) -> Result<String, TestError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.id.clone())
            .ok_or(TestError::NoSession)
    }

    fn progress(&self) -> Result<Progress, TestError> {
        self.test
            .as_ref()
            .map(|t| t.progress)
            .ok_or(TestError::NoSession)
    }

    /// Run the effects of `transition`, then commit its progress
    async fn apply(&mut self, transition: Transition) -> Result<(), TestError> {
        for effect in &transition.effects {
            self.run_effect(effect, &transition.next).await?;
        }
        if let Some(test) = self.test.as_mut() {
            test.progress = transition.next;
        }
        Ok(())
    }

    async fn run_effect(&mut self, effect: &Effect, next: &Progress) -> Result<(), TestError> {
        match effect {
            Effect::StartCapture => {
                if !self.capture.is_initialized() {
                    self.capture.initialize()?;
                }
                self.pending_audio = None;
                self.capture.start_recording().await?;
                self.response_started_at = Some(Utc::now());
            }
            // Held until the phase moves on, so a failed step can still submit it
            Effect::StopCapture => {
                if let Some(captured) = self.capture.stop_recording().await {
                    self.pending_audio = Some(captured);
                }
            }
            Effect::SignalTaskStart => {
                self.live.lock().reset();
                self.signal_task_start(next.task_index);
            }
            // Driven by next_task() / complete_test()
            Effect::LoadTask { .. } | Effect::RequestScores => {}
        }
        Ok(())
    }

    fn signal_task_start(&self, task_index: u32) {
        let (Some(test), Some(task)) = (self.test.as_ref(), self.current_task.as_ref()) else {
            return;
        };
        if !self.connection.is_authenticated() {
            log::debug!("Coordinator: stream not authenticated, skipping start_conversation");
            return;
        }
        let message = ClientMessage::start_conversation(test.test_type, &task.task_type, task_index);
        if !self.connection.send(&message) {
            log::warn!("Coordinator: failed to signal start of task {}", task_index);
        }
    }

    async fn discard_capture(&mut self) {
        if let Some(captured) = self.capture.stop_recording().await {
            self.pending_audio = Some(captured);
        }
        self.drop_pending_audio();
    }

    fn drop_pending_audio(&mut self) {
        if let Some(captured) = self.pending_audio.take() {
            log::info!(
                "Coordinator: discarding {}ms of unsubmitted audio",
                captured.duration_ms()
            );
        }
    }

    fn subscribe(&mut self) {
        if !self.subscriptions.is_empty() {
            return;
        }

        let live = self.live.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::Transcription,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::Transcription(t) = event {
                    live.lock().apply_transcription(t);
                }
            }),
        ));

        let live = self.live.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::AiResponse,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::AiResponse(r) = event {
                    live.lock().push_ai_response(r);
                }
            }),
        ));

        let live = self.live.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::RealTimeFeedback,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::RealTimeFeedback(f) = event {
                    live.lock().push_feedback(f);
                }
            }),
        ));

        let live = self.live.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::AudioProcessed,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::AudioProcessed(ack) = event {
                    live.lock().audio_processed(ack);
                }
            }),
        ));

        let live = self.live.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::Error,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::Error { message } = event {
                    live.lock().record_error(message);
                }
            }),
        ));

        let session = self.session.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::SessionUpdated,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::SessionUpdated(update) = event {
                    if let Some(session) = session.lock().as_mut() {
                        merge_session_update(session, update);
                    }
                }
            }),
        ));

        let lost = self.connectivity_lost.clone();
        let live = self.live.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::ReconnectionFailed,
            Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::ReconnectionFailed { attempts } = event {
                    log::error!(
                        "Coordinator: live stream lost after {} reconnection attempts",
                        attempts
                    );
                    lost.store(true, Ordering::SeqCst);
                    live.lock().record_error("Lost connection to the scoring service");
                }
            }),
        ));

        let lost = self.connectivity_lost.clone();
        self.subscriptions.push(self.connection.on(
            EventKind::Authenticated,
            Arc::new(move |_event: &ConnectionEvent| {
                lost.store(false, Ordering::SeqCst);
            }),
        ));
    }

    fn unsubscribe(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.connection.off(id);
        }
    }
}

impl Drop for TestSessionCoordinator {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

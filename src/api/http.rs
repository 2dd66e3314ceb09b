//! reqwest client for the backend session, task, upload and score endpoints.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::types::{
    AudioUpload, CreateSessionRequest, CreatedSession, ScoreReport, Session, SessionStatusReport,
    SubmissionReceipt, TaskContent, TaskSubmission, TestType, UploadMetadata, UploadResult,
};
use super::{ApiError, AudioUploadApi, ScoreApi, SessionApi, TaskApi};

/// Backend error body. Different services use different keys for the message.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP implementation of every backend collaborator
///
/// One `reqwest::Client` is reused across requests (avoids TLS handshake
/// overhead). Requests carry the bearer token given at construction.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Attach the bearer token sent with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, ApiError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("{}: {}", what, e)))?;

        parse_response(response, what).await
    }
}

/// Turn a response into `T`, or into an `ApiError` carrying the backend message
async fn parse_response<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, ApiError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Parse(format!("{}: {}", what, e)));
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    log::error!("Backend: {} failed ({}): {}", what, status.as_u16(), message);

    Err(match status.as_u16() {
        401 | 403 => ApiError::Unauthorized(message),
        code => ApiError::Status {
            status: code,
            message,
        },
    })
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed
            .detail
            .or(parsed.message)
            .or(parsed.error)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl SessionApi for HttpBackend {
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, ApiError> {
        log::info!(
            "Backend: creating {} {:?} session for {}",
            request.test_type,
            request.mode,
            request.user_id
        );
        let builder = self.client.post(self.url("/api/v1/sessions")).json(request);
        self.send_json(builder, "create session").await
    }

    async fn get(&self, session_id: &str) -> Result<Session, ApiError> {
        let builder = self
            .client
            .get(self.url(&format!("/api/v1/sessions/{}", session_id)));
        self.send_json(builder, "get session").await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Session>, ApiError> {
        let builder = self
            .client
            .get(self.url("/api/v1/sessions"))
            .query(&[("user_id", user_id)]);
        self.send_json(builder, "list sessions").await
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatusReport, ApiError> {
        let builder = self
            .client
            .get(self.url(&format!("/api/v1/sessions/{}/status", session_id)));
        self.send_json(builder, "session status").await
    }
}

#[async_trait]
impl TaskApi for HttpBackend {
    async fn start(
        &self,
        test_type: TestType,
        session_id: &str,
        task_index: u32,
    ) -> Result<TaskContent, ApiError> {
        let path = format!(
            "/api/v1/{}/sessions/{}/tasks/{}/start",
            test_type.as_str(),
            session_id,
            task_index
        );
        let builder = self.client.post(self.url(&path));
        self.send_json(builder, "start task").await
    }

    async fn submit_response(
        &self,
        test_type: TestType,
        session_id: &str,
        task_index: u32,
        payload: &TaskSubmission,
    ) -> Result<SubmissionReceipt, ApiError> {
        let path = format!(
            "/api/v1/{}/sessions/{}/tasks/{}/response",
            test_type.as_str(),
            session_id,
            task_index
        );
        let builder = self.client.post(self.url(&path)).json(payload);
        self.send_json(builder, "submit response").await
    }
}

#[async_trait]
impl AudioUploadApi for HttpBackend {
    async fn upload(
        &self,
        file: &AudioUpload,
        session_id: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult, ApiError> {
        log::info!(
            "Backend: uploading {} ({} bytes, {}ms)",
            file.file_name,
            file.bytes.len(),
            file.duration_ms
        );

        let file_part = Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        let metadata_json =
            serde_json::to_string(metadata).map_err(|e| ApiError::Parse(e.to_string()))?;

        let form = Form::new()
            .part("file", file_part)
            .text("session_id", session_id.to_string())
            .text("metadata", metadata_json);

        let builder = self
            .client
            .post(self.url("/api/v1/audio/upload"))
            .multipart(form);
        self.send_json(builder, "upload audio").await
    }
}

#[async_trait]
impl ScoreApi for HttpBackend {
    async fn get(&self, session_id: &str) -> Result<ScoreReport, ApiError> {
        let builder = self
            .client
            .get(self.url(&format!("/api/v1/sessions/{}/score", session_id)));
        self.send_json(builder, "get score").await
    }
}

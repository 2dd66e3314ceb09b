//! Current-user providers.
//!
//! The coordinator only sees the [`AuthProvider`] capability. The HTTP provider
//! asks the auth service who owns the token; [`StaticUser`] is an explicit stub
//! for demos and tests and must be injected deliberately.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::User;
use super::{ApiError, AuthProvider};

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Auth service reply to login/register
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<AuthUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<AuthUser> for User {
    fn from(user: AuthUser) -> Self {
        User {
            id: user.email.clone(),
            email: Some(user.email),
            name: user.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user: Option<AuthUser>,
}

/// Resolves the current user through the auth service (`/api/auth/me`)
pub struct HttpAuthProvider {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl HttpAuthProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    /// Use an already-issued bearer token
    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.lock() = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    /// Exchange credentials for a token; the token is kept for later calls
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let response = self
            .client
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("login: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("login: {}", e)))?;

        match (login.success, login.token, login.user) {
            (true, Some(token), Some(user)) => {
                log::info!("Auth: signed in as {}", user.email);
                *self.token.lock() = Some(token);
                Ok(user.into())
            }
            _ => Err(ApiError::Unauthorized(login.message)),
        }
    }

    async fn fetch_me(&self, token: &str) -> Result<User, ApiError> {
        let response = self
            .client
            .get(format!("{}/api/auth/me", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("current user: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Unauthorized(format!("auth service returned {}", status)));
        }

        let me: MeResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("current user: {}", e)))?;

        match (me.success, me.user) {
            (true, Some(user)) => Ok(user.into()),
            _ => Err(ApiError::Unauthorized("no user for token".to_string())),
        }
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn current_user(&self) -> Option<User> {
        let token = self.token()?;
        match self.fetch_me(&token).await {
            Ok(user) => Some(user),
            Err(e) => {
                log::warn!("Auth: could not resolve current user: {}", e);
                None
            }
        }
    }

    /// Invalidate the token on the server and forget it locally
    async fn logout(&self) -> Result<(), ApiError> {
        let token = self.token.lock().take();
        let Some(token) = token else {
            return Ok(());
        };

        let response = self
            .client
            .post(format!("{}/api/auth/logout", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("logout: {}", e)))?;

        if !response.status().is_success() {
            log::warn!("Auth: logout returned {}", response.status());
        }
        Ok(())
    }
}

/// Fixed user for demos and tests; `StaticUser::signed_out()` resolves nobody
#[derive(Debug, Default)]
pub struct StaticUser {
    user: Mutex<Option<User>>,
}

impl StaticUser {
    pub fn new(user: User) -> Self {
        Self {
            user: Mutex::new(Some(user)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthProvider for StaticUser {
    async fn current_user(&self) -> Option<User> {
        self.user.lock().clone()
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.user.lock().take();
        Ok(())
    }
}

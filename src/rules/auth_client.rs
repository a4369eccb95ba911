//! Auth Service Client
//!
//! Verifies bearer tokens against the external auth service
//! (`GET {auth_url}?token=...` → `{id, username}`) before any policy write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::PolicyError;

/// Default timeout for token verification
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity returned by the auth service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
}

/// Token verification seam
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<AuthUser, PolicyError>;
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: Option<&str>) -> Result<&str, PolicyError> {
    let header = match header {
        Some(value) if !value.is_empty() => value,
        _ => {
            return Err(PolicyError::Unauthorized(
                "Missing Authorization header".to_string(),
            ))
        }
    };

    let parts: Vec<&str> = header.split(' ').collect();
    match parts.as_slice() {
        ["Bearer", token] if !token.is_empty() => Ok(*token),
        _ => Err(PolicyError::Unauthorized(
            "Invalid Authorization header format".to_string(),
        )),
    }
}

/// HTTP client for the auth service
pub struct HttpAuthClient {
    auth_url: String,
    client: reqwest::Client,
}

impl HttpAuthClient {
    pub fn new(auth_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(auth_url, DEFAULT_AUTH_TIMEOUT)
    }

    pub fn with_timeout(auth_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            auth_url: auth_url.into(),
            client,
        })
    }
}

#[async_trait]
impl AuthVerifier for HttpAuthClient {
    async fn verify_token(&self, token: &str) -> Result<AuthUser, PolicyError> {
        let response = self
            .client
            .get(&self.auth_url)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| {
                warn!("Auth service request failed: {}", e);
                PolicyError::Unauthorized(format!("error verifying token: {}", e))
            })?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED => return Err(PolicyError::InvalidToken),
            reqwest::StatusCode::BAD_REQUEST => {
                return Err(PolicyError::Unauthorized("request is invalid".to_string()))
            }
            status if !status.is_success() => {
                return Err(PolicyError::Unauthorized(format!(
                    "auth service returned {}",
                    status
                )))
            }
            _ => {}
        }

        let body = response.bytes().await.map_err(|e| {
            PolicyError::Unauthorized(format!("failed to read auth response: {}", e))
        })?;
        let user: AuthUser = serde_json::from_slice(&body).map_err(|e| {
            PolicyError::Unauthorized(format!("failed to decode auth response: {}", e))
        })?;

        debug!("Verified token for user {} ({})", user.username, user.id);
        Ok(user)
    }
}

//! Identity verification against the external user-info service.
//!
//! A single `GET <base>/user/info/{user_id}` with the bearer token attached.
//! One attempt only: any failure fails the handshake.

use chatgate_core::{GateError, GateResult};
use reqwest::{StatusCode, Url};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Why a verification attempt failed.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("identity service returned status {0}")]
    Status(u16),

    #[error("identity service timed out")]
    Timeout,

    #[error("identity service unreachable: {0}")]
    Network(String),

    #[error("invalid verification request: {0}")]
    InvalidInput(String),
}

impl From<VerifyError> for GateError {
    fn from(e: VerifyError) -> Self {
        GateError::AuthFailed(e.to_string())
    }
}

/// Exchanges a bearer token and user id for a verified profile blob.
pub trait IdentityVerifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        bearer: &'a str,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, VerifyError>> + Send + 'a>>;
}

/// [`IdentityVerifier`] backed by the HTTP user-info endpoint.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpVerifier {
    /// Create a verifier for `base_url` with a hard per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> GateResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GateError::Config(format!("invalid identity url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GateError::Config(format!(
                "identity url {base_url} cannot be a base"
            )));
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// URL of the user-info resource for `user_id`.
    ///
    /// `.` and `..` are rejected: the URL path normalisation would drop them
    /// and the request would no longer name a user.
    pub fn user_info_url(&self, user_id: &str) -> Result<Url, VerifyError> {
        if user_id.is_empty() || user_id == "." || user_id == ".." {
            return Err(VerifyError::InvalidInput(format!("invalid user id {user_id:?}")));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| VerifyError::InvalidInput("identity url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["user", "info", user_id]);
        Ok(url)
    }

    async fn fetch_profile(&self, bearer: &str, user_id: &str) -> Result<String, VerifyError> {
        let url = self.user_info_url(user_id)?;
        debug!(url = %url, "verifying identity");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(VerifyError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(classify)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

impl IdentityVerifier for HttpVerifier {
    fn verify<'a>(
        &'a self,
        bearer: &'a str,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, VerifyError>> + Send + 'a>> {
        Box::pin(self.fetch_profile(bearer, user_id))
    }
}

fn classify(e: reqwest::Error) -> VerifyError {
    if e.is_timeout() {
        VerifyError::Timeout
    } else {
        VerifyError::Network(e.to_string())
    }
}

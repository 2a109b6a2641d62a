//! HTTP plumbing shared by the REST provider clients.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Errors returned by a cloud REST API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ApiError {
    /// Raised when the addressed resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Resource path or identifier.
        resource: String,
    },
    /// Raised for any other non-success HTTP status.
    #[error("{resource} returned HTTP {status}: {message}")]
    Status {
        /// Resource path or identifier.
        resource: String,
        /// HTTP status code.
        status: u16,
        /// Response body, usually a JSON error document.
        message: String,
    },
    /// Raised when the request never produced a response.
    #[error("request failed: {0}")]
    Transport(String),
    /// Raised when a response body cannot be decoded.
    #[error("decoding {resource}: {message}")]
    Decode {
        /// Resource path or identifier.
        resource: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when credentials cannot be obtained or applied.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    /// Returns `true` when the provider reported the resource as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Maps non-success statuses to [`ApiError`].
pub(crate) async fn check(
    response: reqwest::Response,
    resource: &str,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound {
            resource: resource.to_owned(),
        });
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            resource: resource.to_owned(),
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

/// Checks the status and decodes a JSON body.
pub(crate) async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    resource: &str,
) -> Result<T, ApiError> {
    let body = check(response, resource).await?.bytes().await?;
    serde_json::from_slice(&body).map_err(|err| ApiError::Decode {
        resource: resource.to_owned(),
        message: err.to_string(),
    })
}

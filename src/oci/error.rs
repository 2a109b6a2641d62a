//! Error types for the OCI provider.

use std::time::Duration;

use thiserror::Error;

use super::signer::SignerError;
use crate::http::ApiError;
use crate::poll::PollStop;

/// Errors raised by the OCI provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OciError {
    /// Raised when the launch request is rejected.
    #[error("launching instance {instance}: {source}")]
    Provision {
        /// Display name.
        instance: String,
        /// API failure.
        #[source]
        source: ApiError,
    },
    /// Raised when a terminate, stop or image request is rejected.
    #[error("{action} on {target} rejected: {source}")]
    Request {
        /// Requested action.
        action: &'static str,
        /// Instance or image identifier.
        target: String,
        /// API failure.
        #[source]
        source: ApiError,
    },
    /// Raised when a status check fails while waiting.
    #[error("polling {action} on {target}: {source}")]
    Poll {
        /// Action being waited on.
        action: &'static str,
        /// Instance or image identifier.
        target: String,
        /// API failure.
        #[source]
        source: ApiError,
    },
    /// Raised when a wait exceeds its ceiling.
    #[error("timed out after {waited:?} waiting for {action} on {target}")]
    PollTimeout {
        /// Action being waited on.
        action: &'static str,
        /// Instance or image identifier.
        target: String,
        /// Ceiling that elapsed.
        waited: Duration,
    },
    /// Raised when the caller cancels a wait.
    #[error("waiting for {action} on {target} cancelled")]
    Cancelled {
        /// Action being waited on.
        action: &'static str,
        /// Instance or image identifier.
        target: String,
    },
    /// Raised when a resource settles in a state the wait did not expect.
    #[error("{target} reached lifecycle state {state} while waiting for {action}")]
    UnexpectedState {
        /// Action being waited on.
        action: &'static str,
        /// Instance or image identifier.
        target: String,
        /// Lifecycle state reported by the provider.
        state: String,
    },
    /// Raised when no image matches the requested operating system.
    #[error("no image found for operating system {operating_system}")]
    NoImage {
        /// Operating system label searched for.
        operating_system: String,
    },
    /// Raised when the API credentials cannot be loaded.
    #[error("loading OCI credentials: {0}")]
    Credentials(#[from] SignerError),
}

impl OciError {
    pub(super) fn from_poll(stop: PollStop<Self>, action: &'static str, id: &str) -> Self {
        match stop {
            PollStop::Failed(err) => err,
            PollStop::TimedOut(waited) => Self::PollTimeout {
                action,
                target: id.to_owned(),
                waited,
            },
            PollStop::Cancelled => Self::Cancelled {
                action,
                target: id.to_owned(),
            },
        }
    }
}

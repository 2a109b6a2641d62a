//! Error types for the Compute Engine provider.

use std::time::Duration;

use thiserror::Error;

use crate::http::ApiError;
use crate::poll::PollStop;

/// Errors raised by the Compute Engine provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GceError {
    /// Raised when the insert request is rejected (quota, bad image, and so
    /// on).
    #[error("creating instance {instance}: {source}")]
    Provision {
        /// Instance name.
        instance: String,
        /// API failure.
        #[source]
        source: ApiError,
    },
    /// Raised when a stop, delete or image request is rejected.
    #[error("{action} on {target} rejected: {source}")]
    Request {
        /// Requested action.
        action: &'static str,
        /// Instance or image name.
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
        /// Instance or image name.
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
        /// Instance or image name.
        target: String,
        /// Ceiling that elapsed.
        waited: Duration,
    },
    /// Raised when the caller cancels a wait.
    #[error("waiting for {action} on {target} cancelled")]
    Cancelled {
        /// Action being waited on.
        action: &'static str,
        /// Instance or image name.
        target: String,
    },
    /// Raised when an operation finishes with errors.
    #[error("{action} on {target} failed: {message}")]
    OperationFailed {
        /// Action the operation performed.
        action: &'static str,
        /// Instance or image name.
        target: String,
        /// Errors recorded on the operation.
        message: String,
    },
    /// Raised when the instance settles in a state other than `RUNNING`.
    #[error("instance {instance} reached status {status} while waiting to run")]
    UnexpectedStatus {
        /// Instance name.
        instance: String,
        /// Status reported by the provider.
        status: String,
    },
    /// Raised when a snapshot is requested for an instance without a boot
    /// disk reference.
    #[error("instance {instance} has no boot disk to snapshot")]
    MissingBootDisk {
        /// Instance name.
        instance: String,
    },
}

impl GceError {
    pub(super) fn from_poll(stop: PollStop<ApiError>, action: &'static str, name: &str) -> Self {
        let target = name.to_owned();
        match stop {
            PollStop::Failed(source) => Self::Poll {
                action,
                target,
                source,
            },
            PollStop::TimedOut(waited) => Self::PollTimeout {
                action,
                target,
                waited,
            },
            PollStop::Cancelled => Self::Cancelled { action, target },
        }
    }
}

//! Bounded, cancellable SSH dialing.
//!
//! A freshly created machine needs a while before its SSH daemon accepts
//! connections. [`RetryingDialer`] retries at a fixed interval up to an
//! attempt budget and gives up immediately when the run is cancelled.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::keypair::SshCredentials;
use crate::session::{Transport, TransportError, TransportFuture};

/// Attempt budget for reaching a booting machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DialPolicy {
    /// Sleep between failed attempts.
    pub interval: Duration,
    /// Attempts made before giving up, including the first.
    pub max_attempts: u32,
}

impl DialPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Default budget: one attempt every two seconds for a little over three
/// minutes.
pub const SSH_DIAL: DialPolicy = DialPolicy::new(Duration::from_secs(2), 100);

impl Default for DialPolicy {
    fn default() -> Self {
        SSH_DIAL
    }
}

/// Network endpoint to dial.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DialTarget {
    /// Network name; only `tcp` is supported by the SSH connector.
    pub network: String,
    /// `host:port` address.
    pub address: String,
}

impl DialTarget {
    /// Builds a TCP target for `host` on `port`.
    #[must_use]
    pub fn tcp(host: &str, port: u16) -> Self {
        let address = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            network: String::from("tcp"),
            address,
        }
    }
}

/// Opens one authenticated connection per call, without retrying.
pub trait Connector: Send + Sync {
    /// Connection type produced on success.
    type Transport: Transport;

    /// Attempts a single connection to `target`.
    fn connect<'a>(
        &'a self,
        target: &'a DialTarget,
        credentials: &'a SshCredentials,
    ) -> TransportFuture<'a, Self::Transport>;
}

/// Errors raised by [`RetryingDialer::dial`].
#[derive(Debug, Error)]
pub enum DialError {
    /// Raised when every attempt in the budget failed.
    #[error("ssh to {address} not reachable after {attempts} attempts: {source}")]
    Exhausted {
        /// Target address.
        address: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: TransportError,
    },
    /// Raised when the caller cancelled before a connection succeeded.
    #[error("dialing {address} cancelled after {attempts} attempts")]
    Cancelled {
        /// Target address.
        address: String,
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

/// Dials with fixed-interval retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryingDialer {
    policy: DialPolicy,
}

impl RetryingDialer {
    /// Creates a dialer using `policy`.
    #[must_use]
    pub const fn new(policy: DialPolicy) -> Self {
        Self { policy }
    }

    /// Returns the active policy.
    #[must_use]
    pub const fn policy(&self) -> DialPolicy {
        self.policy
    }

    /// Connects to `target`, retrying failed attempts until the budget is
    /// spent or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`DialError::Exhausted`] with the last failure once
    /// `max_attempts` attempts have failed and [`DialError::Cancelled`] when
    /// cancellation is observed before, during or between attempts.
    pub async fn dial<C: Connector>(
        &self,
        connector: &C,
        target: &DialTarget,
        credentials: &SshCredentials,
        cancel: &CancellationToken,
    ) -> Result<C::Transport, DialError> {
        info!(address = %target.address, "dialing ssh");
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DialError::Cancelled {
                    address: target.address.clone(),
                    attempts: attempt,
                });
            }
            attempt += 1;

            let connected = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(DialError::Cancelled {
                        address: target.address.clone(),
                        attempts: attempt,
                    });
                }
                result = connector.connect(target, credentials) => result,
            };
            let err = match connected {
                Ok(transport) => {
                    info!(address = %target.address, attempt, "ssh connected");
                    return Ok(transport);
                }
                Err(err) => err,
            };
            if attempt >= max_attempts {
                return Err(DialError::Exhausted {
                    address: target.address.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            info!(address = %target.address, attempt, error = %err, "retrying ssh connection");
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(DialError::Cancelled {
                        address: target.address.clone(),
                        attempts: attempt,
                    });
                }
                () = sleep(self.policy.interval) => {}
            }
        }
    }
}

//! Remote command execution over one authenticated connection.
//!
//! [`RemoteSession`] wraps a [`Transport`] (the live SSH connection) and adds
//! the two operations the bootstrap sequence needs: running a command with
//! combined output capture, and pushing a small file with the `scp` sink
//! protocol. Secret placeholders are expanded only in the bytes sent to the
//! remote host; everything that is logged or returned uses the template or
//! redacted text.

pub mod scp;
pub mod secret;
pub mod ssh;

use std::future::Future;
use std::pin::Pin;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{error, info};

pub use scp::ScpError;
pub use secret::{JIT_CONFIG_ENV, Secrets};

/// Future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Raw result of one remote process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutput {
    /// Exit status reported by the remote side, when one was sent.
    pub exit_status: Option<u32>,
    /// Standard output and standard error, interleaved in arrival order.
    pub output: Vec<u8>,
}

/// Errors raised by a transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the TCP connection or SSH handshake fails.
    #[error("connecting to {address}: {message}")]
    Connect {
        /// Target address.
        address: String,
        /// Underlying error text.
        message: String,
    },
    /// Raised when the server rejects the public key.
    #[error("ssh authentication rejected for user {user}")]
    AuthenticationRejected {
        /// Login user.
        user: String,
    },
    /// Raised when a session channel cannot be opened or fails mid-command.
    #[error("ssh channel failed: {0}")]
    Channel(String),
}

/// One authenticated connection able to run remote processes.
pub trait Transport: Send + Sync {
    /// Runs `command`, writes `stdin` (if any) followed by end-of-file, and
    /// collects combined output until the remote process exits.
    fn exec<'a>(&'a self, command: &'a str, stdin: Option<&'a [u8]>)
    -> TransportFuture<'a, ExecOutput>;

    /// Closes the connection. Further calls to `exec` fail.
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// Output of a successful remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Command template as written by the caller, placeholders intact.
    pub command: String,
    /// Combined output with secret values masked.
    pub output: String,
}

/// Errors raised while running commands or pushing files.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Raised when the session fails before the command reports a status.
    #[error("running command {command:?}: {source}")]
    Session {
        /// Command template.
        command: String,
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// Raised when the command exits non-zero or without a status.
    #[error("command {command:?} exited with {}: {output}", describe_status(.status))]
    Failed {
        /// Command template.
        command: String,
        /// Exit status, when the remote side reported one.
        status: Option<u32>,
        /// Combined output with secret values masked.
        output: String,
    },
    /// Raised when the file push is rejected or malformed.
    #[error("copying {name} to {dir}: {source}")]
    Copy {
        /// Remote directory.
        dir: String,
        /// Remote file name.
        name: String,
        /// Protocol failure.
        #[source]
        source: ScpError,
    },
}

fn describe_status(status: &Option<u32>) -> String {
    status.map_or_else(|| String::from("no exit status"), |code| format!("status {code}"))
}

/// Live session used by the bootstrap sequence.
#[derive(Debug)]
pub struct RemoteSession<T> {
    transport: T,
    secrets: Secrets,
}

impl<T: Transport> RemoteSession<T> {
    /// Wraps a connected transport.
    pub const fn new(transport: T, secrets: Secrets) -> Self {
        Self { transport, secrets }
    }

    /// Runs `command` and captures its combined output. No retry.
    ///
    /// The command is logged as written; `${NAME}` placeholders are expanded
    /// only in the string sent to the remote host.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Session`] when the transport fails and
    /// [`CommandError::Failed`] when the command exits non-zero.
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput, CommandError> {
        info!(command, "running ssh command");
        let expanded = self.secrets.expand(command);
        let result = self
            .transport
            .exec(&expanded, None)
            .await
            .map_err(|source| CommandError::Session {
                command: command.to_owned(),
                source,
            })?;

        let output = self
            .secrets
            .redact(&String::from_utf8_lossy(&result.output));
        if result.exit_status != Some(0) {
            error!(command, status = ?result.exit_status, output = %output, "ssh command failed");
            return Err(CommandError::Failed {
                command: command.to_owned(),
                status: result.exit_status,
                output,
            });
        }

        info!(command, output = %output, "command succeeded");
        Ok(CommandOutput {
            command: command.to_owned(),
            output,
        })
    }

    /// Pushes `contents` to `dir/name` with permissions `mode` (for example
    /// `0755`).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Copy`] when the payload cannot be framed or the
    /// sink rejects it, and [`CommandError::Session`] when the transport
    /// fails.
    pub async fn write_file(
        &self,
        dir: &str,
        name: &str,
        contents: &[u8],
        mode: &str,
    ) -> Result<(), CommandError> {
        let copy_error = |source| CommandError::Copy {
            dir: dir.to_owned(),
            name: name.to_owned(),
            source,
        };
        let payload = scp::payload(mode, name, contents).map_err(copy_error)?;
        let command = format!("scp -t {}", escape(dir.into()));

        info!(dir, name, bytes = contents.len(), "copying file over scp");
        let result = self
            .transport
            .exec(&command, Some(&payload))
            .await
            .map_err(|source| CommandError::Session {
                command: command.clone(),
                source,
            })?;

        scp::verify_acks(&result.output).map_err(copy_error)?;
        if result.exit_status != Some(0) {
            return Err(CommandError::Failed {
                command,
                status: result.exit_status,
                output: self
                    .secrets
                    .redact(&String::from_utf8_lossy(&result.output)),
            });
        }
        Ok(())
    }

    /// Closes the underlying connection, logging failures.
    pub async fn close(&self) {
        if let Err(err) = self.transport.close().await {
            error!(error = %err, "closing ssh connection");
        }
    }
}

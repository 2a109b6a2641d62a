//! SSH transport built on `russh`.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{ExecOutput, Transport, TransportError, TransportFuture};
use crate::dial::{Connector, DialTarget};
use crate::keypair::SshCredentials;

/// Per-attempt connection timeout, matching a short TCP handshake budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Host-key policy for freshly created machines.
///
/// The instance was created seconds ago by this process, so there is no
/// known host key to compare against.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens authenticated SSH connections.
#[derive(Clone, Debug)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    /// Creates a connector using [`CONNECT_TIMEOUT`] per attempt.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Overrides the per-attempt timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for SshConnector {
    type Transport = SshTransport;

    fn connect<'a>(
        &'a self,
        target: &'a DialTarget,
        credentials: &'a SshCredentials,
    ) -> TransportFuture<'a, SshTransport> {
        Box::pin(async move {
            let connect_error = |message: String| TransportError::Connect {
                address: target.address.clone(),
                message,
            };
            if target.network != "tcp" {
                return Err(connect_error(format!(
                    "unsupported network {:?}",
                    target.network
                )));
            }

            let config = Arc::new(client::Config::default());
            let connect = client::connect(config, target.address.as_str(), AcceptAnyHostKey);
            let mut handle = timeout(self.connect_timeout, connect)
                .await
                .map_err(|_| connect_error(String::from("timed out")))?
                .map_err(|err| connect_error(err.to_string()))?;

            let key = PrivateKeyWithHashAlg::new(Arc::clone(&credentials.key), None);
            let auth = handle
                .authenticate_publickey(credentials.user.as_str(), key)
                .await
                .map_err(|err| connect_error(err.to_string()))?;
            if !auth.success() {
                return Err(TransportError::AuthenticationRejected {
                    user: credentials.user.clone(),
                });
            }

            Ok(SshTransport {
                handle: Mutex::new(handle),
            })
        })
    }
}

/// One authenticated SSH connection.
pub struct SshTransport {
    handle: Mutex<Handle<AcceptAnyHostKey>>,
}

fn channel_error(err: &russh::Error) -> TransportError {
    TransportError::Channel(err.to_string())
}

impl Transport for SshTransport {
    fn exec<'a>(
        &'a self,
        command: &'a str,
        stdin: Option<&'a [u8]>,
    ) -> TransportFuture<'a, ExecOutput> {
        Box::pin(async move {
            let mut channel = {
                let handle = self.handle.lock().await;
                handle
                    .channel_open_session()
                    .await
                    .map_err(|err| channel_error(&err))?
            };
            channel
                .exec(true, command)
                .await
                .map_err(|err| channel_error(&err))?;
            if let Some(input) = stdin {
                channel
                    .data(input)
                    .await
                    .map_err(|err| channel_error(&err))?;
            }
            channel.eof().await.map_err(|err| channel_error(&err))?;

            let mut result = ExecOutput::default();
            while let Some(message) = channel.wait().await {
                match message {
                    ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                        result.output.extend_from_slice(&data);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        result.exit_status = Some(exit_status);
                    }
                    _ => {}
                }
            }
            Ok(result)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.handle
                .lock()
                .await
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|err| channel_error(&err))
        })
    }
}

//! Orchestrates one disposable machine from creation to guaranteed deletion.
//!
//! The run workflow creates an instance with a fresh SSH key in its metadata,
//! waits for it to run, dials its SSH endpoint, executes a bootstrap plan,
//! optionally stops and snapshots it, and deletes it. Deletion happens on
//! every exit path once creation succeeded, including cancellation and
//! panics, and always uses a fresh cancellation token.

mod plan;

use std::panic::{AssertUnwindSafe, resume_unwind};

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dial::{Connector, DialError, DialPolicy, DialTarget, RetryingDialer, SSH_DIAL};
use crate::keypair::{EphemeralKeyPair, KeyPairError};
use crate::provider::{AddressKind, Image, Instance, InstanceState, Provider};
use crate::session::{CommandError, CommandOutput, RemoteSession, Secrets, Transport};

pub use plan::{
    BUILD_SCRIPT_NAME, BootstrapPlan, BootstrapStep, TIMESTAMP_FORMAT, builder_instance_name,
    default_image_name, host_name, oci_runner_name, timestamp,
};

const SSH_PORT: u16 = 22;

/// How the orchestrator reaches the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    /// Login user authorised with the ephemeral key.
    pub ssh_user: String,
    /// SSH port.
    pub ssh_port: u16,
    /// Address family to dial.
    pub address: AddressKind,
}

impl SessionOptions {
    /// Dials `ssh_user` on port 22 over the internal address.
    #[must_use]
    pub fn new(ssh_user: impl Into<String>) -> Self {
        Self {
            ssh_user: ssh_user.into(),
            ssh_port: SSH_PORT,
            address: AddressKind::Internal,
        }
    }

    /// Selects which address to dial.
    #[must_use]
    pub const fn with_address(mut self, address: AddressKind) -> Self {
        self.address = address;
        self
    }
}

/// Raised when the final delete fails. Logged and reported, never returned
/// as the run's error.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("deleting instance {instance}: {message}")]
pub struct CleanupError {
    /// Instance name.
    pub instance: String,
    /// Provider error text.
    pub message: String,
}

/// Result of a successful run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    /// Provider identifier of the instance.
    pub instance_id: String,
    /// Instance name.
    pub instance_name: String,
    /// Outputs of the bootstrap commands, secrets masked.
    pub outputs: Vec<CommandOutput>,
    /// Image produced by the plan's snapshot step.
    pub image: Option<Image>,
    /// Teardown failure, when the instance could not be deleted.
    pub cleanup: Option<CleanupError>,
}

/// Errors surfaced while performing a run.
#[derive(Debug, Error)]
pub enum RunError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when the ephemeral key cannot be generated. No instance exists.
    #[error("preparing ssh credentials: {0}")]
    KeyPair(#[from] KeyPairError),
    /// Raised when creating the instance fails.
    #[error("failed to create instance: {0}")]
    Provision(#[source] ProviderError),
    /// Raised when the instance does not reach the running state.
    #[error("instance {instance} did not become ready: {source}")]
    Wait {
        /// Instance name.
        instance: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the running instance exposes no address of the requested
    /// kind.
    #[error("instance {instance} has no {kind} address")]
    AddressResolution {
        /// Instance name.
        instance: String,
        /// Address kind that was requested.
        kind: AddressKind,
    },
    /// Raised when SSH never became reachable.
    #[error("connecting to instance {instance}: {source}")]
    Dial {
        /// Instance name.
        instance: String,
        /// Dial failure.
        #[source]
        source: DialError,
    },
    /// Raised when a bootstrap step fails; later steps are not run.
    #[error("bootstrap step {step} on instance {instance} failed: {source}")]
    Command {
        /// Instance name.
        instance: String,
        /// One-based position of the failed step.
        step: usize,
        /// Outputs of the commands that completed before the failure.
        completed: Vec<CommandOutput>,
        /// Command failure.
        #[source]
        source: CommandError,
    },
    /// Raised when the run is cancelled between or during bootstrap steps.
    #[error("run on instance {instance} cancelled")]
    Cancelled {
        /// Instance name.
        instance: String,
        /// Outputs of the commands that completed before cancellation.
        completed: Vec<CommandOutput>,
    },
    /// Raised when stopping the instance before a snapshot fails.
    #[error("stopping instance {instance}: {source}")]
    Stop {
        /// Instance name.
        instance: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the snapshot fails.
    #[error("creating image {image} from instance {instance}: {source}")]
    Snapshot {
        /// Instance name.
        instance: String,
        /// Requested image name.
        image: String,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
}

/// Drives [`Provider`], [`RetryingDialer`] and [`RemoteSession`] through one
/// run.
#[derive(Debug)]
pub struct LifecycleOrchestrator<P, C> {
    provider: P,
    connector: C,
    dialer: RetryingDialer,
    session: SessionOptions,
}

impl<P, C> LifecycleOrchestrator<P, C>
where
    P: Provider + Sync,
    C: Connector,
{
    /// Creates an orchestrator using the default dial budget.
    #[must_use]
    pub const fn new(provider: P, connector: C, session: SessionOptions) -> Self {
        Self {
            provider,
            connector,
            dialer: RetryingDialer::new(SSH_DIAL),
            session,
        }
    }

    /// Overrides the dial budget.
    #[must_use]
    pub const fn with_dial_policy(mut self, policy: DialPolicy) -> Self {
        self.dialer = RetryingDialer::new(policy);
        self
    }

    /// Returns the wrapped provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Runs `plan` on a fresh instance built from `spec`.
    ///
    /// Once creation succeeds the instance is deleted before this returns,
    /// whatever happens afterwards. A failed delete is logged and recorded in
    /// [`RunReport::cleanup`] but never replaces the run's own outcome. A
    /// panic in a later step is re-raised after the delete.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] for the first step that fails.
    pub async fn execute(
        &self,
        spec: &P::Spec,
        plan: &BootstrapPlan,
        secrets: Secrets,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError<P::Error>> {
        let keys = EphemeralKeyPair::generate()?;
        let authorized = keys.authorized_key(&self.session.ssh_user);
        let mut instance = self
            .provider
            .create(spec, &authorized, cancel)
            .await
            .map_err(RunError::Provision)?;
        info!(instance = %instance.name, id = %instance.id, "instance created");

        let outcome = AssertUnwindSafe(self.drive(&mut instance, &keys, plan, secrets, cancel))
            .catch_unwind()
            .await;
        let cleanup = self.cleanup(&mut instance).await;

        match outcome {
            Ok(Ok(report)) => Ok(RunReport { cleanup, ..report }),
            Ok(Err(err)) => {
                error!(instance = %instance.name, error = %err, "run failed");
                Err(err)
            }
            Err(panic) => resume_unwind(panic),
        }
    }

    async fn drive(
        &self,
        instance: &mut Instance,
        keys: &EphemeralKeyPair,
        plan: &BootstrapPlan,
        secrets: Secrets,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError<P::Error>> {
        if let Err(source) = self.provider.wait_ready(instance, cancel).await {
            return Err(RunError::Wait {
                instance: instance.name.clone(),
                source,
            });
        }

        let kind = self.session.address;
        let address = match kind {
            AddressKind::Internal => self.provider.resolve_internal_address(instance),
            AddressKind::External => self.provider.resolve_external_address(instance),
        }
        .ok_or_else(|| RunError::AddressResolution {
            instance: instance.name.clone(),
            kind,
        })?;
        info!(instance = %instance.name, address = %address, kind = %kind, "resolved address");

        let target = DialTarget::tcp(&address, self.session.ssh_port);
        let credentials = keys.credentials(&self.session.ssh_user);
        let transport = self
            .dialer
            .dial(&self.connector, &target, &credentials, cancel)
            .await
            .map_err(|source| RunError::Dial {
                instance: instance.name.clone(),
                source,
            })?;

        let session = RemoteSession::new(transport, secrets);
        let bootstrap = Self::bootstrap(&session, &instance.name, plan, cancel).await;
        session.close().await;
        let outputs = bootstrap?;

        let image = match &plan.snapshot {
            Some(name) => Some(self.stop_and_snapshot(instance, name, cancel).await?),
            None => None,
        };

        Ok(RunReport {
            instance_id: instance.id.clone(),
            instance_name: instance.name.clone(),
            outputs,
            image,
            cleanup: None,
        })
    }

    async fn bootstrap<T: Transport>(
        session: &RemoteSession<T>,
        instance: &str,
        plan: &BootstrapPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommandOutput>, RunError<P::Error>> {
        let mut completed = Vec::with_capacity(plan.steps.len());
        for (index, step) in plan.steps.iter().enumerate() {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = run_step(session, step) => Some(result),
            };
            match outcome {
                None => {
                    return Err(RunError::Cancelled {
                        instance: instance.to_owned(),
                        completed,
                    });
                }
                Some(Ok(output)) => completed.extend(output),
                Some(Err(source)) => {
                    return Err(RunError::Command {
                        instance: instance.to_owned(),
                        step: index + 1,
                        completed,
                        source,
                    });
                }
            }
        }
        Ok(completed)
    }

    async fn stop_and_snapshot(
        &self,
        instance: &mut Instance,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<Image, RunError<P::Error>> {
        if let Err(source) = self.provider.stop(instance, cancel).await {
            return Err(RunError::Stop {
                instance: instance.name.clone(),
                source,
            });
        }
        let created = self
            .provider
            .snapshot(instance, image, cancel)
            .await
            .map_err(|source| RunError::Snapshot {
                instance: instance.name.clone(),
                image: image.to_owned(),
                source,
            })?;
        info!(image = %created.name, reference = %created.reference, "image ready");
        Ok(created)
    }

    async fn cleanup(&self, instance: &mut Instance) -> Option<CleanupError> {
        match instance.state {
            InstanceState::Terminated => return None,
            InstanceState::Failed => {
                warn!(
                    instance = %instance.name,
                    id = %instance.id,
                    "teardown already failed once; remove it manually"
                );
                return Some(CleanupError {
                    instance: instance.name.clone(),
                    message: String::from("teardown after a failed start did not complete"),
                });
            }
            _ => {}
        }
        match self
            .provider
            .delete(instance, &CancellationToken::new())
            .await
        {
            Ok(()) => {
                info!(instance = %instance.name, "instance deleted");
                None
            }
            Err(err) => {
                error!(
                    instance = %instance.name,
                    id = %instance.id,
                    error = %err,
                    "deleting instance failed; remove it manually"
                );
                Some(CleanupError {
                    instance: instance.name.clone(),
                    message: err.to_string(),
                })
            }
        }
    }
}

async fn run_step<T: Transport>(
    session: &RemoteSession<T>,
    step: &BootstrapStep,
) -> Result<Option<CommandOutput>, CommandError> {
    match step {
        BootstrapStep::Upload {
            dir,
            name,
            contents,
            mode,
        } => session
            .write_file(dir, name, contents, mode)
            .await
            .map(|()| None),
        BootstrapStep::Run(command) => session.run_command(command).await.map(Some),
    }
}

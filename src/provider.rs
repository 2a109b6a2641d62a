//! Provider abstraction for disposable compute instances.
//!
//! A provider creates, inspects, stops, snapshots and deletes one cloud
//! virtual machine at a time. Two families exist: operation-based providers
//! (mutating calls return an asynchronous handle that is polled until done)
//! and state-based providers (the instance resource itself is polled). The
//! [`Provider`] trait only fixes the externally observed contract: every call
//! blocks until a clear success or failure outcome is known.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// Lifecycle state of an [`Instance`], abstracted over providers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Creation has been submitted but nothing is materialised yet.
    Requested,
    /// The provider is allocating or booting the machine.
    Provisioning,
    /// The machine is up; the only state usable for bootstrap.
    Running,
    /// A stop request is in flight.
    Stopping,
    /// The machine is stopped and its disks are quiescent.
    Stopped,
    /// A termination request is in flight.
    Terminating,
    /// The machine is gone. Cleanup considers this state done.
    Terminated,
    /// The provider reported an unrecoverable failure, or tearing down a
    /// machine that never became ready did not complete. Nothing retries
    /// from here.
    Failed,
}

impl InstanceState {
    /// Returns `true` for states from which no further provider calls are
    /// issued.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One network attachment of an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkInterface {
    /// Private address inside the provider network, when assigned.
    pub internal_address: Option<String>,
    /// Public address reachable from outside the network, when assigned.
    pub external_address: Option<String>,
}

/// A cloud virtual machine owned by exactly one orchestrator run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider-assigned identifier.
    pub id: String,
    /// Caller-chosen name, unique per run.
    pub name: String,
    /// Zone, region or availability domain hosting the instance.
    pub location: String,
    /// Last state observed from the provider.
    pub state: InstanceState,
    /// Network attachments, discovered once the instance is running.
    pub interfaces: Vec<NetworkInterface>,
    /// Provider reference to the boot disk, used for snapshots.
    pub boot_disk: Option<String>,
}

impl Instance {
    /// Returns the first non-empty internal address across all interfaces.
    #[must_use]
    pub fn internal_address(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .filter_map(|nic| nic.internal_address.as_deref())
            .find(|address| !address.is_empty())
    }

    /// Returns the first non-empty external address across all interfaces.
    #[must_use]
    pub fn external_address(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .filter_map(|nic| nic.external_address.as_deref())
            .find(|address| !address.is_empty())
    }
}

/// Boot-disk image produced by [`Provider::snapshot`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Image {
    /// Provider-assigned identifier.
    pub id: String,
    /// Image name or display name.
    pub name: String,
    /// Provider link or OCID usable to launch new instances.
    pub reference: String,
}

/// Public key entry injected into instance metadata at creation time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthorizedKey {
    /// Login user the key is authorised for.
    pub user: String,
    /// Key in OpenSSH authorized-keys text form.
    pub openssh: String,
}

/// Which address the orchestrator should dial.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AddressKind {
    /// Use the private network address.
    #[default]
    Internal,
    /// Use the public address.
    External,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "internal",
            Self::External => "external",
        })
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Capability set implemented by every cloud provider.
///
/// Methods that wait (`create`, `wait_ready`, `stop`, `delete`, `snapshot`)
/// observe `cancel` between poll iterations. Methods that change the
/// lifecycle update `instance.state` in place, so callers can tell whether a
/// teardown already happened.
pub trait Provider {
    /// Provider specific creation parameters.
    type Spec: Send + Sync;
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits a creation request carrying `key` in the instance metadata.
    ///
    /// A creation that fails after submission deletes the partially built
    /// instance before returning the error.
    fn create<'a>(
        &'a self,
        spec: &'a Self::Spec,
        key: &'a AuthorizedKey,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Instance, Self::Error>;

    /// Fetches the current view of `instance` from the provider.
    fn get<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Instance, Self::Error>;

    /// Polls until `instance` is running and its addresses are known.
    ///
    /// When waiting fails the instance is deleted before the error is
    /// returned; `instance.state` is then [`InstanceState::Terminated`].
    fn wait_ready<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Requests a stop and polls until the instance is stopped.
    fn stop<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Requests termination and polls until the instance is gone. A
    /// not-found answer counts as success.
    fn delete<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Creates an image from the instance's boot disk and polls until it is
    /// available.
    fn snapshot<'a>(
        &'a self,
        instance: &'a Instance,
        name: &'a str,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Image, Self::Error>;

    /// Returns the first internal address of `instance`, if any.
    fn resolve_internal_address(&self, instance: &Instance) -> Option<String> {
        instance.internal_address().map(str::to_owned)
    }

    /// Returns the first external address of `instance`, if any.
    fn resolve_external_address(&self, instance: &Instance) -> Option<String> {
        instance.external_address().map(str::to_owned)
    }
}

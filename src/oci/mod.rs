//! Oracle Cloud Infrastructure provider.
//!
//! OCI is state based: mutating calls return immediately and the instance
//! (or image) resource is polled until its `lifecycleState` settles.
//! Addresses live on VNICs, which are looked up once the instance runs.

pub mod api;
mod error;
pub mod rest;
pub mod signer;

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::poll::{OCI_IMAGE_STATE, OCI_INSTANCE_STATE, PollPolicy, poll_until};
use crate::provider::{
    AuthorizedKey, Image, Instance, InstanceState, NetworkInterface, Provider, ProviderFuture,
};
use api::{
    CreateImageDetails, CreateVnicDetails, ImageResource, InstanceResource, LaunchInstanceDetails,
    OciApi, ShapeConfig, SourceDetails,
};

pub use error::OciError;
pub use rest::RestOciApi;
pub use signer::{DEFAULT_CONFIG_FILE, DEFAULT_PROFILE, OciProfile, RequestSigner, SignerError};

const SSH_AUTHORIZED_KEYS: &str = "ssh_authorized_keys";
const RUNNING: &str = "RUNNING";
const STOPPED: &str = "STOPPED";
const TERMINATED: &str = "TERMINATED";
const AVAILABLE: &str = "AVAILABLE";

/// Creation parameters for one OCI instance.
#[derive(Clone, Debug, PartialEq)]
pub struct OciInstanceSpec {
    /// Display name.
    pub display_name: String,
    /// Availability domain.
    pub availability_domain: String,
    /// Shape name.
    pub shape: String,
    /// Subnet OCID for the primary VNIC.
    pub subnet_id: String,
    /// Boot image OCID.
    pub image_id: String,
    /// OCPUs for flexible shapes.
    pub ocpus: Option<f32>,
    /// Memory in gigabytes for flexible shapes.
    pub memory_in_gbs: Option<f32>,
    /// Boot volume size in gigabytes.
    pub boot_volume_size_in_gbs: Option<i64>,
    /// Request a public address on the primary VNIC.
    pub assign_public_ip: Option<bool>,
}

impl OciInstanceSpec {
    /// Renders the launch request for `compartment_id`, authorising `key`.
    #[must_use]
    pub fn to_details(&self, compartment_id: &str, key: &AuthorizedKey) -> LaunchInstanceDetails {
        let ocpus = self.ocpus.filter(|value| *value > 0.0);
        let memory_in_gbs = self.memory_in_gbs.filter(|value| *value > 0.0);
        let shape_config = (ocpus.is_some() || memory_in_gbs.is_some()).then_some(ShapeConfig {
            ocpus,
            memory_in_gbs,
        });

        LaunchInstanceDetails {
            availability_domain: self.availability_domain.clone(),
            compartment_id: compartment_id.to_owned(),
            shape: self.shape.clone(),
            display_name: self.display_name.clone(),
            create_vnic_details: CreateVnicDetails {
                subnet_id: self.subnet_id.clone(),
                assign_public_ip: self.assign_public_ip,
            },
            shape_config,
            metadata: BTreeMap::from([(
                String::from(SSH_AUTHORIZED_KEYS),
                key.openssh.clone(),
            )]),
            source_details: SourceDetails {
                image_id: self.image_id.clone(),
                boot_volume_size_in_gbs: self.boot_volume_size_in_gbs,
                ..SourceDetails::default()
            },
        }
    }
}

/// Poll policies used by [`OciProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OciPolicies {
    /// Instance lifecycle polling: ready, stop and terminate.
    pub instance_state: PollPolicy,
    /// Image lifecycle polling.
    pub image_state: PollPolicy,
}

impl Default for OciPolicies {
    fn default() -> Self {
        Self {
            instance_state: OCI_INSTANCE_STATE,
            image_state: OCI_IMAGE_STATE,
        }
    }
}

/// Provider backed by the OCI core-services API.
#[derive(Debug)]
pub struct OciProvider<A> {
    api: A,
    compartment_id: String,
    policies: OciPolicies,
}

fn state_from_lifecycle(state: &str) -> InstanceState {
    match state {
        RUNNING => InstanceState::Running,
        "STOPPING" => InstanceState::Stopping,
        STOPPED | "CREATING_IMAGE" => InstanceState::Stopped,
        "TERMINATING" => InstanceState::Terminating,
        TERMINATED => InstanceState::Terminated,
        "" => InstanceState::Requested,
        _ => InstanceState::Provisioning,
    }
}

fn to_instance(resource: InstanceResource, interfaces: Vec<NetworkInterface>) -> Instance {
    Instance {
        state: state_from_lifecycle(&resource.lifecycle_state),
        id: resource.id,
        name: resource.display_name,
        location: resource.availability_domain,
        interfaces,
        boot_disk: None,
    }
}

impl<A: OciApi> OciProvider<A> {
    /// Creates a provider launching into `compartment_id`.
    pub fn new(api: A, compartment_id: impl Into<String>) -> Self {
        Self {
            api,
            compartment_id: compartment_id.into(),
            policies: OciPolicies::default(),
        }
    }

    /// Replaces the default poll policies.
    #[must_use]
    pub fn with_policies(mut self, policies: OciPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Returns the newest image published for `operating_system`.
    ///
    /// # Errors
    ///
    /// Returns [`OciError::NoImage`] when nothing matches and
    /// [`OciError::Request`] when the listing fails.
    pub async fn latest_image(&self, operating_system: &str) -> Result<Image, OciError> {
        let found = self
            .api
            .latest_image(&self.compartment_id, operating_system)
            .await
            .map_err(|source| OciError::Request {
                action: "list images",
                target: operating_system.to_owned(),
                source,
            })?
            .ok_or_else(|| OciError::NoImage {
                operating_system: operating_system.to_owned(),
            })?;
        info!(image = %found.id, operating_system, "selected latest image");
        Ok(to_image(found))
    }

    async fn poll_instance(
        &self,
        instance_id: &str,
        action: &'static str,
        wanted: &'static str,
        unexpected: &'static [&'static str],
        cancel: &CancellationToken,
    ) -> Result<InstanceResource, OciError> {
        let api = &self.api;
        poll_until(self.policies.instance_state, cancel, move || async move {
            let current =
                api.get_instance(instance_id)
                    .await
                    .map_err(|source| OciError::Poll {
                        action,
                        target: instance_id.to_owned(),
                        source,
                    })?;
            info!(
                instance = instance_id,
                lifecycle_state = %current.lifecycle_state,
                wanted,
                "waiting for instance"
            );
            if current.lifecycle_state == wanted {
                return Ok(Some(current));
            }
            if unexpected.contains(&current.lifecycle_state.as_str()) {
                return Err(OciError::UnexpectedState {
                    action,
                    target: instance_id.to_owned(),
                    state: current.lifecycle_state,
                });
            }
            Ok(None)
        })
        .await
        .map_err(|stop| OciError::from_poll(stop, action, instance_id))
    }

    async fn poll_terminated(
        &self,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), OciError> {
        let api = &self.api;
        poll_until(self.policies.instance_state, cancel, move || async move {
            match api.get_instance(instance_id).await {
                Ok(current) if current.lifecycle_state == TERMINATED => Ok(Some(())),
                Ok(current) => {
                    info!(
                        instance = instance_id,
                        lifecycle_state = %current.lifecycle_state,
                        "waiting for instance to be terminated"
                    );
                    Ok(None)
                }
                Err(err) if err.is_not_found() => Ok(Some(())),
                Err(source) => Err(OciError::Poll {
                    action: "terminate",
                    target: instance_id.to_owned(),
                    source,
                }),
            }
        })
        .await
        .map_err(|stop| OciError::from_poll(stop, "terminate", instance_id))
    }

    async fn terminate(&self, instance_id: &str, cancel: &CancellationToken) -> Result<(), OciError> {
        info!(instance = instance_id, "terminating instance");
        match self.api.terminate_instance(instance_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(instance = instance_id, "instance already gone");
                return Ok(());
            }
            Err(source) => {
                return Err(OciError::Request {
                    action: "terminate",
                    target: instance_id.to_owned(),
                    source,
                });
            }
        }
        self.poll_terminated(instance_id, cancel).await
    }

    /// Best-effort teardown with a fresh token; returns whether the instance
    /// is confirmed gone.
    async fn discard(&self, instance_id: &str) -> bool {
        warn!(instance = instance_id, "deleting machine that failed to come up");
        match self.terminate(instance_id, &CancellationToken::new()).await {
            Ok(()) => true,
            Err(err) => {
                error!(instance = instance_id, error = %err, "deleting machine that failed to create");
                false
            }
        }
    }

    async fn resolve_interfaces(&self, instance_id: &str) -> Result<Vec<NetworkInterface>, OciError> {
        let attachments = self
            .api
            .list_vnic_attachments(&self.compartment_id, instance_id)
            .await
            .map_err(|source| OciError::Poll {
                action: "list vnic attachments",
                target: instance_id.to_owned(),
                source,
            })?;

        let mut interfaces = Vec::with_capacity(attachments.len());
        for vnic_id in attachments.iter().filter_map(|item| item.vnic_id.as_deref()) {
            match self.api.get_vnic(vnic_id).await {
                Ok(vnic) => interfaces.push(NetworkInterface {
                    internal_address: vnic.private_ip,
                    external_address: vnic.public_ip,
                }),
                Err(err) => warn!(instance = instance_id, vnic = vnic_id, error = %err, "skipping unreadable vnic"),
            }
        }
        Ok(interfaces)
    }

    async fn await_running(
        &self,
        instance: &mut Instance,
        cancel: &CancellationToken,
    ) -> Result<(), OciError> {
        let running = self
            .poll_instance(
                &instance.id,
                "wait ready",
                RUNNING,
                &["STOPPING", STOPPED, "TERMINATING", TERMINATED],
                cancel,
            )
            .await?;
        let interfaces = self.resolve_interfaces(&running.id).await?;
        *instance = to_instance(running, interfaces);
        Ok(())
    }
}

fn to_image(resource: ImageResource) -> Image {
    Image {
        name: resource.display_name.unwrap_or_else(|| resource.id.clone()),
        reference: resource.id.clone(),
        id: resource.id,
    }
}

impl<A: OciApi> Provider for OciProvider<A> {
    type Spec = OciInstanceSpec;
    type Error = OciError;

    fn create<'a>(
        &'a self,
        spec: &'a OciInstanceSpec,
        key: &'a AuthorizedKey,
        _cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Instance, OciError> {
        Box::pin(async move {
            let details = spec.to_details(&self.compartment_id, key);
            info!(
                instance = %spec.display_name,
                availability_domain = %spec.availability_domain,
                shape = %spec.shape,
                image = %spec.image_id,
                "launching instance"
            );
            let launched = self
                .api
                .launch_instance(&details)
                .await
                .map_err(|source| OciError::Provision {
                    instance: spec.display_name.clone(),
                    source,
                })?;
            info!(instance = %launched.id, lifecycle_state = %launched.lifecycle_state, "instance launched");
            Ok(to_instance(launched, Vec::new()))
        })
    }

    fn get<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Instance, OciError> {
        Box::pin(async move {
            let current = self
                .api
                .get_instance(&instance.id)
                .await
                .map_err(|source| OciError::Poll {
                    action: "get",
                    target: instance.id.clone(),
                    source,
                })?;
            Ok(to_instance(current, instance.interfaces.clone()))
        })
    }

    fn wait_ready<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), OciError> {
        Box::pin(async move {
            let Err(err) = self.await_running(instance, cancel).await else {
                info!(
                    instance = %instance.id,
                    internal = instance.internal_address().unwrap_or_default(),
                    external = instance.external_address().unwrap_or_default(),
                    "instance is running"
                );
                return Ok(());
            };
            instance.state = if self.discard(&instance.id).await {
                InstanceState::Terminated
            } else {
                InstanceState::Failed
            };
            Err(err)
        })
    }

    fn stop<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), OciError> {
        Box::pin(async move {
            info!(instance = %instance.id, "stopping instance");
            instance.state = InstanceState::Stopping;
            self.api
                .instance_action(&instance.id, "STOP")
                .await
                .map_err(|source| OciError::Request {
                    action: "stop",
                    target: instance.id.clone(),
                    source,
                })?;
            self.poll_instance(
                &instance.id,
                "stop",
                STOPPED,
                &["TERMINATING", TERMINATED],
                cancel,
            )
            .await?;
            instance.state = InstanceState::Stopped;
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), OciError> {
        Box::pin(async move {
            if instance.state.is_terminal() {
                return Ok(());
            }
            instance.state = InstanceState::Terminating;
            self.terminate(&instance.id, cancel).await?;
            instance.state = InstanceState::Terminated;
            Ok(())
        })
    }

    fn snapshot<'a>(
        &'a self,
        instance: &'a Instance,
        name: &'a str,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Image, OciError> {
        Box::pin(async move {
            let details = CreateImageDetails {
                compartment_id: self.compartment_id.clone(),
                display_name: name.to_owned(),
                instance_id: instance.id.clone(),
            };
            info!(instance = %instance.id, image = name, "creating image");
            let requested = self
                .api
                .create_image(&details)
                .await
                .map_err(|source| OciError::Request {
                    action: "create image",
                    target: name.to_owned(),
                    source,
                })?;

            let api = &self.api;
            let image_id = requested.id.as_str();
            let available = poll_until(self.policies.image_state, cancel, move || async move {
                let current = api.get_image(image_id).await.map_err(|source| OciError::Poll {
                    action: "create image",
                    target: image_id.to_owned(),
                    source,
                })?;
                info!(image = image_id, lifecycle_state = %current.lifecycle_state, "waiting for image creation");
                match current.lifecycle_state.as_str() {
                    AVAILABLE => Ok(Some(current)),
                    "DISABLED" | "DELETED" => Err(OciError::UnexpectedState {
                        action: "create image",
                        target: image_id.to_owned(),
                        state: current.lifecycle_state,
                    }),
                    _ => Ok(None),
                }
            })
            .await
            .map_err(|stop| OciError::from_poll(stop, "create image", image_id))?;

            let image = to_image(available);
            info!(image = %image.id, name = %image.name, "created image");
            Ok(image)
        })
    }
}

#[cfg(test)]
mod tests;

//! Compute Engine provider.
//!
//! Compute Engine is operation based: insert, stop and delete return an
//! operation handle that is polled until `DONE`. An instance is never
//! considered materialised before its insert operation finishes.

pub mod api;
mod error;
pub mod rest;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::http::ApiError;
use crate::poll::{
    GCE_GLOBAL_OPERATION, GCE_INSTANCE_READY, GCE_ZONE_OPERATION, PollPolicy, poll_until,
};
use crate::provider::{
    AuthorizedKey, Image, Instance, InstanceState, NetworkInterface, Provider, ProviderFuture,
};
use api::{
    AccessConfig, AttachedDisk, GceApi, ImageResource, InitializeParams, InstanceResource,
    Metadata, MetadataItem, NetworkInterfaceResource, Operation, OperationStatus,
};

pub use error::GceError;
pub use rest::{ACCESS_TOKEN_ENV, MetadataServer, RestGceApi, TokenSource};

const SSH_KEYS_METADATA: &str = "ssh-keys";
const EXTERNAL_NAT: &str = "External NAT";
const ONE_TO_ONE_NAT: &str = "ONE_TO_ONE_NAT";

/// Creation parameters for one Compute Engine instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GceInstanceSpec {
    /// Instance name, unique within the zone.
    pub name: String,
    /// Machine type, for example `n1-standard-4`.
    pub machine_type: String,
    /// Boot image or image family URL.
    pub source_image: String,
    /// VPC network name.
    pub network: String,
}

impl GceInstanceSpec {
    /// Renders the insert request for `zone`, authorising `key`.
    #[must_use]
    pub fn to_resource(&self, zone: &str, key: &AuthorizedKey) -> InstanceResource {
        InstanceResource {
            name: self.name.clone(),
            machine_type: format!("zones/{zone}/machineTypes/{}", self.machine_type),
            disks: vec![AttachedDisk {
                auto_delete: true,
                boot: true,
                source: None,
                initialize_params: Some(InitializeParams {
                    source_image: self.source_image.clone(),
                }),
            }],
            network_interfaces: vec![NetworkInterfaceResource {
                network: Some(format!("global/networks/{}", self.network)),
                network_ip: None,
                access_configs: vec![AccessConfig {
                    name: String::from(EXTERNAL_NAT),
                    kind: String::from(ONE_TO_ONE_NAT),
                    nat_ip: None,
                }],
            }],
            metadata: Some(Metadata {
                items: vec![MetadataItem {
                    key: String::from(SSH_KEYS_METADATA),
                    value: format!("{}:{}", key.user, key.openssh),
                }],
            }),
            ..InstanceResource::default()
        }
    }
}

/// Poll policies used by [`GceProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GcePolicies {
    /// Zonal operations: insert, stop and delete.
    pub zone_operation: PollPolicy,
    /// Global operations: image insert.
    pub global_operation: PollPolicy,
    /// Instance status while waiting for `RUNNING`.
    pub instance_ready: PollPolicy,
}

impl Default for GcePolicies {
    fn default() -> Self {
        Self {
            zone_operation: GCE_ZONE_OPERATION,
            global_operation: GCE_GLOBAL_OPERATION,
            instance_ready: GCE_INSTANCE_READY,
        }
    }
}

/// Provider backed by the Compute Engine API.
#[derive(Debug)]
pub struct GceProvider<A> {
    api: A,
    project: String,
    zone: String,
    policies: GcePolicies,
}

impl<A: GceApi> GceProvider<A> {
    /// Creates a provider operating in `project` and `zone`.
    pub fn new(api: A, project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            api,
            project: project.into(),
            zone: zone.into(),
            policies: GcePolicies::default(),
        }
    }

    /// Replaces the default poll policies.
    #[must_use]
    pub fn with_policies(mut self, policies: GcePolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Project hosting the instances.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Zone hosting the instances.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn ensure_succeeded(
        operation: &Operation,
        action: &'static str,
        target: &str,
    ) -> Result<(), GceError> {
        if operation.status() == OperationStatus::Error {
            return Err(GceError::OperationFailed {
                action,
                target: target.to_owned(),
                message: operation.error_message(),
            });
        }
        Ok(())
    }

    async fn wait_zone_operation(
        &self,
        operation: &Operation,
        action: &'static str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GceError> {
        let api = &self.api;
        let project = self.project.as_str();
        let zone = self.zone.as_str();
        let name = operation.name.as_str();
        let finished = poll_until(self.policies.zone_operation, cancel, move || async move {
            let current = api.get_zone_operation(project, zone, name).await?;
            log_operation(&current, target);
            let done = current.status() != OperationStatus::Pending
                && current.status() != OperationStatus::Running;
            Ok::<_, ApiError>(done.then_some(current))
        })
        .await
        .map_err(|stop| GceError::from_poll(stop, action, target))?;
        Self::ensure_succeeded(&finished, action, target)
    }

    async fn wait_global_operation(
        &self,
        operation: &Operation,
        action: &'static str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GceError> {
        let api = &self.api;
        let project = self.project.as_str();
        let name = operation.name.as_str();
        let finished = poll_until(self.policies.global_operation, cancel, move || async move {
            let current = api.get_global_operation(project, name).await?;
            log_operation(&current, target);
            let done = current.status() != OperationStatus::Pending
                && current.status() != OperationStatus::Running;
            Ok::<_, ApiError>(done.then_some(current))
        })
        .await
        .map_err(|stop| GceError::from_poll(stop, action, target))?;
        Self::ensure_succeeded(&finished, action, target)
    }

    async fn delete_named(&self, name: &str, cancel: &CancellationToken) -> Result<(), GceError> {
        info!(instance = name, zone = %self.zone, "deleting instance");
        let operation = match self.api.delete_instance(&self.project, &self.zone, name).await {
            Ok(operation) => operation,
            Err(err) if err.is_not_found() => {
                info!(instance = name, "instance already gone");
                return Ok(());
            }
            Err(source) => {
                return Err(GceError::Request {
                    action: "delete",
                    target: name.to_owned(),
                    source,
                });
            }
        };
        self.wait_zone_operation(&operation, "delete", name, cancel)
            .await
    }

    /// Best-effort teardown of an instance that never became usable. Runs
    /// with a fresh token so a cancelled caller still cleans up.
    async fn discard(&self, name: &str) -> bool {
        warn!(instance = name, "deleting machine that failed to come up");
        match self.delete_named(name, &CancellationToken::new()).await {
            Ok(()) => true,
            Err(err) => {
                error!(instance = name, error = %err, "deleting machine that failed to create");
                false
            }
        }
    }

    async fn await_running(
        &self,
        instance: &mut Instance,
        cancel: &CancellationToken,
    ) -> Result<(), GceError> {
        let api = &self.api;
        let project = self.project.as_str();
        let zone = self.zone.as_str();
        let name = instance.name.as_str();
        let settled = poll_until(self.policies.instance_ready, cancel, move || async move {
            let current = api.get_instance(project, zone, name).await?;
            info!(instance = name, status = %current.status, "waiting for instance to be running");
            let state = state_from_status(&current.status);
            let waiting = matches!(state, InstanceState::Requested | InstanceState::Provisioning);
            Ok::<_, ApiError>((!waiting).then_some(current))
        })
        .await
        .map_err(|stop| GceError::from_poll(stop, "wait ready", name))?;

        if state_from_status(&settled.status) != InstanceState::Running {
            return Err(GceError::UnexpectedStatus {
                instance: settled.name,
                status: settled.status,
            });
        }
        *instance = to_instance(settled, &self.zone);
        Ok(())
    }
}

fn log_operation(operation: &Operation, target: &str) {
    info!(
        target_resource = target,
        operation = %operation.name,
        operation_type = operation.operation_type.as_deref().unwrap_or_default(),
        status = %operation.status,
        "polled operation"
    );
}

/// Maps Compute Engine instance status onto the shared state machine.
/// `TERMINATED` in Compute Engine means stopped, not deleted.
fn state_from_status(status: &str) -> InstanceState {
    match status {
        "RUNNING" => InstanceState::Running,
        "STOPPING" | "SUSPENDING" => InstanceState::Stopping,
        "STOPPED" | "SUSPENDED" | "TERMINATED" => InstanceState::Stopped,
        "" => InstanceState::Requested,
        _ => InstanceState::Provisioning,
    }
}

fn to_instance(resource: InstanceResource, zone: &str) -> Instance {
    let boot_disk = resource
        .disks
        .iter()
        .find(|disk| disk.boot)
        .or_else(|| resource.disks.first())
        .and_then(|disk| disk.source.clone());
    let interfaces = resource
        .network_interfaces
        .iter()
        .map(|nic| NetworkInterface {
            internal_address: nic.network_ip.clone(),
            external_address: nic
                .access_configs
                .iter()
                .filter_map(|config| config.nat_ip.clone())
                .find(|address| !address.is_empty()),
        })
        .collect();
    let state = state_from_status(&resource.status);

    Instance {
        id: resource.id.unwrap_or_else(|| resource.name.clone()),
        name: resource.name,
        location: zone.to_owned(),
        state,
        interfaces,
        boot_disk,
    }
}

impl<A: GceApi> Provider for GceProvider<A> {
    type Spec = GceInstanceSpec;
    type Error = GceError;

    fn create<'a>(
        &'a self,
        spec: &'a GceInstanceSpec,
        key: &'a AuthorizedKey,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Instance, GceError> {
        Box::pin(async move {
            let request = spec.to_resource(&self.zone, key);
            info!(
                instance = %spec.name,
                zone = %self.zone,
                machine_type = %spec.machine_type,
                image = %spec.source_image,
                "creating instance"
            );
            let operation = self
                .api
                .insert_instance(&self.project, &self.zone, &request)
                .await
                .map_err(|source| GceError::Provision {
                    instance: spec.name.clone(),
                    source,
                })?;

            if let Err(err) = self
                .wait_zone_operation(&operation, "insert", &spec.name, cancel)
                .await
            {
                self.discard(&spec.name).await;
                return Err(err);
            }

            match self
                .api
                .get_instance(&self.project, &self.zone, &spec.name)
                .await
            {
                Ok(created) => Ok(to_instance(created, &self.zone)),
                Err(source) => {
                    self.discard(&spec.name).await;
                    Err(GceError::Poll {
                        action: "insert",
                        target: spec.name.clone(),
                        source,
                    })
                }
            }
        })
    }

    fn get<'a>(&'a self, instance: &'a Instance) -> ProviderFuture<'a, Instance, GceError> {
        Box::pin(async move {
            let current = self
                .api
                .get_instance(&self.project, &self.zone, &instance.name)
                .await
                .map_err(|source| GceError::Poll {
                    action: "get",
                    target: instance.name.clone(),
                    source,
                })?;
            Ok(to_instance(current, &self.zone))
        })
    }

    fn wait_ready<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), GceError> {
        Box::pin(async move {
            let Err(err) = self.await_running(instance, cancel).await else {
                info!(
                    instance = %instance.name,
                    internal = instance.internal_address().unwrap_or_default(),
                    external = instance.external_address().unwrap_or_default(),
                    "instance is running"
                );
                return Ok(());
            };
            instance.state = if self.discard(&instance.name).await {
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
    ) -> ProviderFuture<'a, (), GceError> {
        Box::pin(async move {
            info!(instance = %instance.name, "stopping instance");
            instance.state = InstanceState::Stopping;
            let operation = self
                .api
                .stop_instance(&self.project, &self.zone, &instance.name)
                .await
                .map_err(|source| GceError::Request {
                    action: "stop",
                    target: instance.name.clone(),
                    source,
                })?;
            self.wait_zone_operation(&operation, "stop", &instance.name, cancel)
                .await?;
            instance.state = InstanceState::Stopped;
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        instance: &'a mut Instance,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), GceError> {
        Box::pin(async move {
            if instance.state.is_terminal() {
                return Ok(());
            }
            instance.state = InstanceState::Terminating;
            self.delete_named(&instance.name, cancel).await?;
            instance.state = InstanceState::Terminated;
            Ok(())
        })
    }

    fn snapshot<'a>(
        &'a self,
        instance: &'a Instance,
        name: &'a str,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Image, GceError> {
        Box::pin(async move {
            let source_disk =
                instance
                    .boot_disk
                    .clone()
                    .ok_or_else(|| GceError::MissingBootDisk {
                        instance: instance.name.clone(),
                    })?;
            info!(instance = %instance.name, image = name, disk = %source_disk, "creating image");
            let request = ImageResource {
                name: name.to_owned(),
                source_disk: Some(source_disk),
                ..ImageResource::default()
            };
            let operation = self
                .api
                .insert_image(&self.project, &request)
                .await
                .map_err(|source| GceError::Request {
                    action: "image insert",
                    target: name.to_owned(),
                    source,
                })?;
            self.wait_global_operation(&operation, "image insert", name, cancel)
                .await?;

            let created = self
                .api
                .get_image(&self.project, name)
                .await
                .map_err(|source| GceError::Poll {
                    action: "image insert",
                    target: name.to_owned(),
                    source,
                })?;
            info!(image = %created.name, self_link = created.self_link.as_deref().unwrap_or_default(), "created image");
            Ok(Image {
                id: created.id.unwrap_or_else(|| created.name.clone()),
                name: created.name,
                reference: created.self_link.unwrap_or_default(),
            })
        })
    }
}

#[cfg(test)]
mod tests;

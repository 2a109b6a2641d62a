//! Compute Engine resource models and the API seam used by the provider.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::http::ApiError;

/// Future returned by [`GceApi`] calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Progress of an asynchronous Compute Engine operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationStatus {
    /// Accepted but not started.
    Pending,
    /// In progress.
    Running,
    /// Finished without errors.
    Done,
    /// Finished with errors.
    Error,
}

/// Handle returned by every mutating Compute Engine call.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name used for polling.
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`.
    #[serde(default)]
    pub status: String,
    /// For example `insert`, `stop` or `delete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    /// Resource the operation acts on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_link: Option<String>,
    /// Errors recorded once the operation is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationErrors>,
}

impl Operation {
    /// Classifies the raw status string.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        match self.status.as_str() {
            "DONE" if self.error.as_ref().is_some_and(|err| !err.errors.is_empty()) => {
                OperationStatus::Error
            }
            "DONE" => OperationStatus::Done,
            "RUNNING" => OperationStatus::Running,
            _ => OperationStatus::Pending,
        }
    }

    /// Joins the recorded error messages.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|errors| {
                errors
                    .errors
                    .iter()
                    .map(|entry| format!("{}: {}", entry.code, entry.message))
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default()
    }
}

/// Error block of a finished operation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OperationErrors {
    /// Individual failures.
    #[serde(default)]
    pub errors: Vec<OperationErrorEntry>,
}

/// One failure inside [`OperationErrors`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OperationErrorEntry {
    /// Machine-readable code such as `QUOTA_EXCEEDED`.
    #[serde(default)]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// Instance resource, used both for insert requests and get responses.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResource {
    /// Numeric identifier rendered as a string; absent in insert requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Instance name.
    pub name: String,
    /// Partial URL of the machine type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_type: String,
    /// For example `PROVISIONING`, `RUNNING` or `TERMINATED`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Attached disks.
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    /// Network attachments.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceResource>,
    /// Key/value metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Disk attached to an instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Delete the disk together with the instance.
    #[serde(default)]
    pub auto_delete: bool,
    /// Boot disk flag.
    #[serde(default)]
    pub boot: bool,
    /// Disk URL, present in responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Creation parameters, present in requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<InitializeParams>,
}

/// Parameters for a disk created alongside the instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Image or image family URL.
    pub source_image: String,
}

/// Network attachment of an instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceResource {
    /// Network URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Internal address assigned by the provider.
    #[serde(rename = "networkIP", default, skip_serializing_if = "Option::is_none")]
    pub network_ip: Option<String>,
    /// External access configurations.
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// External access configuration (one-to-one NAT).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Configuration name.
    #[serde(default)]
    pub name: String,
    /// Always `ONE_TO_ONE_NAT`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// External address, present in responses.
    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

/// Instance metadata block.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Metadata {
    /// Metadata entries.
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

/// One metadata entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetadataItem {
    /// Entry key, for example `ssh-keys`.
    pub key: String,
    /// Entry value.
    pub value: String,
}

/// Disk image resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageResource {
    /// Numeric identifier rendered as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Image name.
    pub name: String,
    /// Disk the image is created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_disk: Option<String>,
    /// Full URL of the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    /// For example `PENDING` or `READY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Compute Engine calls the provider depends on.
///
/// Mutating calls return an [`Operation`] that must be polled until done.
pub trait GceApi: Send + Sync {
    /// `instances.insert`.
    fn insert_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        instance: &'a InstanceResource,
    ) -> ApiFuture<'a, Operation>;

    /// `instances.get`.
    fn get_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, InstanceResource>;

    /// `instances.delete`.
    fn delete_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Operation>;

    /// `instances.stop`.
    fn stop_instance<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> ApiFuture<'a, Operation>;

    /// `zoneOperations.get`.
    fn get_zone_operation<'a>(
        &'a self,
        project: &'a str,
        zone: &'a str,
        operation: &'a str,
    ) -> ApiFuture<'a, Operation>;

    /// `images.insert`.
    fn insert_image<'a>(
        &'a self,
        project: &'a str,
        image: &'a ImageResource,
    ) -> ApiFuture<'a, Operation>;

    /// `globalOperations.get`.
    fn get_global_operation<'a>(
        &'a self,
        project: &'a str,
        operation: &'a str,
    ) -> ApiFuture<'a, Operation>;

    /// `images.get`.
    fn get_image<'a>(&'a self, project: &'a str, name: &'a str) -> ApiFuture<'a, ImageResource>;
}

//! Oracle Cloud Infrastructure core-services models and the API seam used by
//! the provider.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::http::ApiError;

/// Future returned by [`OciApi`] calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Body of `LaunchInstance`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaunchInstanceDetails {
    /// Availability domain, for example `bzBe:US-SANJOSE-1-AD-1`.
    pub availability_domain: String,
    /// Compartment OCID.
    pub compartment_id: String,
    /// Shape name, for example `VM.Standard.E5.Flex`.
    pub shape: String,
    /// Display name.
    pub display_name: String,
    /// Primary VNIC parameters.
    pub create_vnic_details: CreateVnicDetails,
    /// OCPU and memory sizing for flexible shapes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_config: Option<ShapeConfig>,
    /// Instance metadata, including `ssh_authorized_keys`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Boot source.
    pub source_details: SourceDetails,
}

/// Primary VNIC parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateVnicDetails {
    /// Subnet OCID.
    pub subnet_id: String,
    /// Request a public address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assign_public_ip: Option<bool>,
}

/// Flexible shape sizing.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ShapeConfig {
    /// OCPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocpus: Option<f32>,
    /// Memory in gigabytes.
    #[serde(
        rename = "memoryInGBs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_in_gbs: Option<f32>,
}

/// Image boot source.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDetails {
    /// Always `image`.
    pub source_type: String,
    /// Image OCID.
    pub image_id: String,
    /// Boot volume size in gigabytes.
    #[serde(
        rename = "bootVolumeSizeInGBs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub boot_volume_size_in_gbs: Option<i64>,
}

impl Default for SourceDetails {
    fn default() -> Self {
        Self {
            source_type: String::from("image"),
            image_id: String::new(),
            boot_volume_size_in_gbs: None,
        }
    }
}

/// Instance resource.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResource {
    /// Instance OCID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// For example `PROVISIONING`, `RUNNING` or `TERMINATED`.
    #[serde(default)]
    pub lifecycle_state: String,
    /// Availability domain.
    #[serde(default)]
    pub availability_domain: String,
}

/// Attachment linking an instance to a VNIC.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VnicAttachment {
    /// VNIC OCID, absent while the attachment is being created.
    #[serde(default)]
    pub vnic_id: Option<String>,
    /// Attachment state.
    #[serde(default)]
    pub lifecycle_state: String,
}

/// Virtual network interface.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Vnic {
    /// VNIC OCID.
    #[serde(default)]
    pub id: String,
    /// Private address.
    #[serde(default)]
    pub private_ip: Option<String>,
    /// Public address, when one was assigned.
    #[serde(default)]
    pub public_ip: Option<String>,
}

/// Body of `CreateImage`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageDetails {
    /// Compartment OCID.
    pub compartment_id: String,
    /// Image display name.
    pub display_name: String,
    /// Instance the image is taken from.
    pub instance_id: String,
}

/// Image resource.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageResource {
    /// Image OCID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// For example `PROVISIONING` or `AVAILABLE`.
    #[serde(default)]
    pub lifecycle_state: String,
    /// Operating system label.
    #[serde(default)]
    pub operating_system: Option<String>,
}

/// Core-services calls the provider depends on.
///
/// There are no operation handles: callers poll the resource's
/// `lifecycleState` directly.
pub trait OciApi: Send + Sync {
    /// `LaunchInstance`.
    fn launch_instance<'a>(
        &'a self,
        details: &'a LaunchInstanceDetails,
    ) -> ApiFuture<'a, InstanceResource>;

    /// `GetInstance`.
    fn get_instance<'a>(&'a self, instance_id: &'a str) -> ApiFuture<'a, InstanceResource>;

    /// `TerminateInstance`.
    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> ApiFuture<'a, ()>;

    /// `InstanceAction`, for example `STOP`.
    fn instance_action<'a>(
        &'a self,
        instance_id: &'a str,
        action: &'a str,
    ) -> ApiFuture<'a, InstanceResource>;

    /// `ListVnicAttachments` for one instance.
    fn list_vnic_attachments<'a>(
        &'a self,
        compartment_id: &'a str,
        instance_id: &'a str,
    ) -> ApiFuture<'a, Vec<VnicAttachment>>;

    /// `GetVnic`.
    fn get_vnic<'a>(&'a self, vnic_id: &'a str) -> ApiFuture<'a, Vnic>;

    /// `CreateImage`.
    fn create_image<'a>(&'a self, details: &'a CreateImageDetails)
    -> ApiFuture<'a, ImageResource>;

    /// `GetImage`.
    fn get_image<'a>(&'a self, image_id: &'a str) -> ApiFuture<'a, ImageResource>;

    /// Newest image for `operating_system` in `compartment_id`, if any.
    fn latest_image<'a>(
        &'a self,
        compartment_id: &'a str,
        operating_system: &'a str,
    ) -> ApiFuture<'a, Option<ImageResource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_details_use_the_wire_field_names() {
        let details = LaunchInstanceDetails {
            availability_domain: String::from("AD-1"),
            compartment_id: String::from("ocid1.compartment"),
            shape: String::from("VM.Standard.E5.Flex"),
            display_name: String::from("gha-runner-x86-20250101-000000"),
            create_vnic_details: CreateVnicDetails {
                subnet_id: String::from("ocid1.subnet"),
                assign_public_ip: Some(true),
            },
            shape_config: Some(ShapeConfig {
                ocpus: Some(2.0),
                memory_in_gbs: Some(16.0),
            }),
            metadata: BTreeMap::from([(
                String::from("ssh_authorized_keys"),
                String::from("ecdsa-sha2-nistp384 AAAA"),
            )]),
            source_details: SourceDetails {
                image_id: String::from("ocid1.image"),
                boot_volume_size_in_gbs: Some(600),
                ..SourceDetails::default()
            },
        };

        let json = serde_json::to_value(&details).unwrap_or_else(|err| panic!("encode: {err}"));
        assert_eq!(json["createVnicDetails"]["assignPublicIp"], true);
        assert_eq!(json["shapeConfig"]["memoryInGBs"], 16.0);
        assert_eq!(json["sourceDetails"]["sourceType"], "image");
        assert_eq!(json["sourceDetails"]["bootVolumeSizeInGBs"], 600);
        assert_eq!(
            json["metadata"]["ssh_authorized_keys"],
            "ecdsa-sha2-nistp384 AAAA"
        );
    }

    #[test]
    fn shape_config_is_omitted_when_absent() {
        let json = serde_json::to_value(LaunchInstanceDetails::default())
            .unwrap_or_else(|err| panic!("encode: {err}"));
        assert!(json.get("shapeConfig").is_none());
    }
}

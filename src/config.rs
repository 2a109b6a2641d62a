//! Configuration loading via `ortho-config`.
//!
//! Each provider has its own layered configuration: defaults, then
//! `cloudrunner.toml`, then environment variables. Command-line overrides are
//! applied on top by the binary.

use std::env;
use std::ffi::OsString;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::gce::{GceInstanceSpec, MetadataServer};
use crate::oci::{DEFAULT_CONFIG_FILE, DEFAULT_PROFILE, OciInstanceSpec};

/// Zone used when neither configuration nor the metadata server name one.
pub const DEFAULT_ZONE: &str = "us-central1-a";
/// Base image family for GCE instances.
pub const DEFAULT_GCE_IMAGE: &str =
    "projects/ubuntu-os-cloud/global/images/family/ubuntu-minimal-2404-lts-amd64";
/// Machine type for GCE instances.
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-4";
/// Environment variable consulted for the project when none is configured.
pub const GOOGLE_CLOUD_PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";
/// Boot volume size for OCI runner instances, in gigabytes.
pub const DEFAULT_BOOT_VOLUME_GBS: i64 = 600;

/// Shape and disk settings a workflow launches with when `[oci]` leaves them
/// unset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OciLaunchDefaults {
    /// Instance shape.
    pub shape: &'static str,
    /// OCPUs for flexible shapes.
    pub ocpus: Option<f32>,
    /// Memory for flexible shapes, in gigabytes.
    pub memory_in_gbs: Option<f32>,
    /// Boot volume size; `None` keeps the image's own size.
    pub boot_volume_size_in_gbs: Option<i64>,
}

/// Launch defaults for CI runner instances.
pub const OCI_RUNNER_DEFAULTS: OciLaunchDefaults = OciLaunchDefaults {
    shape: "VM.Standard.E2.2",
    ocpus: None,
    memory_in_gbs: None,
    boot_volume_size_in_gbs: Some(DEFAULT_BOOT_VOLUME_GBS),
};

/// Launch defaults for image builder instances.
pub const OCI_IMAGE_BUILDER_DEFAULTS: OciLaunchDefaults = OciLaunchDefaults {
    shape: "VM.Standard.E5.Flex",
    ocpus: Some(1.0),
    memory_in_gbs: Some(16.0),
    boot_volume_size_in_gbs: None,
};

const CONFIG_FILE: &str = "cloudrunner.toml";
const PROGRAM: &str = "cloudrunner";

/// Compute Engine settings, read from `RUNNER_*` variables and the `[gcp]`
/// section.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "RUNNER")]
pub struct GceConfig {
    /// Zone hosting the instance. Falls back to the metadata server, then
    /// [`DEFAULT_ZONE`].
    pub zone: Option<String>,
    /// Source image or image family URL.
    #[ortho_config(default = DEFAULT_GCE_IMAGE.to_owned())]
    pub image: String,
    /// Machine type name, without the `zones/<zone>/machineTypes/` prefix.
    #[ortho_config(default = DEFAULT_MACHINE_TYPE.to_owned())]
    pub machine_type: String,
    /// Project hosting the instance. Falls back to `GOOGLE_CLOUD_PROJECT`,
    /// then the metadata server.
    pub project: Option<String>,
    /// VPC network name.
    #[ortho_config(default = "default".to_owned())]
    pub network: String,
    /// Login user the ephemeral key is authorised for.
    #[ortho_config(default = "gha".to_owned())]
    pub ssh_user: String,
}

/// Oracle Cloud settings, read from `OCI_RUNNER_*` variables and the `[oci]`
/// section.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "OCI_RUNNER")]
pub struct OciConfig {
    /// Architecture label used in instance names and image lookups.
    #[ortho_config(default = "x86".to_owned())]
    pub arch: String,
    /// Availability domain, for example `bzBe:US-SANJOSE-1-AD-1`. Required,
    /// but may come from `--availability-domain`.
    #[ortho_config(default = String::new())]
    pub availability_domain: String,
    /// Compartment OCID. Falls back to the tenancy of the signing profile.
    pub compartment_id: Option<String>,
    /// Subnet OCID for the primary VNIC. Required, but may come from
    /// `--subnet-id`.
    #[ortho_config(default = String::new())]
    pub subnet_id: String,
    /// Instance shape; the workflow's [`OciLaunchDefaults`] apply when unset.
    pub shape: Option<String>,
    /// OCPUs for flexible shapes.
    pub shape_ocpus: Option<f32>,
    /// Memory for flexible shapes, in gigabytes.
    pub shape_memory_in_gbs: Option<f32>,
    /// Boot volume size in gigabytes.
    pub boot_volume_size_in_gbs: Option<i64>,
    /// Image OCID. Runners look up the newest runner image when unset.
    pub image_id: Option<String>,
    /// Login user the ephemeral key is authorised for.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// OCI CLI configuration file holding the signing profile.
    #[ortho_config(default = DEFAULT_CONFIG_FILE.to_owned())]
    pub config_file: String,
    /// Profile name inside [`Self::config_file`].
    #[ortho_config(default = DEFAULT_PROFILE.to_owned())]
    pub profile: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {CONFIG_FILE}",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

impl GceConfig {
    /// Loads configuration using the `ortho-config` derive without parsing
    /// process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Ok(Self::load_from_iter([OsString::from(PROGRAM)])?)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.image,
            &FieldMetadata::new("source image", "RUNNER_IMAGE", "image", "gcp"),
        )?;
        require_field(
            &self.machine_type,
            &FieldMetadata::new(
                "machine type",
                "RUNNER_MACHINE_TYPE",
                "machine_type",
                "gcp",
            ),
        )?;
        require_field(
            &self.network,
            &FieldMetadata::new("VPC network", "RUNNER_NETWORK", "network", "gcp"),
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH login user", "RUNNER_SSH_USER", "ssh_user", "gcp"),
        )
    }

    /// Builds the creation parameters for an instance called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn instance_spec(&self, name: &str) -> Result<GceInstanceSpec, ConfigError> {
        self.validate()?;
        Ok(GceInstanceSpec {
            name: name.to_owned(),
            machine_type: self.machine_type.trim().to_owned(),
            source_image: self.image.trim().to_owned(),
            network: self.network.trim().to_owned(),
        })
    }

    /// Returns the configured project, `GOOGLE_CLOUD_PROJECT`, or the project
    /// reported by `metadata`, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Discovery`] when the metadata server cannot be
    /// reached.
    pub async fn resolve_project(&self, metadata: &MetadataServer) -> Result<String, ConfigError> {
        if let Some(project) = non_empty(self.project.as_deref())
            .or_else(|| non_empty(env::var(GOOGLE_CLOUD_PROJECT_ENV).ok().as_deref()))
        {
            return Ok(project);
        }
        let project = metadata
            .project_id()
            .await
            .map_err(|err| ConfigError::Discovery {
                field: "project",
                message: err.to_string(),
            })?;
        info!(project = %project, "got project from metadata server");
        Ok(project)
    }

    /// Returns the configured zone or the zone reported by `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Discovery`] when the metadata server cannot be
    /// reached.
    pub async fn resolve_zone(&self, metadata: &MetadataServer) -> Result<String, ConfigError> {
        if let Some(zone) = non_empty(self.zone.as_deref()) {
            return Ok(zone);
        }
        let zone = metadata.zone().await.map_err(|err| ConfigError::Discovery {
            field: "zone",
            message: err.to_string(),
        })?;
        info!(zone = %zone, "got zone from metadata server");
        Ok(zone)
    }

    /// Returns the configured zone or [`DEFAULT_ZONE`].
    #[must_use]
    pub fn zone_or_default(&self) -> String {
        non_empty(self.zone.as_deref()).unwrap_or_else(|| String::from(DEFAULT_ZONE))
    }
}

impl OciConfig {
    /// Loads configuration using the `ortho-config` derive without parsing
    /// process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Ok(Self::load_from_iter([OsString::from(PROGRAM)])?)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a size is not positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.availability_domain,
            &FieldMetadata::new(
                "availability domain",
                "OCI_RUNNER_AVAILABILITY_DOMAIN",
                "availability_domain",
                "oci",
            ),
        )?;
        require_field(
            &self.subnet_id,
            &FieldMetadata::new("subnet OCID", "OCI_RUNNER_SUBNET_ID", "subnet_id", "oci"),
        )?;
        require_field(
            &self.arch,
            &FieldMetadata::new("architecture label", "OCI_RUNNER_ARCH", "arch", "oci"),
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH login user", "OCI_RUNNER_SSH_USER", "ssh_user", "oci"),
        )?;
        require_field(
            &self.profile,
            &FieldMetadata::new("OCI profile", "OCI_RUNNER_PROFILE", "profile", "oci"),
        )?;
        if self.boot_volume_size_in_gbs.is_some_and(|size| size <= 0) {
            return Err(ConfigError::Invalid(String::from(
                "boot_volume_size_in_gbs must be positive",
            )));
        }
        Ok(())
    }

    /// Returns the configured compartment, or `tenancy` when none is set.
    #[must_use]
    pub fn compartment_or(&self, tenancy: &str) -> String {
        non_empty(self.compartment_id.as_deref()).unwrap_or_else(|| {
            warn!(compartment = %tenancy, "no compartment configured; using the tenancy");
            tenancy.to_owned()
        })
    }

    /// Operating system label of the runner images built for
    /// [`Self::arch`].
    #[must_use]
    pub fn runner_image_os(&self) -> String {
        format!("ubuntu-24.04-{}-gha-image", self.arch.trim())
    }

    /// Builds the launch parameters for an instance called `display_name`
    /// booting `image_id`, filling unset sizing from `defaults`.
    ///
    /// A configured shape replaces the whole default shape configuration, so
    /// flexible sizing from `defaults` never reaches a fixed shape.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn instance_spec(
        &self,
        display_name: &str,
        image_id: &str,
        defaults: OciLaunchDefaults,
    ) -> Result<OciInstanceSpec, ConfigError> {
        self.validate()?;
        let (shape, ocpus, memory_in_gbs) = match non_empty(self.shape.as_deref()) {
            Some(shape) => (shape, self.shape_ocpus, self.shape_memory_in_gbs),
            None => (
                defaults.shape.to_owned(),
                self.shape_ocpus.or(defaults.ocpus),
                self.shape_memory_in_gbs.or(defaults.memory_in_gbs),
            ),
        };
        Ok(OciInstanceSpec {
            display_name: display_name.to_owned(),
            availability_domain: self.availability_domain.trim().to_owned(),
            shape,
            subnet_id: self.subnet_id.trim().to_owned(),
            image_id: image_id.to_owned(),
            ocpus,
            memory_in_gbs,
            boot_volume_size_in_gbs: self
                .boot_volume_size_in_gbs
                .or(defaults.boot_volume_size_in_gbs),
            assign_public_ip: Some(true),
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Raised when a value could not be discovered from the environment.
    #[error("cannot determine {field}: {message}")]
    Discovery {
        /// Field being discovered.
        field: &'static str,
        /// Underlying error text.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<std::sync::Arc<ortho_config::OrthoError>> for ConfigError {
    fn from(value: std::sync::Arc<ortho_config::OrthoError>) -> Self {
        Self::Parse(value.to_string())
    }
}

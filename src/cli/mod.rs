//! Command-line interface definitions for the `cloudrunner` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `cloudrunner` binary.
#[derive(Debug, Parser)]
#[command(
    name = "cloudrunner",
    about = "Run CI jobs and build images on disposable cloud VMs",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub(crate) debug: bool,
    /// Cloud provider to use.
    #[command(subcommand)]
    pub(crate) provider: ProviderCommand,
}

/// Provider selection.
#[derive(Debug, Subcommand)]
pub(crate) enum ProviderCommand {
    /// Google Compute Engine.
    #[command(subcommand)]
    Gcp(GcpCommand),
    /// Oracle Cloud Infrastructure.
    #[command(subcommand)]
    Oci(OciCommand),
}

/// Workflows available on Compute Engine.
#[derive(Debug, Subcommand)]
pub(crate) enum GcpCommand {
    /// Start a just-in-time GitHub Actions runner on a fresh VM.
    #[command(name = "run")]
    Run(GcpOverrides),
    /// Run a build script on a fresh VM and save its boot disk as an image.
    #[command(name = "build-image")]
    BuildImage(GcpBuildImage),
}

/// Workflows available on Oracle Cloud.
#[derive(Debug, Subcommand)]
pub(crate) enum OciCommand {
    /// Start a just-in-time GitHub Actions runner on a fresh VM.
    #[command(name = "run")]
    Run(OciOverrides),
    /// Run a build script on a fresh VM and save its boot disk as an image.
    #[command(name = "build-image")]
    BuildImage(OciBuildImage),
}

/// Compute Engine settings that override `RUNNER_*` configuration.
#[derive(Debug, Default, Args)]
pub(crate) struct GcpOverrides {
    /// Zone to create the VM in.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Source image or image family URL.
    #[arg(long, visible_alias = "base-image", value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Machine type, for example `n1-standard-4`.
    #[arg(long, value_name = "TYPE")]
    pub(crate) machine_type: Option<String>,
    /// Google Cloud project ID.
    #[arg(long, value_name = "PROJECT")]
    pub(crate) project: Option<String>,
}

/// Arguments for `cloudrunner gcp build-image`.
#[derive(Debug, Args)]
pub(crate) struct GcpBuildImage {
    /// Provider overrides.
    #[command(flatten)]
    pub(crate) overrides: GcpOverrides,
    /// Local build script uploaded to the VM and run with sudo.
    #[arg(long, value_name = "PATH")]
    pub(crate) script: String,
    /// Name of the image to create. Defaults to `gha-<timestamp>`.
    #[arg(long, visible_alias = "disk-name", value_name = "NAME")]
    pub(crate) image_name: Option<String>,
}

/// Oracle Cloud settings that override `OCI_RUNNER_*` configuration.
#[derive(Debug, Default, Args)]
pub(crate) struct OciOverrides {
    /// Machine architecture label.
    #[arg(long, value_name = "ARCH")]
    pub(crate) arch: Option<String>,
    /// Availability domain.
    #[arg(long, value_name = "DOMAIN")]
    pub(crate) availability_domain: Option<String>,
    /// Compartment OCID.
    #[arg(long, value_name = "OCID")]
    pub(crate) compartment_id: Option<String>,
    /// Subnet OCID.
    #[arg(long, value_name = "OCID")]
    pub(crate) subnet_id: Option<String>,
    /// Instance shape.
    #[arg(long, value_name = "SHAPE")]
    pub(crate) shape: Option<String>,
    /// Number of OCPUs for flexible shapes.
    #[arg(long, value_name = "COUNT")]
    pub(crate) shape_ocpus: Option<f32>,
    /// Amount of memory in GBs for flexible shapes.
    #[arg(long, value_name = "GB")]
    pub(crate) shape_memory_in_gbs: Option<f32>,
    /// Image OCID to boot.
    #[arg(long, visible_alias = "base-image", value_name = "OCID")]
    pub(crate) image_id: Option<String>,
    /// Profile in the OCI configuration file.
    #[arg(long, value_name = "NAME")]
    pub(crate) profile: Option<String>,
}

/// Arguments for `cloudrunner oci build-image`.
#[derive(Debug, Args)]
pub(crate) struct OciBuildImage {
    /// Provider overrides.
    #[command(flatten)]
    pub(crate) overrides: OciOverrides,
    /// Local build script uploaded to the VM and run with sudo.
    #[arg(long, value_name = "PATH")]
    pub(crate) script: String,
    /// Name of the image to create. Defaults to `gha-<timestamp>`.
    #[arg(long, visible_alias = "create-image-name", value_name = "NAME")]
    pub(crate) image_name: Option<String>,
}

//! Binary entry point for the `cloudrunner` CLI.

use std::env;
use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use clap::Parser;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};

use cloudrunner::config::{
    ConfigError, GceConfig, OCI_IMAGE_BUILDER_DEFAULTS, OCI_RUNNER_DEFAULTS, OciConfig,
};
use cloudrunner::gce::{
    GceError, GceInstanceSpec, GceProvider, MetadataServer, RestGceApi, TokenSource,
};
use cloudrunner::oci::{
    OciError, OciInstanceSpec, OciProfile, OciProvider, RestOciApi, SignerError,
};
use cloudrunner::provider::AddressKind;
use cloudrunner::run::{
    BootstrapPlan, LifecycleOrchestrator, RunError, RunReport, SessionOptions,
    builder_instance_name, default_image_name, host_name, oci_runner_name,
};
use cloudrunner::session::ssh::SshConnector;
use cloudrunner::session::{JIT_CONFIG_ENV, Secrets};

mod cli;

use cli::{
    Cli, GcpBuildImage, GcpCommand, GcpOverrides, OciBuildImage, OciCommand, OciOverrides,
    ProviderCommand,
};


#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid value for {field}: {message}")]
    InvalidOverride {
        field: &'static str,
        message: String,
    },
    #[error("{0} must be set to start a runner")]
    MissingSecret(&'static str),
    #[error("reading build script {path}: {message}")]
    Script { path: String, message: String },
    #[error("loading OCI credentials: {0}")]
    Credentials(#[from] SignerError),
    #[error("selecting runner image: {0}")]
    ImageLookup(#[source] OciError),
    #[error(transparent)]
    Gce(Box<RunError<GceError>>),
    #[error(transparent)]
    Oci(Box<RunError<OciError>>),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let cancel = cancel_on_interrupt();

    let exit_code = match dispatch(cli.provider, &cancel).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .init();
}

fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling the run");
            trigger.cancel();
        }
    });
    token
}

async fn dispatch(command: ProviderCommand, cancel: &CancellationToken) -> Result<(), CliError> {
    match command {
        ProviderCommand::Gcp(GcpCommand::Run(overrides)) => gcp_run(&overrides, cancel).await,
        ProviderCommand::Gcp(GcpCommand::BuildImage(args)) => gcp_build_image(&args, cancel).await,
        ProviderCommand::Oci(OciCommand::Run(overrides)) => oci_run(&overrides, cancel).await,
        ProviderCommand::Oci(OciCommand::BuildImage(args)) => oci_build_image(&args, cancel).await,
    }
}

async fn gcp_run(overrides: &GcpOverrides, cancel: &CancellationToken) -> Result<(), CliError> {
    let secrets = runner_secrets()?;
    let mut config = GceConfig::load_without_cli_args()?;
    apply_gcp_overrides(&mut config, overrides)?;
    let spec = config.instance_spec(&host_name())?;

    let metadata = MetadataServer::new();
    let project = config.resolve_project(&metadata).await?;
    let zone = config.resolve_zone(&metadata).await?;

    let report = run_gce(
        &config,
        GceTarget { project, zone, address: AddressKind::Internal },
        &spec,
        &BootstrapPlan::gce_runner(),
        secrets,
        cancel,
    )
    .await?;
    finish(&report);
    Ok(())
}

async fn gcp_build_image(args: &GcpBuildImage, cancel: &CancellationToken) -> Result<(), CliError> {
    let mut config = GceConfig::load_without_cli_args()?;
    apply_gcp_overrides(&mut config, &args.overrides)?;
    let now = Utc::now();
    let spec = config.instance_spec(&builder_instance_name(&host_name(), now))?;
    let image = image_name(args.image_name.as_deref(), now)?;
    let plan = BootstrapPlan::image_builder(read_script(&args.script)?, image);

    let project = config.resolve_project(&MetadataServer::new()).await?;
    let zone = config.zone_or_default();

    let report = run_gce(
        &config,
        GceTarget { project, zone, address: AddressKind::External },
        &spec,
        &plan,
        Secrets::new(),
        cancel,
    )
    .await?;
    finish(&report);
    Ok(())
}

struct GceTarget {
    project: String,
    zone: String,
    address: AddressKind,
}

async fn run_gce(
    config: &GceConfig,
    target: GceTarget,
    spec: &GceInstanceSpec,
    plan: &BootstrapPlan,
    secrets: Secrets,
    cancel: &CancellationToken,
) -> Result<RunReport, CliError> {
    info!(project = %target.project, zone = %target.zone, instance = %spec.name, "starting run");
    let provider = GceProvider::new(
        RestGceApi::new(TokenSource::from_env()),
        target.project,
        target.zone,
    );
    let session = SessionOptions::new(config.ssh_user.trim()).with_address(target.address);
    LifecycleOrchestrator::new(provider, SshConnector::new(), session)
        .execute(spec, plan, secrets, cancel)
        .await
        .map_err(|err| CliError::Gce(Box::new(err)))
}

async fn oci_run(overrides: &OciOverrides, cancel: &CancellationToken) -> Result<(), CliError> {
    let secrets = runner_secrets()?;
    let mut config = OciConfig::load_without_cli_args()?;
    apply_oci_overrides(&mut config, overrides)?;
    config.validate()?;
    let provider = oci_provider(&config)?;

    let image_id = match configured(config.image_id.as_deref()) {
        Some(id) => id,
        None => {
            provider
                .latest_image(&config.runner_image_os())
                .await
                .map_err(CliError::ImageLookup)?
                .id
        }
    };
    let spec = config.instance_spec(
        &oci_runner_name(config.arch.trim(), Utc::now()),
        &image_id,
        OCI_RUNNER_DEFAULTS,
    )?;

    let report = run_oci(
        &config,
        provider,
        &spec,
        &BootstrapPlan::oci_runner(),
        secrets,
        cancel,
    )
    .await?;
    finish(&report);
    Ok(())
}

async fn oci_build_image(args: &OciBuildImage, cancel: &CancellationToken) -> Result<(), CliError> {
    let mut config = OciConfig::load_without_cli_args()?;
    apply_oci_overrides(&mut config, &args.overrides)?;
    let base_image = configured(config.image_id.as_deref()).ok_or_else(|| {
        ConfigError::MissingField(String::from(
            "missing base image OCID: set OCI_RUNNER_IMAGE_ID or pass --image-id",
        ))
    })?;
    let now = Utc::now();
    let spec = config.instance_spec(
        &builder_instance_name(&host_name(), now),
        &base_image,
        OCI_IMAGE_BUILDER_DEFAULTS,
    )?;
    let image = image_name(args.image_name.as_deref(), now)?;
    let plan = BootstrapPlan::image_builder(read_script(&args.script)?, image);
    let provider = oci_provider(&config)?;

    let report = run_oci(&config, provider, &spec, &plan, Secrets::new(), cancel).await?;
    finish(&report);
    Ok(())
}

fn oci_provider(config: &OciConfig) -> Result<OciProvider<RestOciApi>, CliError> {
    let profile = OciProfile::load(config.config_file.trim(), config.profile.trim())?;
    let api = RestOciApi::from_profile(&profile)?;
    Ok(OciProvider::new(api, config.compartment_or(&profile.tenancy)))
}

async fn run_oci(
    config: &OciConfig,
    provider: OciProvider<RestOciApi>,
    spec: &OciInstanceSpec,
    plan: &BootstrapPlan,
    secrets: Secrets,
    cancel: &CancellationToken,
) -> Result<RunReport, CliError> {
    info!(
        availability_domain = %spec.availability_domain,
        instance = %spec.display_name,
        "starting run"
    );
    let session = SessionOptions::new(config.ssh_user.trim()).with_address(AddressKind::External);
    LifecycleOrchestrator::new(provider, SshConnector::new(), session)
        .execute(spec, plan, secrets, cancel)
        .await
        .map_err(|err| CliError::Oci(Box::new(err)))
}

fn runner_secrets() -> Result<Secrets, CliError> {
    if configured(env::var(JIT_CONFIG_ENV).ok().as_deref()).is_none() {
        return Err(CliError::MissingSecret(JIT_CONFIG_ENV));
    }
    Ok(Secrets::from_env(&[JIT_CONFIG_ENV]))
}

fn finish(report: &RunReport) {
    info!(
        instance = %report.instance_name,
        commands = report.outputs.len(),
        "run completed"
    );
    if let Some(image) = &report.image {
        writeln!(io::stdout(), "{}", image.reference).ok();
    }
}

fn configured(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

fn trimmed(value: &str, field: &'static str) -> Result<String, CliError> {
    configured(Some(value)).ok_or_else(|| CliError::InvalidOverride {
        field,
        message: String::from("value must not be empty"),
    })
}

fn override_field(
    target: &mut String,
    value: Option<&String>,
    field: &'static str,
) -> Result<(), CliError> {
    if let Some(raw) = value {
        *target = trimmed(raw, field)?;
    }
    Ok(())
}

fn override_optional(
    target: &mut Option<String>,
    value: Option<&String>,
    field: &'static str,
) -> Result<(), CliError> {
    if let Some(raw) = value {
        *target = Some(trimmed(raw, field)?);
    }
    Ok(())
}

fn positive(value: Option<f32>, field: &'static str) -> Result<Option<f32>, CliError> {
    match value {
        Some(size) if size.is_nan() || size <= 0.0 => Err(CliError::InvalidOverride {
            field,
            message: format!("{size} is not a positive number"),
        }),
        other => Ok(other),
    }
}

fn apply_gcp_overrides(config: &mut GceConfig, args: &GcpOverrides) -> Result<(), CliError> {
    override_optional(&mut config.zone, args.zone.as_ref(), "--zone")?;
    override_field(&mut config.image, args.image.as_ref(), "--image")?;
    override_field(&mut config.machine_type, args.machine_type.as_ref(), "--machine-type")?;
    override_optional(&mut config.project, args.project.as_ref(), "--project")
}

fn apply_oci_overrides(config: &mut OciConfig, args: &OciOverrides) -> Result<(), CliError> {
    override_field(&mut config.arch, args.arch.as_ref(), "--arch")?;
    override_field(
        &mut config.availability_domain,
        args.availability_domain.as_ref(),
        "--availability-domain",
    )?;
    override_optional(
        &mut config.compartment_id,
        args.compartment_id.as_ref(),
        "--compartment-id",
    )?;
    override_field(&mut config.subnet_id, args.subnet_id.as_ref(), "--subnet-id")?;
    override_optional(&mut config.shape, args.shape.as_ref(), "--shape")?;
    override_optional(&mut config.image_id, args.image_id.as_ref(), "--image-id")?;
    override_field(&mut config.profile, args.profile.as_ref(), "--profile")?;
    if let Some(ocpus) = positive(args.shape_ocpus, "--shape-ocpus")? {
        config.shape_ocpus = Some(ocpus);
    }
    if let Some(memory) = positive(args.shape_memory_in_gbs, "--shape-memory-in-gbs")? {
        config.shape_memory_in_gbs = Some(memory);
    }
    Ok(())
}

fn image_name(requested: Option<&str>, now: DateTime<Utc>) -> Result<String, CliError> {
    requested.map_or_else(
        || Ok(default_image_name(now)),
        |name| trimmed(name, "--image-name"),
    )
}

fn read_script(raw: &str) -> Result<Vec<u8>, CliError> {
    let path = Utf8Path::new(raw);
    let failure = |message: String| CliError::Script {
        path: raw.to_owned(),
        message,
    };
    let name = path
        .file_name()
        .ok_or_else(|| failure(String::from("path does not name a file")))?;
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let contents = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read(name))
        .map_err(|err| failure(err.to_string()))?;
    if contents.is_empty() {
        return Err(failure(String::from("script is empty")));
    }
    Ok(contents)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

//! Build script for generating the `cloudrunner` man pages.
//!
//! Writes `cloudrunner.1` plus one page per workflow (`cloudrunner-gcp-run.1`
//! and so on) to the build output directory. The top-level page gains an
//! ENVIRONMENT section listing the variables the configuration layer reads.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const ENVIRONMENT: &[(&str, &str)] = &[
    (
        "ACTIONS_RUNNER_INPUT_JITCONFIG",
        "Just-in-time runner configuration. Required by both run workflows and never logged.",
    ),
    ("RUNNER_ZONE", "Compute Engine zone. Discovered from the metadata server when unset."),
    ("RUNNER_PROJECT", "Compute Engine project. Falls back to GOOGLE_CLOUD_PROJECT, then the metadata server."),
    ("RUNNER_IMAGE", "Compute Engine source image or image family URL."),
    ("RUNNER_MACHINE_TYPE", "Compute Engine machine type."),
    ("GOOGLE_OAUTH_ACCESS_TOKEN", "Bearer token for the Compute Engine API. The metadata server issues one when unset."),
    ("OCI_RUNNER_AVAILABILITY_DOMAIN", "OCI availability domain. Required unless --availability-domain is given."),
    ("OCI_RUNNER_SUBNET_ID", "OCI subnet OCID. Required unless --subnet-id is given."),
    ("OCI_RUNNER_COMPARTMENT_ID", "OCI compartment OCID. Defaults to the profile tenancy."),
    ("OCI_RUNNER_SHAPE", "OCI shape. Runners default to VM.Standard.E2.2, image builds to VM.Standard.E5.Flex."),
    ("OCI_RUNNER_PROFILE", "Profile inside the OCI configuration file used to sign requests."),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    let mut command = Cli::command();
    command.build();

    let mut buffer = Vec::new();
    Man::new(command.clone()).render(&mut buffer)?;
    render_environment(&mut buffer)?;
    write_page(&out_dir, "cloudrunner", &buffer)?;

    for provider in command.get_subcommands() {
        for workflow in provider.get_subcommands() {
            render_workflow(&out_dir, workflow)?;
        }
    }

    Ok(())
}

fn render_environment(buffer: &mut Vec<u8>) -> std::io::Result<()> {
    writeln!(buffer, ".SH ENVIRONMENT")?;
    for (name, description) in ENVIRONMENT {
        writeln!(buffer, ".TP\n\\fB{name}\\fR\n{description}")?;
    }
    writeln!(
        buffer,
        ".PP\nValues may also be set in cloudrunner.toml under [gcp] or [oci]. \
         Command-line flags take precedence over both."
    )
}

fn render_workflow(out_dir: &Path, workflow: &Command) -> std::io::Result<()> {
    let name = workflow
        .get_display_name()
        .unwrap_or_else(|| workflow.get_name())
        .to_owned();
    let mut buffer = Vec::new();
    Man::new(workflow.clone()).render(&mut buffer)?;
    write_page(out_dir, &name, &buffer)
}

fn write_page(out_dir: &Path, name: &str, contents: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(out_dir.join(format!("{name}.1")))?;
    file.write_all(contents)
}

//! Bootstrap sequences and instance naming for the shipped workflows.

use std::env;

use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use chrono::{DateTime, Utc};

use crate::session::secret::placeholder;
use crate::session::JIT_CONFIG_ENV;

/// Timestamp layout appended to instance and image names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Remote file name of an uploaded image build script.
pub const BUILD_SCRIPT_NAME: &str = "build-image.sh";

const FALLBACK_HOST: &str = "cloudrunner";

/// One remote action of a bootstrap sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootstrapStep {
    /// Push a small file with the single-file copy protocol.
    Upload {
        /// Remote directory.
        dir: String,
        /// Remote file name.
        name: String,
        /// File contents.
        contents: Vec<u8>,
        /// Octal permission string such as `0755`.
        mode: String,
    },
    /// Run a command template; `${NAME}` placeholders are expanded on send.
    Run(String),
}

/// Ordered remote actions, optionally followed by stop and snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BootstrapPlan {
    /// Steps executed in order; the first failure aborts the rest.
    pub steps: Vec<BootstrapStep>,
    /// Image name to snapshot the boot disk under once the steps succeed.
    pub snapshot: Option<String>,
}

impl BootstrapPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command.
    #[must_use]
    pub fn run(mut self, command: impl Into<String>) -> Self {
        self.steps.push(BootstrapStep::Run(command.into()));
        self
    }

    /// Appends a file upload.
    #[must_use]
    pub fn upload(
        mut self,
        dir: impl Into<String>,
        name: impl Into<String>,
        contents: Vec<u8>,
        mode: impl Into<String>,
    ) -> Self {
        self.steps.push(BootstrapStep::Upload {
            dir: dir.into(),
            name: name.into(),
            contents,
            mode: mode.into(),
        });
        self
    }

    /// Stops the instance and snapshots it as `image` after the steps.
    #[must_use]
    pub fn snapshot_as(mut self, image: impl Into<String>) -> Self {
        self.snapshot = Some(image.into());
        self
    }

    /// Starts the pre-installed actions runner with the JIT configuration.
    #[must_use]
    pub fn gce_runner() -> Self {
        Self::new().run(format!(
            "/opt/actions-runner/run.sh --jitconfig \"{}\"",
            placeholder(JIT_CONFIG_ENV)
        ))
    }

    /// Unpacks the cached runner, moves the toolchains from `/etc/skel` into
    /// the login home and starts the runner inside the `docker` group.
    #[must_use]
    pub fn oci_runner() -> Self {
        let jit = placeholder(JIT_CONFIG_ENV);
        Self::new()
            .run("tar -zxf /opt/runner-cache/actions-runner-linux-*.tar.gz")
            .run("rm -rf \\$HOME")
            .run("sudo chown -R 1000:1000 /etc/skel/")
            .run("mv /etc/skel/.cargo /home/ubuntu/")
            .run("mv /etc/skel/.nvm /home/ubuntu/")
            .run("mv /etc/skel/.rustup /home/ubuntu/")
            .run("mv /etc/skel/.dotnet /home/ubuntu/")
            .run("mv /etc/skel/.composer /home/ubuntu/")
            .run(format!(
                "sudo usermod -aG docker ubuntu && newgrp docker <<EOF\n\
                 export PATH=$PATH:/home/ubuntu/.local/bin && export HOME=/home/ubuntu && \
                 export NVM_DIR=/home/ubuntu/.nvm && bash -x /home/ubuntu/run.sh --jitconfig \"{jit}\"\n\
                 EOF"
            ))
    }

    /// Uploads `script` to the login directory, runs it as root and
    /// snapshots the result as `image`.
    #[must_use]
    pub fn image_builder(script: Vec<u8>, image: impl Into<String>) -> Self {
        Self::new()
            .upload(".", BUILD_SCRIPT_NAME, script, "0755")
            .run(format!("sudo ./{BUILD_SCRIPT_NAME}"))
            .snapshot_as(image)
    }

    /// Returns the command templates in order, skipping uploads.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match step {
            BootstrapStep::Run(command) => Some(command.as_str()),
            BootstrapStep::Upload { .. } => None,
        })
    }
}

/// Formats `now` with [`TIMESTAMP_FORMAT`].
#[must_use]
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Returns this machine's host name.
///
/// Reads `HOSTNAME`, then the kernel's host name, and falls back to
/// `cloudrunner`.
#[must_use]
pub fn host_name() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(kernel_host_name)
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| String::from(FALLBACK_HOST))
}

fn kernel_host_name() -> Option<String> {
    Dir::open_ambient_dir("/proc/sys/kernel", ambient_authority())
        .and_then(|dir| dir.read_to_string("hostname"))
        .ok()
}

/// Name for a builder instance: `<host>-<timestamp>`.
#[must_use]
pub fn builder_instance_name(host: &str, now: DateTime<Utc>) -> String {
    format!("{host}-{}", timestamp(now))
}

/// Default golden image name: `gha-<timestamp>`.
#[must_use]
pub fn default_image_name(now: DateTime<Utc>) -> String {
    format!("gha-{}", timestamp(now))
}

/// Display name for an OCI runner: `gha-runner-<arch>-<timestamp>`.
#[must_use]
pub fn oci_runner_name(arch: &str, now: DateTime<Utc>) -> String {
    format!("gha-runner-{arch}-{}", timestamp(now))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 7, 12, 4, 9)
            .single()
            .unwrap_or_else(|| panic!("valid timestamp"))
    }

    #[test]
    fn gce_runner_keeps_the_jit_placeholder() {
        let plan = BootstrapPlan::gce_runner();
        assert_eq!(
            plan.commands().collect::<Vec<_>>(),
            vec!["/opt/actions-runner/run.sh --jitconfig \"${ACTIONS_RUNNER_INPUT_JITCONFIG}\""]
        );
        assert_eq!(plan.snapshot, None);
    }

    #[test]
    fn oci_runner_prepares_home_before_starting() {
        let plan = BootstrapPlan::oci_runner();
        let commands: Vec<_> = plan.commands().collect();

        assert_eq!(commands.len(), 9);
        assert_eq!(
            commands.first().copied(),
            Some("tar -zxf /opt/runner-cache/actions-runner-linux-*.tar.gz")
        );
        let last = commands.last().copied().unwrap_or_default();
        assert!(last.starts_with("sudo usermod -aG docker ubuntu && newgrp docker <<EOF\nexport PATH="));
        assert!(last.contains("--jitconfig \"${ACTIONS_RUNNER_INPUT_JITCONFIG}\"\nEOF"));
    }

    #[test]
    fn image_builder_uploads_then_runs_then_snapshots() {
        let plan = BootstrapPlan::image_builder(b"#!/bin/sh\n".to_vec(), "gha-20250307-120409");

        assert_eq!(
            plan.steps,
            vec![
                BootstrapStep::Upload {
                    dir: String::from("."),
                    name: String::from("build-image.sh"),
                    contents: b"#!/bin/sh\n".to_vec(),
                    mode: String::from("0755"),
                },
                BootstrapStep::Run(String::from("sudo ./build-image.sh")),
            ]
        );
        assert_eq!(plan.snapshot.as_deref(), Some("gha-20250307-120409"));
    }

    #[rstest]
    #[case(builder_instance_name("ci-host", noon()), "ci-host-20250307-120409")]
    #[case(default_image_name(noon()), "gha-20250307-120409")]
    #[case(oci_runner_name("arm", noon()), "gha-runner-arm-20250307-120409")]
    fn names_embed_the_utc_timestamp(#[case] actual: String, #[case] expected: &str) {
        assert_eq!(actual, expected);
    }

    #[test]
    fn host_name_is_never_empty() {
        assert!(!host_name().is_empty());
    }
}

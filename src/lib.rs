//! Core library for the `cloudrunner` disposable machine tool.
//!
//! The crate provisions one short-lived cloud virtual machine per run,
//! bootstraps it over SSH with an ephemeral key, optionally snapshots its
//! boot disk, and always deletes it (create → wait for readiness → dial →
//! bootstrap → destroy). Two providers are implemented: Compute Engine, whose
//! mutations return operations that are polled to completion, and Oracle
//! Cloud, whose instance resource itself is polled.

pub mod config;
pub mod dial;
pub mod gce;
pub mod http;
pub mod keypair;
pub mod oci;
pub mod poll;
pub mod provider;
pub mod run;
pub mod session;
pub mod test_support;

pub use config::{ConfigError, GceConfig, OciConfig};
pub use dial::{Connector, DialError, DialPolicy, DialTarget, RetryingDialer};
pub use gce::{GceError, GceInstanceSpec, GceProvider};
pub use keypair::{EphemeralKeyPair, KeyPairError};
pub use oci::{OciError, OciInstanceSpec, OciProvider};
pub use poll::PollPolicy;
pub use provider::{AddressKind, Image, Instance, InstanceState, NetworkInterface, Provider};
pub use run::{BootstrapPlan, LifecycleOrchestrator, RunError, RunReport, SessionOptions};
pub use session::{CommandError, CommandOutput, RemoteSession, Secrets, Transport};

//! Shared fixtures for lifecycle BDD scenarios.

use std::time::Duration;

use cloudrunner::gce::{GceInstanceSpec, GcePolicies, GceProvider};
use cloudrunner::session::JIT_CONFIG_ENV;
use cloudrunner::test_support::{FakeGceApi, ScriptedConnector, ScriptedTransport};
use cloudrunner::{
    BootstrapPlan, DialPolicy, LifecycleOrchestrator, PollPolicy, RunReport, Secrets,
    SessionOptions,
};
use rstest::fixture;

pub const JOB_SECRET: &str = "jit-7f3a-secret";

const FAST_POLL: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
const FAST_DIAL: DialPolicy = DialPolicy::new(Duration::from_secs(2), 3);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    KeyPair,
    Provision,
    Wait,
    Address,
    Dial,
    Command,
    Cancelled,
    Stop,
    Snapshot,
}

#[derive(Clone, Debug)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub step: Option<usize>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum RunOutcome {
    Success(Box<RunReport>),
    Failure(RunFailure),
}

#[derive(Clone, Debug)]
pub struct RunContext {
    pub api: FakeGceApi,
    pub transport: ScriptedTransport,
    pub connector: ScriptedConnector,
    pub plan: BootstrapPlan,
    pub outcome: Option<RunOutcome>,
}

impl RunContext {
    pub fn orchestrator(&self) -> LifecycleOrchestrator<GceProvider<FakeGceApi>, ScriptedConnector> {
        let provider = GceProvider::new(self.api.clone(), "ci-project", "us-central1-a")
            .with_policies(GcePolicies {
                zone_operation: FAST_POLL,
                global_operation: FAST_POLL,
                instance_ready: FAST_POLL,
            });
        LifecycleOrchestrator::new(provider, self.connector.clone(), SessionOptions::new("gha"))
            .with_dial_policy(FAST_DIAL)
    }

    pub fn spec() -> GceInstanceSpec {
        GceInstanceSpec {
            name: String::from("ci-runner-1"),
            machine_type: String::from("n1-standard-4"),
            source_image: String::from(
                "projects/ubuntu-os-cloud/global/images/family/ubuntu-minimal-2404-lts-amd64",
            ),
            network: String::from("default"),
        }
    }

    pub fn secrets() -> Secrets {
        Secrets::new().with(JIT_CONFIG_ENV, JOB_SECRET)
    }

    pub fn report(&self) -> Option<&RunReport> {
        match &self.outcome {
            Some(RunOutcome::Success(report)) => Some(report),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match &self.outcome {
            Some(RunOutcome::Failure(failure)) => Some(failure),
            _ => None,
        }
    }
}

#[fixture]
pub fn run_context() -> RunContext {
    let transport = ScriptedTransport::new();
    RunContext {
        api: FakeGceApi::new(),
        connector: ScriptedConnector::new(transport.clone()),
        transport,
        plan: BootstrapPlan::gce_runner(),
        outcome: None,
    }
}

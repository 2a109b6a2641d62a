//! BDD scenarios for the lifecycle orchestrator.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RunContext, run_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failing bootstrap command stops the sequence and deletes the instance"
)]
fn scenario_failing_command(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A runner start masks the job secret in its output"
)]
fn scenario_masked_secret(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "An instance that stops while booting is deleted once"
)]
fn scenario_wait_failure(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "SSH that never answers exhausts the dial budget"
)]
fn scenario_dial_exhausted(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "SSH that answers late still bootstraps"
)]
fn scenario_dial_recovers(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "An image build stops and snapshots the instance before deleting it"
)]
fn scenario_image_build(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failed delete is reported without failing the run"
)]
fn scenario_cleanup_failure(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failed teardown of an instance that never started is not repeated"
)]
fn scenario_failed_discard(run_context: RunContext) {
    let _ = run_context;
}

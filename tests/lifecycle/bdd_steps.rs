//! BDD step definitions for the lifecycle orchestrator.

use cloudrunner::test_support::gce_operation;
use cloudrunner::{BootstrapPlan, GceError, RunError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    FailureKind, JOB_SECRET, RunContext, RunFailure, RunOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message()))
    }
}

#[given("a compute engine provider")]
fn compute_engine_provider(run_context: RunContext) -> RunContext {
    run_context
}

#[given("the create operation is done after \"{polls}\" polls")]
fn operation_done_after(mut run_context: RunContext, polls: u32) -> RunContext {
    run_context.api = run_context
        .api
        .clone()
        .with_operation_polls(polls.saturating_sub(1));
    run_context
}

#[given("the instance reports internal address \"{address}\"")]
fn internal_address(mut run_context: RunContext, address: String) -> RunContext {
    run_context.api = run_context
        .api
        .clone()
        .with_addresses(Some(&address), None);
    run_context
}

#[given("a bootstrap plan of \"{first}\", \"{second}\" and \"{third}\"")]
fn three_command_plan(
    mut run_context: RunContext,
    first: String,
    second: String,
    third: String,
) -> RunContext {
    run_context.plan = BootstrapPlan::new().run(first).run(second).run(third);
    run_context
}

#[given("remote command \"{step}\" exits with status \"{status}\"")]
fn command_exits_with(run_context: RunContext, step: usize, status: u32) -> RunContext {
    for _ in 1..step {
        run_context.transport.push_output(0, "ok");
    }
    run_context.transport.push_output(status, "failed");
    run_context
}

#[given("the runner prints the job secret")]
fn runner_prints_secret(run_context: RunContext) -> RunContext {
    run_context
        .transport
        .push_output(0, &format!("runner configured with {JOB_SECRET}"));
    run_context
}

#[given("the instance stops while booting")]
fn instance_stops_while_booting(mut run_context: RunContext) -> RunContext {
    run_context.api = run_context
        .api
        .clone()
        .with_statuses(&["STAGING", "STOPPING"]);
    run_context
}

#[given("ssh refuses every connection")]
fn ssh_refuses(mut run_context: RunContext) -> RunContext {
    run_context.connector = run_context.connector.clone().failing_first(u32::MAX);
    run_context
}

#[given("ssh refuses the first \"{failures}\" connections")]
fn ssh_refuses_first(mut run_context: RunContext, failures: u32) -> RunContext {
    run_context.connector = run_context.connector.clone().failing_first(failures);
    run_context
}

#[given("an image build plan for \"{image}\"")]
fn image_build_plan(mut run_context: RunContext, image: String) -> RunContext {
    run_context.transport.push_raw(Some(0), vec![0, 0, 0]);
    run_context.transport.push_output(0, "image built");
    run_context.plan = BootstrapPlan::image_builder(b"#!/bin/sh\necho build\n".to_vec(), image);
    run_context
}

#[given("deleting the instance fails with \"{message}\"")]
fn delete_fails(mut run_context: RunContext, message: String) -> RunContext {
    run_context.api = run_context
        .api
        .clone()
        .fail_operation(gce_operation::DELETE, &message);
    run_context
}

#[when("the run executes")]
fn run_executes(run_context: RunContext) -> Result<RunContext, StepError> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let orchestrator = run_context.orchestrator();
    let plan = run_context.plan.clone();

    let result = runtime.block_on(async move {
        orchestrator
            .execute(
                &RunContext::spec(),
                &plan,
                RunContext::secrets(),
                &CancellationToken::new(),
            )
            .await
    });
    let outcome = match result {
        Ok(report) => RunOutcome::Success(Box::new(report)),
        Err(err) => RunOutcome::Failure(RunFailure {
            kind: failure_kind(&err),
            step: match &err {
                RunError::Command { step, .. } => Some(*step),
                _ => None,
            },
            message: err.to_string(),
        }),
    };

    Ok(RunContext {
        outcome: Some(outcome),
        ..run_context
    })
}

#[then("the run succeeds")]
fn run_succeeds(run_context: &RunContext) -> Result<(), StepError> {
    match &run_context.outcome {
        Some(RunOutcome::Success(_)) => Ok(()),
        Some(RunOutcome::Failure(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the run fails with kind \"{kind}\"")]
fn run_fails_with(run_context: &RunContext, kind: String) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)?;
    let failure = run_context
        .failure()
        .ok_or_else(|| StepError::Assertion(String::from("expected failure outcome")))?;
    check(failure.kind == expected, || {
        format!(
            "expected failure kind {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )
    })
}

#[then("the failing step is \"{step}\"")]
fn failing_step(run_context: &RunContext, step: usize) -> Result<(), StepError> {
    let actual = run_context.failure().and_then(|failure| failure.step);
    check(actual == Some(step), || {
        format!("expected failing step {step}, got {actual:?}")
    })
}

#[then("ssh was dialed at \"{address}\"")]
fn dialed_at(run_context: &RunContext, address: String) -> Result<(), StepError> {
    let attempts = run_context.connector.attempts();
    check(
        !attempts.is_empty() && attempts.iter().all(|attempt| attempt.address == address),
        || format!("expected dials to {address}, got {attempts:?}"),
    )
}

#[then("ssh was dialed \"{count}\" times")]
fn dialed_times(run_context: &RunContext, count: usize) -> Result<(), StepError> {
    let actual = run_context.connector.attempts().len();
    check(actual == count, || {
        format!("expected {count} dial attempts, got {actual}")
    })
}

#[then("no ssh connection was attempted")]
fn no_dial(run_context: &RunContext) -> Result<(), StepError> {
    let attempts = run_context.connector.attempts();
    check(attempts.is_empty(), || {
        format!("expected no dial attempts, got {attempts:?}")
    })
}

#[then("\"{count}\" remote commands ran")]
fn commands_ran(run_context: &RunContext, count: usize) -> Result<(), StepError> {
    let executed = run_context.transport.executed();
    check(executed.len() == count, || {
        format!("expected {count} commands, got {executed:?}")
    })
}

#[then("the instance was deleted exactly once")]
fn deleted_once(run_context: &RunContext) -> Result<(), StepError> {
    let deletes = run_context.api.count("delete_instance");
    check(deletes == 1, || {
        format!("expected exactly one delete, got {deletes}")
    })
}

#[then("the reported output does not contain the job secret")]
fn output_masked(run_context: &RunContext) -> Result<(), StepError> {
    let report = run_context
        .report()
        .ok_or_else(|| StepError::Assertion(String::from("expected a report")))?;
    check(
        !report.outputs.is_empty()
            && report
                .outputs
                .iter()
                .all(|out| !out.output.contains(JOB_SECRET) && !out.command.contains(JOB_SECRET)),
        || format!("secret leaked into {:?}", report.outputs),
    )
}

#[then("the sent command carried the job secret")]
fn command_carried_secret(run_context: &RunContext) -> Result<(), StepError> {
    let executed = run_context.transport.executed();
    check(
        executed
            .iter()
            .any(|record| record.command.contains(JOB_SECRET)),
        || String::from("no executed command carried the expanded secret"),
    )
}

#[then("the run produced image \"{image}\"")]
fn produced_image(run_context: &RunContext, image: String) -> Result<(), StepError> {
    let produced = run_context
        .report()
        .and_then(|report| report.image.as_ref())
        .map(|created| created.name.clone());
    check(produced.as_deref() == Some(image.as_str()), || {
        format!("expected image {image}, got {produced:?}")
    })
}

#[then("the instance was stopped before the image was created")]
fn stopped_before_image(run_context: &RunContext) -> Result<(), StepError> {
    let calls = run_context.api.calls();
    let position = |name: &str| calls.iter().position(|call| call == name);
    let (stop, image, delete) = (
        position("stop_instance"),
        position("insert_image"),
        position("delete_instance"),
    );
    check(
        stop.is_some() && stop < image && image < delete,
        || format!("unexpected call order: {calls:?}"),
    )
}

#[then("the cleanup failure mentions \"{text}\"")]
fn cleanup_mentions(run_context: &RunContext, text: String) -> Result<(), StepError> {
    let cleanup = run_context
        .report()
        .and_then(|report| report.cleanup.as_ref())
        .ok_or_else(|| StepError::Assertion(String::from("expected a cleanup failure")))?;
    check(cleanup.message.contains(&text), || {
        format!("cleanup message {:?} lacks {text:?}", cleanup.message)
    })
}

const fn failure_kind(err: &RunError<GceError>) -> FailureKind {
    match err {
        RunError::KeyPair(_) => FailureKind::KeyPair,
        RunError::Provision(_) => FailureKind::Provision,
        RunError::Wait { .. } => FailureKind::Wait,
        RunError::AddressResolution { .. } => FailureKind::Address,
        RunError::Dial { .. } => FailureKind::Dial,
        RunError::Command { .. } => FailureKind::Command,
        RunError::Cancelled { .. } => FailureKind::Cancelled,
        RunError::Stop { .. } => FailureKind::Stop,
        RunError::Snapshot { .. } => FailureKind::Snapshot,
    }
}

fn parse_failure_kind(kind: &str) -> Result<FailureKind, StepError> {
    match kind {
        "keypair" => Ok(FailureKind::KeyPair),
        "provision" => Ok(FailureKind::Provision),
        "wait" => Ok(FailureKind::Wait),
        "address" => Ok(FailureKind::Address),
        "dial" => Ok(FailureKind::Dial),
        "command" => Ok(FailureKind::Command),
        "cancelled" => Ok(FailureKind::Cancelled),
        "stop" => Ok(FailureKind::Stop),
        "snapshot" => Ok(FailureKind::Snapshot),
        _ => Err(StepError::Assertion(format!("unknown failure kind: {kind}"))),
    }
}

//! Unit tests for the Compute Engine provider.

use std::time::Duration;

use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_support::{FakeGceApi, gce_operation};

const FAST: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));

#[fixture]
fn spec() -> GceInstanceSpec {
    GceInstanceSpec {
        name: String::from("runner-1"),
        machine_type: String::from("n1-standard-4"),
        source_image: String::from("projects/ubuntu-os-cloud/global/images/family/ubuntu-2404"),
        network: String::from("default"),
    }
}

fn key() -> AuthorizedKey {
    AuthorizedKey {
        user: String::from("gha"),
        openssh: String::from("ecdsa-sha2-nistp384 AAAAE2VjZHNh"),
    }
}

fn provider(api: &FakeGceApi) -> GceProvider<FakeGceApi> {
    GceProvider::new(api.clone(), "ci-project", "us-central1-a").with_policies(GcePolicies {
        zone_operation: FAST,
        global_operation: FAST,
        instance_ready: FAST,
    })
}

async fn created(api: &FakeGceApi, spec: &GceInstanceSpec) -> Instance {
    provider(api)
        .create(spec, &key(), &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"))
}

#[rstest]
fn insert_request_carries_the_ssh_key_and_nat(spec: GceInstanceSpec) {
    let resource = spec.to_resource("us-central1-a", &key());

    assert_eq!(
        resource.machine_type,
        "zones/us-central1-a/machineTypes/n1-standard-4"
    );
    let metadata = resource
        .metadata
        .unwrap_or_else(|| panic!("metadata should be set"));
    assert_eq!(
        metadata.items,
        vec![MetadataItem {
            key: String::from("ssh-keys"),
            value: String::from("gha:ecdsa-sha2-nistp384 AAAAE2VjZHNh"),
        }]
    );
    let nic = resource
        .network_interfaces
        .first()
        .unwrap_or_else(|| panic!("one network interface"));
    assert_eq!(nic.network.as_deref(), Some("global/networks/default"));
    assert_eq!(
        nic.access_configs.first().map(|config| config.kind.as_str()),
        Some("ONE_TO_ONE_NAT")
    );
    assert!(resource.disks.iter().all(|disk| disk.boot && disk.auto_delete));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_waits_for_the_insert_operation(spec: GceInstanceSpec) {
    let api = FakeGceApi::new().with_operation_polls(2);

    let instance = created(&api, &spec).await;

    assert_eq!(api.count("get_zone_operation"), 3);
    assert_eq!(instance.id, "4242");
    assert_eq!(instance.name, "runner-1");
    assert_eq!(instance.location, "us-central1-a");
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(
        instance.boot_disk.as_deref(),
        Some("zones/us-central1-a/disks/runner-1")
    );
}

#[rstest]
#[tokio::test]
async fn rejected_inserts_are_provision_errors(spec: GceInstanceSpec) {
    let api = FakeGceApi::new().fail_insert(ApiError::Status {
        resource: String::from("instances"),
        status: 403,
        message: String::from("QUOTA_EXCEEDED"),
    });

    let err = provider(&api)
        .create(&spec, &key(), &CancellationToken::new())
        .await
        .expect_err("insert should be rejected");

    assert!(matches!(err, GceError::Provision { ref instance, .. } if instance == "runner-1"));
    assert_eq!(api.count("delete_instance"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_insert_operations_delete_the_partial_instance(spec: GceInstanceSpec) {
    let api = FakeGceApi::new().fail_operation(gce_operation::INSERT, "disk quota exhausted");

    let err = provider(&api)
        .create(&spec, &key(), &CancellationToken::new())
        .await
        .expect_err("operation should fail");

    assert!(matches!(
        err,
        GceError::OperationFailed { action: "insert", ref message, .. }
            if message.contains("disk quota exhausted")
    ));
    assert_eq!(api.deleted(), vec![String::from("runner-1")]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn wait_ready_resolves_both_addresses(spec: GceInstanceSpec) {
    let api = FakeGceApi::new()
        .with_statuses(&["STAGING", "PROVISIONING", "RUNNING"])
        .with_addresses(Some("10.0.0.5"), Some("34.70.1.2"));
    let gce = provider(&api);
    let mut instance = created(&api, &spec).await;

    gce.wait_ready(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("wait_ready should succeed: {err}"));

    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(
        gce.resolve_internal_address(&instance).as_deref(),
        Some("10.0.0.5")
    );
    assert_eq!(
        gce.resolve_external_address(&instance).as_deref(),
        Some("34.70.1.2")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unexpected_status_deletes_once(spec: GceInstanceSpec) {
    let api = FakeGceApi::new().with_statuses(&["PROVISIONING", "PROVISIONING", "STOPPING"]);
    let gce = provider(&api);
    let mut instance = created(&api, &spec).await;

    let err = gce
        .wait_ready(&mut instance, &CancellationToken::new())
        .await
        .expect_err("a stopping instance is not ready");
    assert!(matches!(err, GceError::UnexpectedStatus { ref status, .. } if status == "STOPPING"));
    assert_eq!(instance.state, InstanceState::Terminated);

    gce.delete(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("cleanup after teardown should be a no-op: {err}"));
    assert_eq!(api.count("delete_instance"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_teardown_after_a_failed_start_is_not_repeated(spec: GceInstanceSpec) {
    let api = FakeGceApi::new()
        .with_statuses(&["STAGING", "STOPPING"])
        .fail_operation(gce_operation::DELETE, "resource in use");
    let gce = provider(&api);
    let mut instance = created(&api, &spec).await;

    gce.wait_ready(&mut instance, &CancellationToken::new())
        .await
        .expect_err("a stopping instance is not ready");
    assert_eq!(instance.state, InstanceState::Failed);

    gce.delete(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("a failed teardown is not retried: {err}"));
    assert_eq!(api.count("delete_instance"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stuck_instances_time_out_and_are_deleted(spec: GceInstanceSpec) {
    let api = FakeGceApi::new().with_statuses(&["PROVISIONING"]);
    let gce = provider(&api);
    let mut instance = created(&api, &spec).await;

    let err = gce
        .wait_ready(&mut instance, &CancellationToken::new())
        .await
        .expect_err("wait should time out");

    assert!(matches!(
        err,
        GceError::PollTimeout { action: "wait ready", waited, .. } if waited == FAST.timeout
    ));
    assert_eq!(api.deleted(), vec![String::from("runner-1")]);
    assert_eq!(instance.state, InstanceState::Terminated);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancelled_waits_still_delete_with_a_fresh_token(spec: GceInstanceSpec) {
    let api = FakeGceApi::new();
    let gce = provider(&api);
    let mut instance = created(&api, &spec).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = gce
        .wait_ready(&mut instance, &cancel)
        .await
        .expect_err("cancelled wait should fail");

    assert!(matches!(err, GceError::Cancelled { action: "wait ready", .. }));
    assert_eq!(api.count("delete_instance"), 1);
    assert_eq!(instance.state, InstanceState::Terminated);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deleting_a_missing_instance_succeeds(spec: GceInstanceSpec) {
    let api = FakeGceApi::new();
    let gce = provider(&api);
    let mut first = created(&api, &spec).await;
    let mut stale = first.clone();

    gce.delete(&mut first, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));
    gce.delete(&mut stale, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("not-found should count as deleted: {err}"));

    assert_eq!(first.state, InstanceState::Terminated);
    assert_eq!(stale.state, InstanceState::Terminated);
    assert_eq!(api.count("delete_instance"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stop_then_snapshot_the_boot_disk(spec: GceInstanceSpec) {
    let api = FakeGceApi::new().with_operation_polls(1);
    let gce = provider(&api);
    let mut instance = created(&api, &spec).await;

    gce.stop(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("stop should succeed: {err}"));
    assert_eq!(instance.state, InstanceState::Stopped);

    let image = gce
        .snapshot(&instance, "golden-20250101", &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("snapshot should succeed: {err}"));

    assert_eq!(image.name, "golden-20250101");
    assert_eq!(
        image.reference,
        "https://www.googleapis.com/compute/v1/projects/ci-project/global/images/golden-20250101"
    );
    assert_eq!(api.count("get_global_operation"), 2);
}

#[tokio::test]
async fn snapshots_need_a_boot_disk() {
    let api = FakeGceApi::new();
    let instance = Instance {
        id: String::from("1"),
        name: String::from("diskless"),
        location: String::from("us-central1-a"),
        state: InstanceState::Stopped,
        interfaces: Vec::new(),
        boot_disk: None,
    };

    let err = provider(&api)
        .snapshot(&instance, "golden", &CancellationToken::new())
        .await
        .expect_err("snapshot without a disk should fail");

    assert!(matches!(err, GceError::MissingBootDisk { .. }));
    assert_eq!(api.count("insert_image"), 0);
}

#[rstest]
#[case("RUNNING", InstanceState::Running)]
#[case("STAGING", InstanceState::Provisioning)]
#[case("STOPPING", InstanceState::Stopping)]
#[case("TERMINATED", InstanceState::Stopped)]
#[case("", InstanceState::Requested)]
fn statuses_map_onto_the_shared_state_machine(#[case] status: &str, #[case] state: InstanceState) {
    assert_eq!(state_from_status(status), state);
}

//! Unit tests for the OCI provider.

use std::time::Duration;

use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::api::Vnic;
use super::*;
use crate::http::ApiError;
use crate::test_support::{FAKE_OCI_INSTANCE_ID, FakeOciApi};

const FAST: PollPolicy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));

#[fixture]
fn spec() -> OciInstanceSpec {
    OciInstanceSpec {
        display_name: String::from("gha-runner-x86-20250101-000000"),
        availability_domain: String::from("bzBe:US-SANJOSE-1-AD-1"),
        shape: String::from("VM.Standard.E5.Flex"),
        subnet_id: String::from("ocid1.subnet.oc1..runner"),
        image_id: String::from("ocid1.image.oc1..ubuntu"),
        ocpus: Some(4.0),
        memory_in_gbs: Some(16.0),
        boot_volume_size_in_gbs: Some(600),
        assign_public_ip: None,
    }
}

fn key() -> AuthorizedKey {
    AuthorizedKey {
        user: String::from("ubuntu"),
        openssh: String::from("ecdsa-sha2-nistp384 AAAAE2VjZHNh"),
    }
}

fn provider(api: &FakeOciApi) -> OciProvider<FakeOciApi> {
    OciProvider::new(api.clone(), "ocid1.compartment.oc1..ci").with_policies(OciPolicies {
        instance_state: FAST,
        image_state: FAST,
    })
}

async fn launched(api: &FakeOciApi, spec: &OciInstanceSpec) -> Instance {
    provider(api)
        .create(spec, &key(), &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"))
}

#[rstest]
fn launch_details_carry_key_and_shape(spec: OciInstanceSpec) {
    let details = spec.to_details("ocid1.compartment.oc1..ci", &key());

    assert_eq!(
        details.metadata.get("ssh_authorized_keys").map(String::as_str),
        Some("ecdsa-sha2-nistp384 AAAAE2VjZHNh")
    );
    assert_eq!(
        details.shape_config,
        Some(ShapeConfig {
            ocpus: Some(4.0),
            memory_in_gbs: Some(16.0),
        })
    );
    assert_eq!(details.source_details.boot_volume_size_in_gbs, Some(600));
    assert_eq!(details.source_details.source_type, "image");
}

#[rstest]
fn unset_shape_sizes_omit_the_shape_config(mut spec: OciInstanceSpec) {
    spec.ocpus = Some(0.0);
    spec.memory_in_gbs = None;

    assert_eq!(spec.to_details("c", &key()).shape_config, None);
}

#[rstest]
#[tokio::test]
async fn create_returns_the_provisioning_instance(spec: OciInstanceSpec) {
    let api = FakeOciApi::new();

    let instance = launched(&api, &spec).await;

    assert_eq!(instance.id, FAKE_OCI_INSTANCE_ID);
    assert_eq!(instance.location, "bzBe:US-SANJOSE-1-AD-1");
    assert_eq!(instance.state, InstanceState::Provisioning);
    assert!(instance.interfaces.is_empty());
}

#[rstest]
#[tokio::test]
async fn rejected_launches_are_provision_errors(spec: OciInstanceSpec) {
    let api = FakeOciApi::new().fail_launch(ApiError::Status {
        resource: String::from("instances"),
        status: 400,
        message: String::from("LimitExceeded"),
    });

    let err = provider(&api)
        .create(&spec, &key(), &CancellationToken::new())
        .await
        .expect_err("launch should be rejected");

    assert!(matches!(err, OciError::Provision { .. }));
    assert!(api.terminated().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn wait_ready_collects_vnic_addresses(spec: OciInstanceSpec) {
    let api = FakeOciApi::new()
        .with_states(&["PROVISIONING", "STARTING", "RUNNING"])
        .with_vnics(vec![
            Vnic {
                id: String::from("ocid1.vnic.oc1..broken"),
                private_ip: Some(String::from("10.0.9.9")),
                public_ip: None,
            },
            Vnic {
                id: String::from("ocid1.vnic.oc1..primary"),
                private_ip: Some(String::from("10.0.0.5")),
                public_ip: Some(String::from("129.146.1.2")),
            },
        ])
        .with_unreadable_vnic("ocid1.vnic.oc1..broken");
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;

    oci.wait_ready(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("wait_ready should succeed: {err}"));

    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.interfaces.len(), 1);
    assert_eq!(oci.resolve_internal_address(&instance).as_deref(), Some("10.0.0.5"));
    assert_eq!(
        oci.resolve_external_address(&instance).as_deref(),
        Some("129.146.1.2")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn terminated_while_waiting_fails_and_cleans_up(spec: OciInstanceSpec) {
    let api = FakeOciApi::new().with_states(&["PROVISIONING", "TERMINATING"]);
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;

    let err = oci
        .wait_ready(&mut instance, &CancellationToken::new())
        .await
        .expect_err("terminating instance is not ready");

    assert!(matches!(
        err,
        OciError::UnexpectedState { action: "wait ready", ref state, .. } if state == "TERMINATING"
    ));
    assert_eq!(api.terminated(), vec![String::from(FAKE_OCI_INSTANCE_ID)]);
    assert_eq!(instance.state, InstanceState::Terminated);

    oci.delete(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("second delete should be a no-op: {err}"));
    assert_eq!(api.count("terminate_instance"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_teardown_while_waiting_is_not_repeated(spec: OciInstanceSpec) {
    let api = FakeOciApi::new()
        .with_states(&["PROVISIONING", "TERMINATING"])
        .fail_terminate(ApiError::Status {
            resource: String::from(FAKE_OCI_INSTANCE_ID),
            status: 409,
            message: String::from("Conflict"),
        });
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;

    oci.wait_ready(&mut instance, &CancellationToken::new())
        .await
        .expect_err("terminating instance is not ready");
    assert_eq!(instance.state, InstanceState::Failed);

    oci.delete(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("a failed teardown is not retried: {err}"));
    assert_eq!(api.count("terminate_instance"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stuck_instances_time_out(spec: OciInstanceSpec) {
    let api = FakeOciApi::new().with_states(&["PROVISIONING"]);
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;

    let err = oci
        .wait_ready(&mut instance, &CancellationToken::new())
        .await
        .expect_err("wait should time out");

    assert!(matches!(err, OciError::PollTimeout { action: "wait ready", .. }));
    assert_eq!(api.count("terminate_instance"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn delete_polls_until_terminated(spec: OciInstanceSpec) {
    let api = FakeOciApi::new();
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;

    oci.delete(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));

    assert_eq!(instance.state, InstanceState::Terminated);
    assert_eq!(api.count("get_instance"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn not_found_while_terminating_counts_as_deleted(spec: OciInstanceSpec) {
    let api = FakeOciApi::new().gone_after_terminate();
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;
    let mut stale = instance.clone();

    oci.delete(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("vanishing instance should count as deleted: {err}"));
    oci.delete(&mut stale, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("terminating a missing instance should succeed: {err}"));

    assert_eq!(stale.state, InstanceState::Terminated);
    assert_eq!(api.count("terminate_instance"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stop_then_snapshot(spec: OciInstanceSpec) {
    let api = FakeOciApi::new().with_image_states(&["PROVISIONING", "PROVISIONING", "AVAILABLE"]);
    let oci = provider(&api);
    let mut instance = launched(&api, &spec).await;

    oci.stop(&mut instance, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("stop should succeed: {err}"));
    assert_eq!(instance.state, InstanceState::Stopped);

    let image = oci
        .snapshot(&instance, "golden", &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("snapshot should succeed: {err}"));

    assert_eq!(image.id, "ocid1.image.oc1..fake");
    assert_eq!(image.reference, image.id);
    assert_eq!(api.count("get_image"), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deleted_images_fail_the_snapshot(spec: OciInstanceSpec) {
    let api = FakeOciApi::new().with_image_states(&["PROVISIONING", "DELETED"]);
    let oci = provider(&api);
    let instance = launched(&api, &spec).await;

    let err = oci
        .snapshot(&instance, "golden", &CancellationToken::new())
        .await
        .expect_err("deleted image should fail");

    assert!(matches!(err, OciError::UnexpectedState { action: "create image", .. }));
}

#[tokio::test]
async fn latest_image_requires_a_match() {
    let api = FakeOciApi::new();

    let err = provider(&api)
        .latest_image("Canonical Ubuntu")
        .await
        .expect_err("no image configured");

    assert!(matches!(err, OciError::NoImage { ref operating_system } if operating_system == "Canonical Ubuntu"));
}

#[tokio::test]
async fn latest_image_returns_the_newest_match() {
    let api = FakeOciApi::new().with_latest_image(super::api::ImageResource {
        id: String::from("ocid1.image.oc1..noble"),
        display_name: Some(String::from("Canonical-Ubuntu-24.04-2025.01.01-0")),
        lifecycle_state: String::from("AVAILABLE"),
        operating_system: Some(String::from("Canonical Ubuntu")),
    });

    let image = provider(&api)
        .latest_image("Canonical Ubuntu")
        .await
        .unwrap_or_else(|err| panic!("lookup should succeed: {err}"));

    assert_eq!(image.id, "ocid1.image.oc1..noble");
    assert_eq!(image.name, "Canonical-Ubuntu-24.04-2025.01.01-0");
}

#[rstest]
#[case("PROVISIONING", InstanceState::Provisioning)]
#[case("RUNNING", InstanceState::Running)]
#[case("CREATING_IMAGE", InstanceState::Stopped)]
#[case("TERMINATED", InstanceState::Terminated)]
#[case("", InstanceState::Requested)]
fn lifecycle_states_map_onto_the_shared_state_machine(
    #[case] state: &str,
    #[case] expected: InstanceState,
) {
    assert_eq!(state_from_lifecycle(state), expected);
}

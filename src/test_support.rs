//! Test support utilities shared across unit and integration tests.
//!
//! The fakes here stand in for the network edges of a run: the SSH
//! connection ([`ScriptedTransport`], [`ScriptedConnector`]) and the two
//! cloud APIs ([`FakeGceApi`], [`FakeOciApi`]). Each fake is cheap to clone
//! and clones share state, so a test can hand one copy to the code under
//! test and inspect the other afterwards.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, sleep};
use tracing::subscriber::DefaultGuard;

use crate::dial::{Connector, DialTarget};
use crate::gce::api::{
    AttachedDisk, GceApi, ImageResource as GceImage, InstanceResource as GceInstance,
    NetworkInterfaceResource, Operation, OperationErrorEntry, OperationErrors,
};
use crate::http::ApiError;
use crate::keypair::SshCredentials;
use crate::oci::api::{
    CreateImageDetails, ImageResource as OciImage, InstanceResource as OciInstance,
    LaunchInstanceDetails, OciApi, Vnic, VnicAttachment,
};
use crate::session::{ExecOutput, Transport, TransportError, TransportFuture};

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(resource: &str) -> ApiError {
    ApiError::NotFound {
        resource: resource.to_owned(),
    }
}

#[derive(Debug)]
enum ScriptedExec {
    Output(ExecOutput),
    Error(TransportError),
    Panic(String),
}

/// One call made through [`ScriptedTransport::exec`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecRecord {
    /// Command string as sent to the remote side.
    pub command: String,
    /// Bytes written to standard input, if any.
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct TransportState {
    responses: VecDeque<ScriptedExec>,
    executed: Vec<ExecRecord>,
    closed: bool,
}

/// Transport that replays pre-seeded results in FIFO order.
///
/// When the queue is empty every command succeeds with exit status 0 and no
/// output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    state: Arc<StdMutex<TransportState>>,
}

impl ScriptedTransport {
    /// Creates a transport with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a command exiting with `status` and printing `output`.
    pub fn push_output(&self, status: u32, output: &str) {
        self.push_raw(Some(status), output.as_bytes().to_vec());
    }

    /// Queues raw output with an optional exit status.
    pub fn push_raw(&self, status: Option<u32>, output: Vec<u8>) {
        lock(&self.state)
            .responses
            .push_back(ScriptedExec::Output(ExecOutput {
                exit_status: status,
                output,
            }));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: TransportError) {
        lock(&self.state)
            .responses
            .push_back(ScriptedExec::Error(error));
    }

    /// Queues a panic raised while the command runs.
    pub fn push_panic(&self, message: &str) {
        lock(&self.state)
            .responses
            .push_back(ScriptedExec::Panic(message.to_owned()));
    }

    /// Returns every command executed so far.
    #[must_use]
    pub fn executed(&self) -> Vec<ExecRecord> {
        lock(&self.state).executed.clone()
    }

    /// Returns `true` once [`Transport::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Transport for ScriptedTransport {
    fn exec<'a>(
        &'a self,
        command: &'a str,
        stdin: Option<&'a [u8]>,
    ) -> TransportFuture<'a, ExecOutput> {
        let next = {
            let mut state = lock(&self.state);
            state.executed.push(ExecRecord {
                command: command.to_owned(),
                stdin: stdin.map(<[u8]>::to_vec),
            });
            if state.closed {
                Some(ScriptedExec::Error(TransportError::Channel(String::from(
                    "connection closed",
                ))))
            } else {
                state.responses.pop_front()
            }
        };
        Box::pin(async move {
            match next {
                None => Ok(ExecOutput {
                    exit_status: Some(0),
                    output: Vec::new(),
                }),
                Some(ScriptedExec::Output(output)) => Ok(output),
                Some(ScriptedExec::Error(error)) => Err(error),
                Some(ScriptedExec::Panic(message)) => panic!("{message}"),
            }
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        lock(&self.state).closed = true;
        Box::pin(async { Ok(()) })
    }
}

/// One attempt recorded by [`ScriptedConnector`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DialAttempt {
    /// Address dialed.
    pub address: String,
    /// Login user presented.
    pub user: String,
    /// Clock reading when the attempt started.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct ConnectorState {
    failures_left: u32,
    delay: Duration,
    attempts: Vec<DialAttempt>,
}

/// Connector that refuses a fixed number of attempts, then hands out a
/// shared [`ScriptedTransport`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    transport: ScriptedTransport,
    state: Arc<StdMutex<ConnectorState>>,
}

impl ScriptedConnector {
    /// Creates a connector that succeeds on the first attempt.
    #[must_use]
    pub fn new(transport: ScriptedTransport) -> Self {
        Self {
            transport,
            state: Arc::default(),
        }
    }

    /// Refuses the first `failures` attempts.
    #[must_use]
    pub fn failing_first(self, failures: u32) -> Self {
        lock(&self.state).failures_left = failures;
        self
    }

    /// Makes every attempt take `delay` before it resolves, like a TCP
    /// handshake to a host that drops packets.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        lock(&self.state).delay = delay;
        self
    }

    /// Refuses every attempt.
    #[must_use]
    pub fn refusing() -> Self {
        Self::default().failing_first(u32::MAX)
    }

    /// Returns every attempt made so far.
    #[must_use]
    pub fn attempts(&self) -> Vec<DialAttempt> {
        lock(&self.state).attempts.clone()
    }
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    fn connect<'a>(
        &'a self,
        target: &'a DialTarget,
        credentials: &'a SshCredentials,
    ) -> TransportFuture<'a, ScriptedTransport> {
        let (refused, delay) = {
            let mut state = lock(&self.state);
            state.attempts.push(DialAttempt {
                address: target.address.clone(),
                user: credentials.user.clone(),
                at: Instant::now(),
            });
            let refused = state.failures_left > 0;
            state.failures_left = state.failures_left.saturating_sub(1);
            (refused, state.delay)
        };
        Box::pin(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if refused {
                return Err(TransportError::Connect {
                    address: target.address.clone(),
                    message: String::from("connection refused"),
                });
            }
            Ok(self.transport.clone())
        })
    }
}

struct CaptureWriter(Arc<StdMutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Collects formatted log records emitted on the current thread.
#[derive(Clone, Debug, Default)]
pub struct LogCapture {
    buffer: Arc<StdMutex<Vec<u8>>>,
}

impl LogCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a thread-local subscriber writing into this capture.
    #[must_use = "records are captured only while the guard is alive"]
    pub fn install(&self) -> DefaultGuard {
        let buffer = Arc::clone(&self.buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || CaptureWriter(Arc::clone(&buffer)))
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Returns everything captured so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }
}

/// Operation kinds understood by [`FakeGceApi::fail_operation`].
pub mod gce_operation {
    /// `instances.insert`.
    pub const INSERT: &str = "insert";
    /// `instances.delete`.
    pub const DELETE: &str = "delete";
    /// `instances.stop`.
    pub const STOP: &str = "stop";
    /// `images.insert`.
    pub const IMAGE: &str = "image";
}

#[derive(Debug)]
struct GceState {
    operation_polls: u32,
    operations: BTreeMap<String, (&'static str, u32)>,
    failed_operations: BTreeMap<&'static str, String>,
    insert_error: Option<ApiError>,
    statuses: VecDeque<String>,
    internal_address: Option<String>,
    external_address: Option<String>,
    live: Option<String>,
    calls: Vec<String>,
    deleted: Vec<String>,
}

impl Default for GceState {
    fn default() -> Self {
        Self {
            operation_polls: 0,
            operations: BTreeMap::new(),
            failed_operations: BTreeMap::new(),
            insert_error: None,
            statuses: VecDeque::from([String::from("RUNNING")]),
            internal_address: Some(String::from("10.0.0.5")),
            external_address: None,
            live: None,
            calls: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl GceState {
    fn start_operation(&mut self, kind: &'static str) -> Operation {
        let name = format!("operation-{}", self.operations.len() + 1);
        self.operations.insert(name.clone(), (kind, 0));
        Operation {
            name,
            status: String::from("PENDING"),
            operation_type: Some(kind.to_owned()),
            ..Operation::default()
        }
    }

    fn poll_operation(&mut self, name: &str) -> Result<Operation, ApiError> {
        let limit = self.operation_polls;
        let entry = self
            .operations
            .get_mut(name)
            .ok_or_else(|| not_found(name))?;
        entry.1 += 1;
        let (kind, polls) = *entry;
        if polls <= limit {
            return Ok(Operation {
                name: name.to_owned(),
                status: String::from("RUNNING"),
                operation_type: Some(kind.to_owned()),
                ..Operation::default()
            });
        }
        let error = self
            .failed_operations
            .get(kind)
            .map(|message| OperationErrors {
                errors: vec![OperationErrorEntry {
                    code: String::from("RESOURCE_ERROR"),
                    message: message.clone(),
                }],
            });
        Ok(Operation {
            name: name.to_owned(),
            status: String::from("DONE"),
            operation_type: Some(kind.to_owned()),
            error,
            ..Operation::default()
        })
    }

    fn next_status(&mut self) -> String {
        if self.statuses.len() > 1 {
            self.statuses.pop_front().unwrap_or_default()
        } else {
            self.statuses.front().cloned().unwrap_or_default()
        }
    }
}

/// In-memory Compute Engine holding at most one instance.
///
/// Operations report `RUNNING` for the configured number of polls and `DONE`
/// afterwards. Instance statuses are replayed in order, repeating the last.
#[derive(Clone, Debug, Default)]
pub struct FakeGceApi {
    state: Arc<StdMutex<GceState>>,
}

impl FakeGceApi {
    /// Creates an API whose operations finish on the first poll and whose
    /// instance runs with internal address `10.0.0.5`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations report `RUNNING` for `polls` polls before finishing.
    #[must_use]
    pub fn with_operation_polls(self, polls: u32) -> Self {
        lock(&self.state).operation_polls = polls;
        self
    }

    /// Replays `statuses` from `instances.get`, repeating the last one.
    #[must_use]
    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        lock(&self.state).statuses = statuses.iter().map(|status| (*status).to_owned()).collect();
        self
    }

    /// Sets the addresses reported on the single network interface.
    #[must_use]
    pub fn with_addresses(self, internal: Option<&str>, external: Option<&str>) -> Self {
        {
            let mut state = lock(&self.state);
            state.internal_address = internal.map(str::to_owned);
            state.external_address = external.map(str::to_owned);
        }
        self
    }

    /// Rejects `instances.insert` with `error`.
    #[must_use]
    pub fn fail_insert(self, error: ApiError) -> Self {
        lock(&self.state).insert_error = Some(error);
        self
    }

    /// Finishes operations of `kind` (see [`gce_operation`]) with an error.
    #[must_use]
    pub fn fail_operation(self, kind: &'static str, message: &str) -> Self {
        lock(&self.state)
            .failed_operations
            .insert(kind, message.to_owned());
        self
    }

    /// Returns the API methods called so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Returns how often `method` was called.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.as_str() == method)
            .count()
    }

    /// Returns the instance names passed to `instances.delete`.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    fn record(&self, method: &str) -> StdMutexGuard<'_, GceState> {
        let mut state = lock(&self.state);
        state.calls.push(method.to_owned());
        state
    }
}

impl GceApi for FakeGceApi {
    fn insert_instance<'a>(
        &'a self,
        _project: &'a str,
        _zone: &'a str,
        instance: &'a GceInstance,
    ) -> crate::gce::api::ApiFuture<'a, Operation> {
        let result = {
            let mut state = self.record("insert_instance");
            match state.insert_error.clone() {
                Some(error) => Err(error),
                None => {
                    state.live = Some(instance.name.clone());
                    Ok(state.start_operation(gce_operation::INSERT))
                }
            }
        };
        Box::pin(async move { result })
    }

    fn get_instance<'a>(
        &'a self,
        _project: &'a str,
        zone: &'a str,
        name: &'a str,
    ) -> crate::gce::api::ApiFuture<'a, GceInstance> {
        let result = {
            let mut state = self.record("get_instance");
            if state.live.as_deref() == Some(name) {
                Ok(GceInstance {
                    id: Some(String::from("4242")),
                    name: name.to_owned(),
                    status: state.next_status(),
                    disks: vec![AttachedDisk {
                        auto_delete: true,
                        boot: true,
                        source: Some(format!("zones/{zone}/disks/{name}")),
                        initialize_params: None,
                    }],
                    network_interfaces: vec![NetworkInterfaceResource {
                        network: Some(String::from("global/networks/default")),
                        network_ip: state.internal_address.clone(),
                        access_configs: state
                            .external_address
                            .iter()
                            .map(|address| crate::gce::api::AccessConfig {
                                name: String::from("External NAT"),
                                kind: String::from("ONE_TO_ONE_NAT"),
                                nat_ip: Some(address.clone()),
                            })
                            .collect(),
                    }],
                    ..GceInstance::default()
                })
            } else {
                Err(not_found(name))
            }
        };
        Box::pin(async move { result })
    }

    fn delete_instance<'a>(
        &'a self,
        _project: &'a str,
        _zone: &'a str,
        name: &'a str,
    ) -> crate::gce::api::ApiFuture<'a, Operation> {
        let result = {
            let mut state = self.record("delete_instance");
            state.deleted.push(name.to_owned());
            if state.live.as_deref() == Some(name) {
                state.live = None;
                Ok(state.start_operation(gce_operation::DELETE))
            } else {
                Err(not_found(name))
            }
        };
        Box::pin(async move { result })
    }

    fn stop_instance<'a>(
        &'a self,
        _project: &'a str,
        _zone: &'a str,
        name: &'a str,
    ) -> crate::gce::api::ApiFuture<'a, Operation> {
        let result = {
            let mut state = self.record("stop_instance");
            if state.live.as_deref() == Some(name) {
                state.statuses = VecDeque::from([String::from("TERMINATED")]);
                Ok(state.start_operation(gce_operation::STOP))
            } else {
                Err(not_found(name))
            }
        };
        Box::pin(async move { result })
    }

    fn get_zone_operation<'a>(
        &'a self,
        _project: &'a str,
        _zone: &'a str,
        operation: &'a str,
    ) -> crate::gce::api::ApiFuture<'a, Operation> {
        let result = self.record("get_zone_operation").poll_operation(operation);
        Box::pin(async move { result })
    }

    fn insert_image<'a>(
        &'a self,
        _project: &'a str,
        _image: &'a GceImage,
    ) -> crate::gce::api::ApiFuture<'a, Operation> {
        let result = Ok(self
            .record("insert_image")
            .start_operation(gce_operation::IMAGE));
        Box::pin(async move { result })
    }

    fn get_global_operation<'a>(
        &'a self,
        _project: &'a str,
        operation: &'a str,
    ) -> crate::gce::api::ApiFuture<'a, Operation> {
        let result = self
            .record("get_global_operation")
            .poll_operation(operation);
        Box::pin(async move { result })
    }

    fn get_image<'a>(
        &'a self,
        project: &'a str,
        name: &'a str,
    ) -> crate::gce::api::ApiFuture<'a, GceImage> {
        drop(self.record("get_image"));
        Box::pin(async move {
            Ok(GceImage {
                id: Some(String::from("9001")),
                name: name.to_owned(),
                self_link: Some(format!(
                    "https://www.googleapis.com/compute/v1/projects/{project}/global/images/{name}"
                )),
                status: Some(String::from("READY")),
                ..GceImage::default()
            })
        })
    }
}

/// Identifier handed out by [`FakeOciApi::launch_instance`].
pub const FAKE_OCI_INSTANCE_ID: &str = "ocid1.instance.oc1..fake";

#[derive(Debug)]
struct OciState {
    launch_error: Option<ApiError>,
    terminate_error: Option<ApiError>,
    states: VecDeque<String>,
    image_states: VecDeque<String>,
    vnics: Vec<Vnic>,
    unreadable_vnics: BTreeSet<String>,
    latest_image: Option<OciImage>,
    live: Option<OciInstance>,
    gone_after_terminate: bool,
    calls: Vec<String>,
    terminated: Vec<String>,
}

impl Default for OciState {
    fn default() -> Self {
        Self {
            launch_error: None,
            terminate_error: None,
            states: VecDeque::from([String::from("RUNNING")]),
            image_states: VecDeque::from([String::from("AVAILABLE")]),
            vnics: vec![Vnic {
                id: String::from("ocid1.vnic.oc1..primary"),
                private_ip: Some(String::from("10.0.0.5")),
                public_ip: None,
            }],
            unreadable_vnics: BTreeSet::new(),
            latest_image: None,
            live: None,
            gone_after_terminate: false,
            calls: Vec::new(),
            terminated: Vec::new(),
        }
    }
}

fn replay(states: &mut VecDeque<String>) -> String {
    if states.len() > 1 {
        states.pop_front().unwrap_or_default()
    } else {
        states.front().cloned().unwrap_or_default()
    }
}

/// In-memory OCI core services holding at most one instance.
///
/// Lifecycle states are replayed in order, repeating the last. `STOP` and
/// terminate requests move the instance through the matching states.
#[derive(Clone, Debug, Default)]
pub struct FakeOciApi {
    state: Arc<StdMutex<OciState>>,
}

impl FakeOciApi {
    /// Creates an API whose instance runs immediately with one VNIC at
    /// `10.0.0.5`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays `states` from `GetInstance`, repeating the last one.
    #[must_use]
    pub fn with_states(self, states: &[&str]) -> Self {
        lock(&self.state).states = states.iter().map(|value| (*value).to_owned()).collect();
        self
    }

    /// Replays `states` from `GetImage`, repeating the last one.
    #[must_use]
    pub fn with_image_states(self, states: &[&str]) -> Self {
        lock(&self.state).image_states =
            states.iter().map(|value| (*value).to_owned()).collect();
        self
    }

    /// Replaces the attached VNICs.
    #[must_use]
    pub fn with_vnics(self, vnics: Vec<Vnic>) -> Self {
        lock(&self.state).vnics = vnics;
        self
    }

    /// Makes `GetVnic` fail for `vnic_id`.
    #[must_use]
    pub fn with_unreadable_vnic(self, vnic_id: &str) -> Self {
        lock(&self.state)
            .unreadable_vnics
            .insert(vnic_id.to_owned());
        self
    }

    /// Sets the result of the latest-image lookup.
    #[must_use]
    pub fn with_latest_image(self, image: OciImage) -> Self {
        lock(&self.state).latest_image = Some(image);
        self
    }

    /// Rejects `LaunchInstance` with `error`.
    #[must_use]
    pub fn fail_launch(self, error: ApiError) -> Self {
        lock(&self.state).launch_error = Some(error);
        self
    }

    /// Rejects every `TerminateInstance` with `error`.
    #[must_use]
    pub fn fail_terminate(self, error: ApiError) -> Self {
        lock(&self.state).terminate_error = Some(error);
        self
    }

    /// Answers `GetInstance` with not-found once termination starts.
    #[must_use]
    pub fn gone_after_terminate(self) -> Self {
        lock(&self.state).gone_after_terminate = true;
        self
    }

    /// Returns the API methods called so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Returns how often `method` was called.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.as_str() == method)
            .count()
    }

    /// Returns the instance identifiers passed to `TerminateInstance`.
    #[must_use]
    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }

    fn record(&self, method: &str) -> StdMutexGuard<'_, OciState> {
        let mut state = lock(&self.state);
        state.calls.push(method.to_owned());
        state
    }
}

impl OciApi for FakeOciApi {
    fn launch_instance<'a>(
        &'a self,
        details: &'a LaunchInstanceDetails,
    ) -> crate::oci::api::ApiFuture<'a, OciInstance> {
        let result = {
            let mut state = self.record("launch_instance");
            match state.launch_error.clone() {
                Some(error) => Err(error),
                None => {
                    let instance = OciInstance {
                        id: String::from(FAKE_OCI_INSTANCE_ID),
                        display_name: details.display_name.clone(),
                        lifecycle_state: String::from("PROVISIONING"),
                        availability_domain: details.availability_domain.clone(),
                    };
                    state.live = Some(instance.clone());
                    Ok(instance)
                }
            }
        };
        Box::pin(async move { result })
    }

    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> crate::oci::api::ApiFuture<'a, OciInstance> {
        let result = {
            let mut state = self.record("get_instance");
            match state.live.clone() {
                Some(instance) if instance.id == instance_id => Ok(OciInstance {
                    lifecycle_state: replay(&mut state.states),
                    ..instance
                }),
                _ => Err(not_found(instance_id)),
            }
        };
        Box::pin(async move { result })
    }

    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> crate::oci::api::ApiFuture<'a, ()> {
        let result = {
            let mut state = self.record("terminate_instance");
            state.terminated.push(instance_id.to_owned());
            if let Some(error) = state.terminate_error.clone() {
                Err(error)
            } else if state.live.as_ref().is_some_and(|live| live.id == instance_id) {
                if state.gone_after_terminate {
                    state.live = None;
                }
                state.states =
                    VecDeque::from([String::from("TERMINATING"), String::from("TERMINATED")]);
                Ok(())
            } else {
                Err(not_found(instance_id))
            }
        };
        Box::pin(async move { result })
    }

    fn instance_action<'a>(
        &'a self,
        instance_id: &'a str,
        action: &'a str,
    ) -> crate::oci::api::ApiFuture<'a, OciInstance> {
        let result = {
            let mut state = self.record("instance_action");
            match state.live.clone() {
                Some(instance) if instance.id == instance_id && action == "STOP" => {
                    state.states =
                        VecDeque::from([String::from("STOPPING"), String::from("STOPPED")]);
                    Ok(OciInstance {
                        lifecycle_state: String::from("STOPPING"),
                        ..instance
                    })
                }
                Some(_) => Err(ApiError::Status {
                    resource: instance_id.to_owned(),
                    status: 400,
                    message: format!("unsupported action {action}"),
                }),
                None => Err(not_found(instance_id)),
            }
        };
        Box::pin(async move { result })
    }

    fn list_vnic_attachments<'a>(
        &'a self,
        _compartment_id: &'a str,
        _instance_id: &'a str,
    ) -> crate::oci::api::ApiFuture<'a, Vec<VnicAttachment>> {
        let attachments = self
            .record("list_vnic_attachments")
            .vnics
            .iter()
            .map(|vnic| VnicAttachment {
                vnic_id: Some(vnic.id.clone()),
                lifecycle_state: String::from("ATTACHED"),
            })
            .collect();
        Box::pin(async move { Ok(attachments) })
    }

    fn get_vnic<'a>(&'a self, vnic_id: &'a str) -> crate::oci::api::ApiFuture<'a, Vnic> {
        let result = {
            let state = self.record("get_vnic");
            if state.unreadable_vnics.contains(vnic_id) {
                Err(ApiError::Status {
                    resource: vnic_id.to_owned(),
                    status: 500,
                    message: String::from("internal error"),
                })
            } else {
                state
                    .vnics
                    .iter()
                    .find(|vnic| vnic.id == vnic_id)
                    .cloned()
                    .ok_or_else(|| not_found(vnic_id))
            }
        };
        Box::pin(async move { result })
    }

    fn create_image<'a>(
        &'a self,
        details: &'a CreateImageDetails,
    ) -> crate::oci::api::ApiFuture<'a, OciImage> {
        drop(self.record("create_image"));
        Box::pin(async move {
            Ok(OciImage {
                id: String::from("ocid1.image.oc1..fake"),
                display_name: Some(details.display_name.clone()),
                lifecycle_state: String::from("PROVISIONING"),
                operating_system: None,
            })
        })
    }

    fn get_image<'a>(&'a self, image_id: &'a str) -> crate::oci::api::ApiFuture<'a, OciImage> {
        let lifecycle_state = replay(&mut self.record("get_image").image_states);
        Box::pin(async move {
            Ok(OciImage {
                id: image_id.to_owned(),
                display_name: Some(String::from("golden")),
                lifecycle_state,
                operating_system: None,
            })
        })
    }

    fn latest_image<'a>(
        &'a self,
        _compartment_id: &'a str,
        _operating_system: &'a str,
    ) -> crate::oci::api::ApiFuture<'a, Option<OciImage>> {
        let image = self.record("latest_image").latest_image.clone();
        Box::pin(async move { Ok(image) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Sets `pairs` and removes `unset`, holding the global mutex until the
    /// guard drops.
    pub async fn apply(pairs: &[(&str, &str)], unset: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(unset.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + unset.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in unset {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

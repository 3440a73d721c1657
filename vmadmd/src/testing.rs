//! In-memory stand-ins for the daemon's collaborators.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use vmadmd_protocol::RawZoneEvent;

use crate::hypervisor::{HypervisorControl, HypervisorSession};
use crate::store::{LookupFilter, StartOptions, StopOptions, StoreError, VmRecord, VmState, VmStore};
use crate::zone::events::ZoneEventSource;

// ---------------------------------------------------------------------------
// FakeStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Load(Uuid),
    Lookup,
    Start(Uuid, StartOptions),
    Stop(Uuid, StopOptions),
    Update(Uuid, Value),
    MarkFailed(Uuid),
    WaitProvisioning(Uuid),
    UnsetTransition(Uuid),
}

struct StoreState {
    vms: Mutex<HashMap<Uuid, VmRecord>>,
    calls: Mutex<Vec<StoreCall>>,
    loads_open: watch::Sender<bool>,
    provisioning_open: watch::Sender<bool>,
    stop_not_running: AtomicBool,
    fail_unset: AtomicBool,
    fail_lookup: AtomicBool,
}

/// `VmStore` over a map of records, recording every call.
///
/// Loads and provisioning waits can be held open so tests can interleave
/// events with in-flight work.
#[derive(Clone)]
pub struct FakeStore {
    state: Arc<StoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StoreState {
                vms: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                loads_open: watch::channel(true).0,
                provisioning_open: watch::channel(true).0,
                stop_not_running: AtomicBool::new(false),
                fail_unset: AtomicBool::new(false),
                fail_lookup: AtomicBool::new(false),
            }),
        }
    }

    pub fn put(&self, vm: VmRecord) {
        self.state.vms.lock().unwrap().insert(vm.uuid, vm);
    }

    pub fn remove(&self, uuid: Uuid) {
        self.state.vms.lock().unwrap().remove(&uuid);
    }

    pub fn set_state(&self, uuid: Uuid, state: VmState) {
        if let Some(vm) = self.state.vms.lock().unwrap().get_mut(&uuid) {
            vm.state = state;
        }
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn loads(&self, uuid: Uuid) -> usize {
        self.count(|c| matches!(c, StoreCall::Load(u) if *u == uuid))
    }

    pub fn provisioning_waits(&self, uuid: Uuid) -> usize {
        self.count(|c| matches!(c, StoreCall::WaitProvisioning(u) if *u == uuid))
    }

    pub fn starts(&self) -> Vec<(Uuid, StartOptions)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Start(u, o) => Some((u, o)),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<(Uuid, StopOptions)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::Stop(u, o) => Some((u, o)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, f: impl Fn(&StoreCall) -> bool) -> usize {
        self.state.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: StoreCall) {
        self.state.calls.lock().unwrap().push(call);
    }

    /// Block loads until [`FakeStore::release_loads`].
    pub fn hold_loads(&self) {
        self.state.loads_open.send_replace(false);
    }

    pub fn release_loads(&self) {
        self.state.loads_open.send_replace(true);
    }

    /// Block provisioning waits until [`FakeStore::release_provisioning`].
    pub fn hold_provisioning(&self) {
        self.state.provisioning_open.send_replace(false);
    }

    pub fn release_provisioning(&self) {
        self.state.provisioning_open.send_replace(true);
    }

    /// Make `stop` report that the VM is not running.
    pub fn stop_reports_not_running(&self) {
        self.state.stop_not_running.store(true, Ordering::SeqCst);
    }

    pub fn fail_unset_transition(&self) {
        self.state.fail_unset.store(true, Ordering::SeqCst);
    }

    pub fn fail_lookup(&self) {
        self.state.fail_lookup.store(true, Ordering::SeqCst);
    }

    async fn gate(tx: &watch::Sender<bool>) {
        let mut rx = tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    fn get(&self, uuid: Uuid) -> Result<VmRecord, StoreError> {
        self.state
            .vms
            .lock()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or(StoreError::NotFound(uuid))
    }
}

#[async_trait]
impl VmStore for FakeStore {
    async fn load(&self, uuid: Uuid, _fields: &[&str]) -> Result<VmRecord, StoreError> {
        self.record(StoreCall::Load(uuid));
        Self::gate(&self.state.loads_open).await;
        self.get(uuid)
    }

    async fn lookup(&self, filter: &LookupFilter, _fields: &[&str]) -> Result<Vec<VmRecord>, StoreError> {
        self.record(StoreCall::Lookup);
        if self.state.fail_lookup.load(Ordering::SeqCst) {
            return Err(StoreError::Command(anyhow::anyhow!("lookup failed")));
        }
        let mut vms: Vec<VmRecord> = self
            .state
            .vms
            .lock()
            .unwrap()
            .values()
            .filter(|vm| filter.matches(vm))
            .cloned()
            .collect();
        vms.sort_by_key(|vm| vm.uuid);
        Ok(vms)
    }

    async fn start(&self, uuid: Uuid, opts: &StartOptions) -> Result<(), StoreError> {
        self.record(StoreCall::Start(uuid, opts.clone()));
        self.get(uuid).map(|_| ())
    }

    async fn stop(&self, uuid: Uuid, opts: &StopOptions) -> Result<(), StoreError> {
        self.record(StoreCall::Stop(uuid, *opts));
        if self.state.stop_not_running.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidState {
                uuid,
                detail: "VM is not running".into(),
            });
        }
        Ok(())
    }

    async fn update(&self, uuid: Uuid, payload: &Value) -> Result<(), StoreError> {
        self.record(StoreCall::Update(uuid, payload.clone()));
        Ok(())
    }

    async fn mark_failed(&self, uuid: Uuid) -> Result<(), StoreError> {
        self.record(StoreCall::MarkFailed(uuid));
        self.set_state(uuid, VmState::Failed);
        Ok(())
    }

    async fn wait_for_provisioning_done(&self, uuid: Uuid, _timeout: Duration) -> Result<(), StoreError> {
        self.record(StoreCall::WaitProvisioning(uuid));
        Self::gate(&self.state.provisioning_open).await;
        Ok(())
    }

    async fn unset_provisioning_transition(&self, uuid: Uuid) -> Result<(), StoreError> {
        self.record(StoreCall::UnsetTransition(uuid));
        if self.state.fail_unset.load(Ordering::SeqCst) {
            return Err(StoreError::Busy(uuid));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeHypervisor
// ---------------------------------------------------------------------------

struct HvState {
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(PathBuf, String, Option<Value>)>>,
    connections: AtomicUsize,
    disconnects: AtomicUsize,
    refuse_connect: AtomicBool,
    connects_open: watch::Sender<bool>,
}

/// `HypervisorControl` answering from a canned response table.
///
/// Connections can be held open so tests can act while a command is in
/// flight.
#[derive(Clone)]
pub struct FakeHypervisor {
    state: Arc<HvState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HvState {
                responses: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
                connections: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                refuse_connect: AtomicBool::new(false),
                connects_open: watch::channel(true).0,
            }),
        }
    }

    /// Block connections until [`FakeHypervisor::release_connections`].
    /// Held connections already count in [`FakeHypervisor::connections`].
    pub fn hold_connections(&self) {
        self.state.connects_open.send_replace(false);
    }

    pub fn release_connections(&self) {
        self.state.connects_open.send_replace(true);
    }

    pub fn respond(&self, command: &str, value: Value) {
        self.state.responses.lock().unwrap().insert(command.to_string(), value);
    }

    pub fn fail(&self, command: &str) {
        self.state.failures.lock().unwrap().insert(command.to_string());
    }

    pub fn refuse_connections(&self) {
        self.state.refuse_connect.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().iter().map(|(_, c, _)| c.clone()).collect()
    }

    pub fn calls(&self) -> Vec<(PathBuf, String, Option<Value>)> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    socket: PathBuf,
    state: Arc<HvState>,
}

#[async_trait]
impl HypervisorControl for FakeHypervisor {
    async fn connect(&self, socket_path: &Path) -> Result<Box<dyn HypervisorSession>> {
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            bail!("failed to connect to QMP socket: {}", socket_path.display());
        }
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        FakeStore::gate(&self.state.connects_open).await;
        Ok(Box::new(FakeSession {
            socket: socket_path.to_path_buf(),
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl HypervisorSession for FakeSession {
    async fn command(&mut self, name: &str, arguments: Option<Value>) -> Result<Value> {
        self.state
            .calls
            .lock()
            .unwrap()
            .push((self.socket.clone(), name.to_string(), arguments));
        if self.state.failures.lock().unwrap().contains(name) {
            bail!("QMP command '{}' failed: injected (GenericError)", name);
        }
        Ok(self
            .state
            .responses
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| json!({})))
    }

    async fn disconnect(self: Box<Self>) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeEventSource
// ---------------------------------------------------------------------------

/// `ZoneEventSource` fed by the test through a sender.
pub struct FakeEventSource {
    rx: Mutex<Option<mpsc::Receiver<RawZoneEvent>>>,
}

impl FakeEventSource {
    pub fn new() -> (Self, mpsc::Sender<RawZoneEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { rx: Mutex::new(Some(rx)) }, tx)
    }
}

#[async_trait]
impl ZoneEventSource for FakeEventSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<RawZoneEvent>> {
        match self.rx.lock().unwrap().take() {
            Some(rx) => Ok(rx),
            None => bail!("already subscribed"),
        }
    }
}

/// A raw event for `uuid` as the zoneevent helper would print it.
pub fn raw_event(uuid: Uuid, old: &str, new: &str) -> RawZoneEvent {
    RawZoneEvent {
        zonename: Some(uuid.to_string()),
        oldstate: Some(old.to_string()),
        newstate: Some(new.to_string()),
        when: Some("1494617613097227838".to_string()),
        zoneid: None,
    }
}

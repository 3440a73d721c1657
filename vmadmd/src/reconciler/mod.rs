//! The event reconciler.
//!
//! A single task consumes zone transition events in order and turns them
//! into VM lifecycle work: loading VMs, waiting out provisioning, managing
//! display sessions, forcing stalled stops and scheduling restarts.
//!
//! Everything that touches I/O runs in spawned tasks. Their results come
//! back through the reconciler's mailbox, so the seen-VM memory and the
//! provisioning wait set are only ever mutated by the reconciler itself.
//!
//! Loads can finish out of order. Each one is numbered when it is issued,
//! and a result older than one already applied for the same VM is dropped.
//! Display work is claimed when it is applied, so sessions follow the
//! order in which transitions were applied too.

mod inventory;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use vmadmd_protocol::RawZoneEvent;

use crate::config::{Config, ReconcilerConfig};
use crate::control::StopTimers;
use crate::display::DisplaySessionManager;
use crate::metrics::{EventOutcome, MetricsRegistry};
use crate::provision::{self, ProvisionOutcome, ProvisioningWaiter};
use crate::restart::RestartEngine;
use crate::state_waiter::StateWaiter;
use crate::store::{
    Brand, LookupFilter, StopOptions, StoreError, VmRecord, VmState, VmStore, FULL_LOAD_FIELDS, RESTART_FIELDS,
};
use crate::zone::{ZoneState, ZoneTransitionEvent};

/// What the reconciler remembers about a VM between events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenVm {
    /// Unset until the first load completes.
    pub brand: Option<Brand>,
    pub restart_candidate: bool,
    pub zone_root: Option<PathBuf>,
    pub provisioned: bool,
}

impl SeenVm {
    /// Record the VM's classification. Only the first load counts.
    fn fill(&mut self, vm: &VmRecord) {
        if self.brand.is_some() {
            return;
        }
        self.brand = Some(vm.brand.clone());
        self.restart_candidate = is_restart_candidate(vm);
        self.zone_root = Some(vm.zone_root());
    }
}

/// VMs that may carry a restart policy.
pub fn is_restart_candidate(vm: &VmRecord) -> bool {
    vm.docker || vm.restart_policy().is_some()
}

/// How an event for a VM is handled, decided from reconciler memory alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    /// Never seen: remember it and load it.
    FirstLoad,
    /// The first load is still in flight.
    StillLoading,
    /// A provisioning wait is active; it resolves on its own.
    Provisioning,
    FullLoad,
    /// Stopped restart candidate: check its restart policy.
    RestartCheck,
    /// Load only if the VM is being reprovisioned.
    CheckReprovision,
}

/// Precedence of event handling. The first matching rule wins.
pub fn classify(seen: Option<&SeenVm>, provisioning: bool, event: &ZoneTransitionEvent) -> Handling {
    let Some(seen) = seen else {
        return Handling::FirstLoad;
    };
    let Some(brand) = &seen.brand else {
        return Handling::StillLoading;
    };
    if provisioning {
        Handling::Provisioning
    } else if !seen.provisioned {
        Handling::FullLoad
    } else if brand.has_display() && event.touches_running() {
        Handling::FullLoad
    } else if seen.restart_candidate && event.new_state.is_stopped() {
        Handling::RestartCheck
    } else {
        Handling::CheckReprovision
    }
}

/// Side effects of a transition for a loaded VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actions {
    /// Drop the stop timer, rotate logs and bring up a fresh display session.
    pub start_display: bool,
    pub stop_display: bool,
    pub force_stop: bool,
}

/// Transition table. Display handling only applies to display brands; a
/// zone left uninitialized is always force-stopped to finish its halt.
pub fn dispatch(brand: &Brand, old: &ZoneState, new: &ZoneState) -> Actions {
    let display = brand.has_display();
    match (old, new) {
        (_, ZoneState::Running) => Actions {
            start_display: display,
            ..Default::default()
        },
        (ZoneState::Running, ZoneState::Uninitialized) => Actions {
            stop_display: display,
            force_stop: true,
            ..Default::default()
        },
        (ZoneState::Running, _) => Actions {
            stop_display: display,
            ..Default::default()
        },
        (_, ZoneState::Uninitialized) => Actions {
            force_stop: true,
            ..Default::default()
        },
        _ => Actions::default(),
    }
}

/// Results reported back by spawned work.
#[derive(Debug)]
enum Message {
    Loaded {
        event: ZoneTransitionEvent,
        seq: u64,
        result: Result<VmRecord, StoreError>,
    },
    RestartLoaded {
        uuid: Uuid,
        result: Result<VmRecord, StoreError>,
    },
    ProvisionFinished {
        uuid: Uuid,
        outcome: ProvisionOutcome,
    },
    Inventory(Result<Vec<Uuid>, StoreError>),
}

/// The reconciliation actor. Build it, optionally run the startup
/// inventory pass, then hand it the event stream with [`Reconciler::run`].
pub struct Reconciler {
    store: Arc<dyn VmStore>,
    displays: Arc<DisplaySessionManager>,
    stop_timers: StopTimers,
    restarts: RestartEngine,
    provisioner: ProvisioningWaiter,
    waiter: StateWaiter,
    metrics: MetricsRegistry,
    config: ReconcilerConfig,

    seen: HashMap<Uuid, SeenVm>,
    provisioning: HashSet<Uuid>,
    next_load: u64,
    /// Sequence number of the newest load applied per VM.
    applied_loads: HashMap<Uuid, u64>,

    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn VmStore>,
        displays: Arc<DisplaySessionManager>,
        stop_timers: StopTimers,
        waiter: StateWaiter,
        metrics: MetricsRegistry,
        config: &Config,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            restarts: RestartEngine::new(Arc::clone(&store), config.restart.clone(), metrics.clone()),
            provisioner: ProvisioningWaiter::new(Arc::clone(&store), config.reconciler.provision_timeout()),
            store,
            displays,
            stop_timers,
            waiter,
            metrics,
            config: config.reconciler.clone(),
            seen: HashMap::new(),
            provisioning: HashSet::new(),
            next_load: 0,
            applied_loads: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Process events until the stream closes. A closed stream means the
    /// daemon has lost sight of the host and is reported as an error.
    pub async fn run(mut self, mut events: mpsc::Receiver<RawZoneEvent>) -> Result<()> {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;
        let mut summary = tokio::time::interval(self.config.summary_interval());
        summary.set_missed_tick_behavior(MissedTickBehavior::Delay);
        summary.tick().await;

        info!(seen = self.seen.len(), "reconciler started");
        loop {
            tokio::select! {
                raw = events.recv() => match raw {
                    Some(raw) => self.handle_raw(&raw),
                    None => {
                        error!("zone event stream closed");
                        self.restarts.cancel_all();
                        anyhow::bail!("zone event stream closed");
                    }
                },
                Some(message) = self.rx.recv() => self.handle_message(message),
                _ = sweep.tick() => self.start_sweep(),
                _ = summary.tick() => self.log_summary(),
            }
        }
    }

    fn handle_raw(&mut self, raw: &RawZoneEvent) {
        match ZoneTransitionEvent::from_raw(raw) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                warn!(error = %e, zonename = ?raw.zonename, "dropping zone event");
                self.metrics.record_event(EventOutcome::Invalid);
            }
        }
    }

    fn handle_event(&mut self, event: ZoneTransitionEvent) {
        let uuid = event.identity;
        if event.is_pre_install() {
            info!(vm = %uuid, old = %event.old_state, new = %event.new_state, "zone being installed");
            self.metrics.record_event(EventOutcome::PreInstall);
            return;
        }

        // Waiters must not be held up by our own loads
        if let Some(state) = event.reported_state() {
            self.waiter.publish(uuid, state);
        }

        let handling = classify(self.seen.get(&uuid), self.provisioning.contains(&uuid), &event);
        debug!(vm = %uuid, old = %event.old_state, new = %event.new_state, ?handling, "zone transition");
        match handling {
            Handling::FirstLoad => {
                self.seen.insert(uuid, SeenVm::default());
                self.spawn_load(event);
            }
            Handling::StillLoading | Handling::Provisioning => {
                self.metrics.record_event(EventOutcome::Ignored);
            }
            Handling::FullLoad => self.spawn_load(event),
            Handling::RestartCheck => self.spawn_restart_check(uuid),
            Handling::CheckReprovision => {
                let zone_root = self.seen.get(&uuid).and_then(|s| s.zone_root.clone());
                self.spawn_reprovision_check(event, zone_root);
            }
        }
    }

    fn issue_load(&mut self) -> u64 {
        self.next_load += 1;
        self.next_load
    }

    fn spawn_load(&mut self, event: ZoneTransitionEvent) {
        self.metrics.record_event(EventOutcome::Load);
        self.metrics.record_load();
        let seq = self.issue_load();
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = store.load(event.identity, FULL_LOAD_FIELDS).await;
            let _ = tx.send(Message::Loaded { event, seq, result });
        });
    }

    fn spawn_reprovision_check(&mut self, event: ZoneTransitionEvent, zone_root: Option<PathBuf>) {
        let Some(zone_root) = zone_root else {
            self.metrics.record_event(EventOutcome::Ignored);
            return;
        };
        let seq = self.issue_load();
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !provision::is_provisioning(&zone_root).await {
                trace!(vm = %event.identity, old = %event.old_state, new = %event.new_state, "ignoring transition");
                metrics.record_event(EventOutcome::Ignored);
                return;
            }
            info!(vm = %event.identity, "VM is being reprovisioned");
            metrics.record_event(EventOutcome::Load);
            metrics.record_load();
            let result = store.load(event.identity, FULL_LOAD_FIELDS).await;
            let _ = tx.send(Message::Loaded { event, seq, result });
        });
    }

    fn spawn_restart_check(&self, uuid: Uuid) {
        self.metrics.record_event(EventOutcome::RestartCheck);
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = store.load(uuid, RESTART_FIELDS).await;
            let _ = tx.send(Message::RestartLoaded { uuid, result });
        });
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Loaded { event, seq, result } => self.on_loaded(event, seq, result),
            Message::RestartLoaded { uuid, result } => self.on_restart_loaded(uuid, result),
            Message::ProvisionFinished { uuid, outcome } => {
                self.provisioning.remove(&uuid);
                if let Some(seen) = self.seen.get_mut(&uuid) {
                    seen.provisioned = true;
                }
                debug!(vm = %uuid, ?outcome, "provisioning wait finished");
            }
            Message::Inventory(result) => self.on_inventory(result),
        }
    }

    fn on_loaded(&mut self, event: ZoneTransitionEvent, seq: u64, result: Result<VmRecord, StoreError>) {
        let uuid = event.identity;
        let applied = self.applied_loads.entry(uuid).or_insert(0);
        if seq < *applied {
            debug!(vm = %uuid, old = %event.old_state, new = %event.new_state, seq, applied = *applied, "dropping stale load");
            self.metrics.record_event(EventOutcome::Ignored);
            return;
        }
        *applied = seq;

        let vm = match result {
            Ok(vm) => vm,
            Err(e) => {
                match &e {
                    StoreError::NotFound(_) => debug!(vm = %uuid, "VM vanished before it could be loaded"),
                    _ => warn!(vm = %uuid, error = %e, "failed to load VM"),
                }
                self.metrics.record_error("load");
                // Without a brand every later event would be ignored
                if self.seen.get(&uuid).is_some_and(|s| s.brand.is_none()) {
                    self.seen.remove(&uuid);
                }
                return;
            }
        };

        if vm.is_failed() {
            info!(vm = %uuid, "ignoring failed VM");
            return;
        }

        let provisioning = vm.state == VmState::Provisioning;
        let seen = self.seen.entry(uuid).or_default();
        seen.fill(&vm);
        if provisioning {
            self.start_provisioning_wait(vm);
            return;
        }
        seen.provisioned = true;

        let actions = dispatch(&vm.brand, &event.old_state, &event.new_state);
        debug!(vm = %uuid, brand = %vm.brand, ?actions, "dispatching transition");
        self.apply_actions(vm, actions);
    }

    fn start_provisioning_wait(&mut self, vm: VmRecord) {
        let uuid = vm.uuid;
        if !self.provisioning.insert(uuid) {
            debug!(vm = %uuid, "already waiting for provisioning");
            return;
        }
        info!(vm = %uuid, "waiting for provisioning");

        let provisioner = self.provisioner.clone();
        let store = Arc::clone(&self.store);
        let displays = Arc::clone(&self.displays);
        let stop_timers = self.stop_timers.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = provisioner.wait(&vm).await;
            if outcome == ProvisionOutcome::Success && vm.brand.has_display() {
                if let Err(e) = provision::refresh_display(store.as_ref(), &displays, &stop_timers, uuid).await {
                    warn!(vm = %uuid, error = %e, "failed to start display after provisioning");
                }
            }
            let _ = tx.send(Message::ProvisionFinished { uuid, outcome });
        });
    }

    fn apply_actions(&self, vm: VmRecord, actions: Actions) {
        let uuid = vm.uuid;
        if actions.start_display {
            self.stop_timers.cancel(&uuid);
            self.spawn_log_rotation(uuid);
            let displays = Arc::clone(&self.displays);
            let claim = displays.claim(uuid);
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = displays.start_claimed(&vm, claim).await {
                    warn!(vm = %uuid, error = %e, "failed to start display session");
                    metrics.record_error("display");
                }
            });
            return;
        }
        if actions.stop_display {
            let displays = Arc::clone(&self.displays);
            let claim = displays.claim(uuid);
            tokio::spawn(async move { displays.stop_claimed(claim).await });
        }
        if actions.force_stop {
            spawn_force_stop(Arc::clone(&self.store), uuid);
        }
    }

    fn spawn_log_rotation(&self, uuid: Uuid) {
        let Some(script) = self.config.log_rotate_script.clone() else {
            return;
        };
        let delay = self.config.log_rotate_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = rotate_logs(&script, uuid).await {
                warn!(vm = %uuid, error = %e, "log rotation failed");
            }
        });
    }

    fn on_restart_loaded(&mut self, uuid: Uuid, result: Result<VmRecord, StoreError>) {
        let vm = match result {
            Ok(vm) => vm,
            Err(e) => {
                warn!(vm = %uuid, error = %e, "failed to load VM for restart check");
                self.metrics.record_error("load");
                return;
            }
        };
        if !vm.autoboot || vm.is_running() || vm.restart_policy().is_none() {
            debug!(vm = %uuid, autoboot = vm.autoboot, state = %vm.state, "restart policy does not apply");
            return;
        }
        self.restarts.apply(&vm, vm.last_runtime());
    }

    fn start_sweep(&self) {
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = store
                .lookup(&LookupFilter::default(), &["uuid"])
                .await
                .map(|vms| vms.into_iter().map(|vm| vm.uuid).collect());
            let _ = tx.send(Message::Inventory(result));
        });
    }

    fn on_inventory(&mut self, result: Result<Vec<Uuid>, StoreError>) {
        let live: HashSet<Uuid> = match result {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "seen VM sweep failed");
                self.metrics.record_error("sweep");
                return;
            }
        };
        let reaped: Vec<Uuid> = self.seen.keys().filter(|id| !live.contains(id)).copied().collect();
        for uuid in &reaped {
            self.seen.remove(uuid);
            self.applied_loads.remove(uuid);
            self.displays.forget(*uuid);
            self.restarts.cancel(*uuid);
            self.stop_timers.cancel(uuid);
        }
        if !reaped.is_empty() {
            info!(reaped = reaped.len(), remaining = self.seen.len(), "forgot deleted VMs");
        }
    }

    fn log_summary(&self) {
        trace!(
            seen = self.seen.len(),
            provisioning = self.provisioning.len(),
            pending_restarts = self.restarts.pending_count(),
            stop_timers = self.stop_timers.len(),
            displays = self.displays.active_count(),
            "reconciler state"
        );
    }
}

/// Force-stop a VM in the background. A VM that is already down is fine.
pub(crate) fn spawn_force_stop(store: Arc<dyn VmStore>, uuid: Uuid) {
    tokio::spawn(async move {
        match store.stop(uuid, &StopOptions::forced()).await {
            Ok(()) => info!(vm = %uuid, "forced stop"),
            Err(e) if e.is_not_running() => debug!(vm = %uuid, "VM already stopped"),
            Err(e) => warn!(vm = %uuid, error = %e, "forced stop failed"),
        }
    });
}

async fn rotate_logs(script: &std::path::Path, uuid: Uuid) -> Result<()> {
    let id = uuid.to_string();
    crate::store::vmadm::run_tool(script, &[id.as_str()], None).await?;
    debug!(vm = %uuid, "rotated logs");
    Ok(())
}

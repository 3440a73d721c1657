//! Out-of-band VM operations: stop, reset, sysrq, info, reload-display and
//! state waits.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmadmd_protocol::{InfoType, SysrqKind, UnknownValue, WaitState};

use crate::display::DisplaySessionManager;
use crate::hypervisor::{monitor_line, run_command, HypervisorControl};
use crate::state_waiter::{StateWaiter, WaitError};
use crate::store::{Brand, StopOptions, StoreError, VmRecord, VmState, VmStore, CONTROL_FIELDS};
use crate::timers::TimerRegistry;

/// Pending force-stop deadlines, keyed by VM.
pub type StopTimers = TimerRegistry<Uuid>;

/// Where `sysrq screenshot` leaves the image, inside the zone.
const SCREENDUMP_PATH: &str = "/tmp/vm.ppm";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    BadRequest(String),

    #[error("VM {0} not found")]
    NotFound(Uuid),

    #[error("no VM named \"{0}\"")]
    UnknownId(String),

    #[error("vmadmd only handles \"{action}\" for {supported} (your brand is: {brand})")]
    UnsupportedBrand {
        action: &'static str,
        supported: &'static str,
        brand: Brand,
    },

    #[error("unable to {action} VM from state \"{state}\", must be {allowed}")]
    InvalidState {
        action: &'static str,
        state: VmState,
        allowed: &'static str,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error("{0:#}")]
    Hypervisor(anyhow::Error),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(uuid) => Self::NotFound(uuid),
            other => Self::Store(other),
        }
    }
}

impl From<UnknownValue> for ControlError {
    fn from(e: UnknownValue) -> Self {
        Self::BadRequest(e.to_string())
    }
}

/// Whole milliseconds of `d`, saturating at `u64::MAX`.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Arm (or re-arm) the force-stop deadline of a VM.
pub fn arm_stop_timer(timers: &StopTimers, store: Arc<dyn VmStore>, uuid: Uuid, delay: Duration) -> u64 {
    if let Some(previous) = timers.deadline(&uuid) {
        let remaining_ms = millis(previous.saturating_duration_since(tokio::time::Instant::now()));
        debug!(vm = %uuid, remaining_ms, "replacing pending stop timer");
    }
    debug!(vm = %uuid, delay_ms = millis(delay), "arming stop timer");
    timers.arm(uuid, delay, force_stop_if_expired(store, uuid))
}

/// Force-stop a VM whose graceful stop ran past its transition deadline.
/// A VM that has since stopped, or started stopping again with a later
/// deadline, is left alone.
async fn force_stop_if_expired(store: Arc<dyn VmStore>, uuid: Uuid) {
    let vm = match store.load(uuid, CONTROL_FIELDS).await {
        Ok(vm) => vm,
        Err(e) => {
            warn!(vm = %uuid, error = %e, "stop timer: failed to reload VM");
            return;
        }
    };
    if !stop_expired(&vm, chrono::Utc::now().timestamp_millis()) {
        debug!(vm = %uuid, state = %vm.state, "stop timer fired, VM no longer needs a forced stop");
        return;
    }

    info!(vm = %uuid, "graceful stop timed out, forcing stop");
    match store.stop(uuid, &StopOptions::forced()).await {
        Ok(()) => {}
        Err(e) if e.is_not_running() => debug!(vm = %uuid, "VM already stopped"),
        Err(e) => warn!(vm = %uuid, error = %e, "forced stop failed"),
    }
}

/// A VM is overdue when it is still stopping past its transition deadline.
pub fn stop_expired(vm: &VmRecord, now_ms: i64) -> bool {
    vm.state == VmState::Stopping && vm.transition_expire.is_some_and(|expire| now_ms >= expire)
}

/// Executes control surface requests.
#[derive(Clone)]
pub struct ControlDispatcher {
    store: Arc<dyn VmStore>,
    hypervisor: Arc<dyn HypervisorControl>,
    displays: Arc<DisplaySessionManager>,
    stop_timers: StopTimers,
    waiter: StateWaiter,
}

impl ControlDispatcher {
    pub fn new(
        store: Arc<dyn VmStore>,
        hypervisor: Arc<dyn HypervisorControl>,
        displays: Arc<DisplaySessionManager>,
        stop_timers: StopTimers,
        waiter: StateWaiter,
    ) -> Self {
        Self {
            store,
            hypervisor,
            displays,
            stop_timers,
            waiter,
        }
    }

    async fn load(&self, uuid: Uuid) -> Result<VmRecord, ControlError> {
        Ok(self.store.load(uuid, CONTROL_FIELDS).await?)
    }

    async fn hypervisor_command(&self, vm: &VmRecord, name: &str, arguments: Option<Value>) -> Result<Value, ControlError> {
        run_command(self.hypervisor.as_ref(), &vm.qmp_socket(), name, arguments)
            .await
            .map_err(ControlError::Hypervisor)
    }

    /// Ask the guest to power down, force-stopping it after `timeout_secs`
    /// if it is still stopping by then.
    pub async fn stop(&self, uuid: Uuid, timeout_secs: Option<u64>) -> Result<(), ControlError> {
        let timeout = match timeout_secs {
            Some(t) if t > 0 => Duration::from_secs(t),
            _ => return Err(ControlError::BadRequest("stop requires a positive timeout".into())),
        };
        let vm = self.load(uuid).await?;
        require_kvm(&vm, "stop")?;

        self.hypervisor_command(&vm, "system_powerdown", None).await?;
        arm_stop_timer(&self.stop_timers, Arc::clone(&self.store), uuid, timeout);
        info!(vm = %uuid, timeout_secs = timeout.as_secs(), "sent powerdown");
        Ok(())
    }

    pub async fn reset(&self, uuid: Uuid) -> Result<(), ControlError> {
        let vm = self.load(uuid).await?;
        require_kvm(&vm, "reset")?;
        if vm.state != VmState::Running {
            return Err(ControlError::InvalidState {
                action: "reset",
                state: vm.state,
                allowed: "\"running\"",
            });
        }
        self.hypervisor_command(&vm, "system_reset", None).await?;
        info!(vm = %uuid, "sent reset");
        Ok(())
    }

    pub async fn sysrq(&self, uuid: Uuid, kind: SysrqKind) -> Result<(), ControlError> {
        let vm = self.load(uuid).await?;
        require_kvm(&vm, "sysrq")?;
        if !matches!(vm.state, VmState::Running | VmState::Stopping) {
            return Err(ControlError::InvalidState {
                action: "send sysrq to",
                state: vm.state,
                allowed: "\"running\" or \"stopping\"",
            });
        }

        match kind {
            SysrqKind::Nmi => {
                self.hypervisor_command(&vm, "human-monitor-command", monitor_line("nmi 0"))
                    .await?;
            }
            SysrqKind::Screenshot => {
                // A key press wakes a blanked console so the dump shows something
                let wake = self
                    .hypervisor_command(
                        &vm,
                        "send-key",
                        Some(serde_json::json!({ "keys": [{ "type": "qcode", "data": "shift" }] })),
                    )
                    .await;
                let dump = self
                    .hypervisor_command(
                        &vm,
                        "screendump",
                        Some(serde_json::json!({ "filename": SCREENDUMP_PATH })),
                    )
                    .await;
                wake?;
                dump?;
            }
        }
        info!(vm = %uuid, request = %kind, "sent sysrq");
        Ok(())
    }

    /// Collect hypervisor introspection and display details.
    pub async fn info(&self, uuid: Uuid, types: &[InfoType]) -> Result<Value, ControlError> {
        let vm = self.load(uuid).await?;
        let allowed = match vm.brand {
            Brand::Kvm => matches!(vm.state, VmState::Running | VmState::Stopping),
            Brand::Bhyve => vm.state == VmState::Running,
            _ => {
                return Err(ControlError::UnsupportedBrand {
                    action: "info",
                    supported: "kvm and bhyve",
                    brand: vm.brand.clone(),
                })
            }
        };
        if !allowed {
            return Err(ControlError::InvalidState {
                action: "get info for",
                state: vm.state,
                allowed: if vm.brand == Brand::Kvm { "\"running\" or \"stopping\"" } else { "\"running\"" },
            });
        }

        let mut result = Map::new();
        if vm.brand.has_hypervisor_control() {
            for query in InfoType::QUERIES.iter().filter(|t| t.selected_by(types)) {
                let Some(command) = query.query_command() else {
                    continue;
                };
                let value = self.hypervisor_command(&vm, &command, None).await?;
                result.insert(query.as_str().to_string(), value);
            }
        }

        let display = self.displays.describe(uuid);
        if InfoType::Vnc.selected_by(types) {
            let vnc = display.vnc.map(serde_json::to_value).transpose().map_err(|e| {
                ControlError::Hypervisor(anyhow::Error::new(e).context("failed to encode vnc details"))
            })?;
            result.insert("vnc".into(), vnc.unwrap_or_else(|| Value::Object(Map::new())));
        }
        if InfoType::Spice.selected_by(types) {
            let spice = display.spice.map(serde_json::to_value).transpose().map_err(|e| {
                ControlError::Hypervisor(anyhow::Error::new(e).context("failed to encode spice details"))
            })?;
            result.insert("spice".into(), spice.unwrap_or_else(|| Value::Object(Map::new())));
        }

        Ok(Value::Object(result))
    }

    /// Rebuild the display session of a VM from its current configuration.
    pub async fn reload_display(&self, uuid: Uuid) -> Result<(), ControlError> {
        let vm = self.load(uuid).await?;
        if !vm.brand.has_display() {
            return Err(ControlError::UnsupportedBrand {
                action: "reload_display",
                supported: "kvm and bhyve",
                brand: vm.brand,
            });
        }
        self.displays.reload(&vm).await.map_err(ControlError::Hypervisor)?;
        info!(vm = %uuid, "reloaded display");
        Ok(())
    }

    /// Block until the VM reaches `state` or `timeout_secs` pass.
    pub async fn wait(&self, uuid: Uuid, state: &str, timeout_secs: Option<u64>) -> Result<(), ControlError> {
        let target: WaitState = state.parse()?;
        let timeout = match timeout_secs {
            Some(t) if t > 0 => Duration::from_secs(t),
            _ => return Err(ControlError::BadRequest("wait requires a positive timeout".into())),
        };

        // Subscribe before looking so a transition in between is not missed
        let waiting = self.waiter.wait_for(uuid, target, timeout);
        let vm = self.load(uuid).await?;
        let reached = match target {
            WaitState::Running => vm.is_running(),
            WaitState::Stopped => vm.state.is_stopped(),
        };
        if reached {
            return Ok(());
        }
        Ok(waiting.await?)
    }
}

fn require_kvm(vm: &VmRecord, action: &'static str) -> Result<(), ControlError> {
    if vm.brand.has_hypervisor_control() {
        Ok(())
    } else {
        Err(ControlError::UnsupportedBrand {
            action,
            supported: "kvm",
            brand: vm.brand.clone(),
        })
    }
}

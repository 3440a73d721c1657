//! Startup pass over every VM on the host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::{spawn_force_stop, Reconciler, SeenVm};
use crate::control::arm_stop_timer;
use crate::store::{LookupFilter, StartOptions, VmRecord, VmState, INVENTORY_FIELDS};

/// Grace added to a transition deadline before forcing a stop.
const STOP_GRACE_MS: i64 = 1000;

/// What to do about a VM found stuck in `stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStop {
    ForceNow,
    ArmIn(Duration),
}

/// Decide how a stopping VM found at startup is finished off. A stop whose
/// deadline passed while the daemon was down is forced right away, as is one
/// whose zone is already installed underneath.
pub fn pending_stop(vm: &VmRecord, now_ms: i64) -> Option<PendingStop> {
    if vm.state != VmState::Stopping {
        return None;
    }
    let expire = vm.transition_expire?;
    let halted = vm.transition_to.as_deref() == Some("stopped") && vm.real_state.as_deref() == Some("installed");
    if now_ms >= expire || halted {
        return Some(PendingStop::ForceNow);
    }
    let wait = (expire + STOP_GRACE_MS - now_ms).max(0) as u64;
    Some(PendingStop::ArmIn(Duration::from_millis(wait)))
}

impl Reconciler {
    /// Seed the reconciler from the current inventory and pick up work left
    /// over from before the daemon started. On the first start since host
    /// boot, autoboot VMs are booted and the marker file is created.
    pub async fn startup(&mut self, autoboot_marker: &Path) -> Result<()> {
        let vms = self
            .store
            .lookup(&LookupFilter::default(), INVENTORY_FIELDS)
            .await
            .context("inventory lookup failed")?;
        let first_start = !tokio::fs::try_exists(autoboot_marker).await.unwrap_or(false);
        let now_ms = chrono::Utc::now().timestamp_millis();

        for vm in &vms {
            self.adopt(vm, first_start, now_ms);
        }

        if first_start {
            tokio::fs::write(autoboot_marker, b"booted")
                .await
                .with_context(|| format!("writing autoboot marker {}", autoboot_marker.display()))?;
        }
        info!(vms = vms.len(), first_start, "inventory loaded");
        Ok(())
    }

    fn adopt(&mut self, vm: &VmRecord, autoboot: bool, now_ms: i64) {
        let uuid = vm.uuid;
        let mut seen = SeenVm::default();
        seen.fill(vm);
        // A VM still provisioning gets its wait on its next event
        seen.provisioned = vm.state != VmState::Provisioning;
        self.seen.insert(uuid, seen);

        if vm.is_failed() {
            debug!(vm = %uuid, "skipping failed VM");
            return;
        }

        // A VM created but never booted is started on every daemon start
        if (vm.never_booted || (autoboot && vm.autoboot)) && !vm.is_running() {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                match store.start(uuid, &StartOptions::default()).await {
                    Ok(()) => info!(vm = %uuid, "autobooted"),
                    Err(e) => warn!(vm = %uuid, error = %e, "autoboot failed"),
                }
            });
        }

        if vm.brand.has_hypervisor_control() {
            match pending_stop(vm, now_ms) {
                Some(PendingStop::ForceNow) => {
                    info!(vm = %uuid, "stop deadline passed while down, forcing stop");
                    spawn_force_stop(Arc::clone(&self.store), uuid);
                }
                Some(PendingStop::ArmIn(delay)) => {
                    arm_stop_timer(&self.stop_timers, Arc::clone(&self.store), uuid, delay);
                }
                None => {}
            }
        }

        if vm.brand.has_display() && vm.is_running() {
            let displays = Arc::clone(&self.displays);
            let claim = displays.claim(uuid);
            let vm = vm.clone();
            tokio::spawn(async move {
                if let Err(e) = displays.start_claimed(&vm, claim).await {
                    warn!(vm = %vm.uuid, error = %e, "failed to start display session");
                }
            });
        }
    }
}

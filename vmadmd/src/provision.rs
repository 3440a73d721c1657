//! Waiting out VM provisioning.
//!
//! The provisioning scripts inside a zone leave markers under
//! `<zonepath>/root/var/svc/`. The waiter reads them to decide whether
//! provisioning is still running, has finished, or failed, and records the
//! result through the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::display::DisplaySessionManager;
use crate::store::{StoreError, VmRecord, VmStore, DISPLAY_FIELDS};
use crate::timers::TimerRegistry;

const MARKER_DIR: &str = "root/var/svc";
const MARKER_PROVISIONING: &str = "provisioning";
const MARKER_SUCCESS: &str = "provision_success";
const MARKER_FAILURE: &str = "provision_failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Success,
    Failure,
}

/// Provisioning progress as recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Markers {
    InProgress,
    Succeeded,
    Failed,
    Absent,
}

fn marker_path(zone_root: &Path, name: &str) -> PathBuf {
    zone_root.join(MARKER_DIR).join(name)
}

async fn exists(path: PathBuf) -> bool {
    tokio::fs::try_exists(&path).await.unwrap_or(false)
}

/// Read the markers of a zone. An in-progress marker takes precedence.
pub async fn read_markers(zone_root: &Path) -> Markers {
    if exists(marker_path(zone_root, MARKER_PROVISIONING)).await {
        Markers::InProgress
    } else if exists(marker_path(zone_root, MARKER_SUCCESS)).await {
        Markers::Succeeded
    } else if exists(marker_path(zone_root, MARKER_FAILURE)).await {
        Markers::Failed
    } else {
        Markers::Absent
    }
}

/// Whether the zone is being (re)provisioned right now.
pub async fn is_provisioning(zone_root: &Path) -> bool {
    exists(marker_path(zone_root, MARKER_PROVISIONING)).await
}

/// Resolves a provisioning VM to success or failure.
#[derive(Clone)]
pub struct ProvisioningWaiter {
    store: Arc<dyn VmStore>,
    timeout: Duration,
}

impl ProvisioningWaiter {
    pub fn new(store: Arc<dyn VmStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn wait(&self, vm: &VmRecord) -> ProvisionOutcome {
        let uuid = vm.uuid;
        let markers = read_markers(&vm.zone_root()).await;
        debug!(vm = %uuid, ?markers, "waiting for provisioning");

        match markers {
            Markers::InProgress => {
                match self.store.wait_for_provisioning_done(uuid, self.timeout).await {
                    Ok(()) => {}
                    Err(StoreError::Timeout(_)) => {
                        error!(vm = %uuid, timeout_secs = self.timeout.as_secs(), "provisioning timed out");
                        self.mark_failed(uuid).await;
                        return ProvisionOutcome::Failure;
                    }
                    Err(e) => {
                        error!(vm = %uuid, error = %e, "waiting for provisioning failed");
                        return ProvisionOutcome::Failure;
                    }
                }
                match self.store.unset_provisioning_transition(uuid).await {
                    Ok(()) => {
                        info!(vm = %uuid, "provisioning complete");
                        ProvisionOutcome::Success
                    }
                    Err(e) => {
                        error!(vm = %uuid, error = %e, "failed to clear provisioning transition");
                        ProvisionOutcome::Failure
                    }
                }
            }
            Markers::Succeeded => {
                self.clear_transition(uuid).await;
                info!(vm = %uuid, "provisioning already succeeded");
                ProvisionOutcome::Success
            }
            Markers::Failed => {
                warn!(vm = %uuid, "provisioning failed");
                self.mark_failed(uuid).await;
                ProvisionOutcome::Failure
            }
            Markers::Absent => {
                debug!(vm = %uuid, "no provisioning markers, assuming success");
                self.clear_transition(uuid).await;
                ProvisionOutcome::Success
            }
        }
    }

    async fn clear_transition(&self, uuid: Uuid) {
        if let Err(e) = self.store.unset_provisioning_transition(uuid).await {
            warn!(vm = %uuid, error = %e, "failed to clear provisioning transition");
        }
    }

    async fn mark_failed(&self, uuid: Uuid) {
        if let Err(e) = self.store.mark_failed(uuid).await {
            error!(vm = %uuid, error = %e, "failed to mark VM failed");
        }
    }
}

/// After a successful provisioning, bring the display of a running VM up
/// from fresh configuration. Stale display and stop timer state from before
/// provisioning is dropped.
pub async fn refresh_display(
    store: &dyn VmStore,
    displays: &DisplaySessionManager,
    stop_timers: &TimerRegistry<Uuid>,
    uuid: Uuid,
) -> Result<()> {
    let vm = store.load(uuid, DISPLAY_FIELDS).await?;
    if !vm.is_running() {
        return Ok(());
    }
    stop_timers.cancel(&uuid);
    displays.reload(&vm).await
}

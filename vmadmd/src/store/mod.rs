//! VM store: the authoritative VM records and lifecycle commands.
//!
//! The daemon never edits zone configuration itself. Everything goes through
//! the [`VmStore`] trait, implemented on a host by [`VmadmStore`].

pub mod vmadm;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use vmadm::VmadmStore;

/// Root of zone paths for VMs that do not report one.
const DEFAULT_ZONES_ROOT: &str = "/zones";

// ---------------------------------------------------------------------------
// Field sets
// ---------------------------------------------------------------------------

/// Fields consumed by the reconciler's full-load path and everything it
/// hands the record to (provisioning, display sessions, restart policy).
pub const FULL_LOAD_FIELDS: &[&str] = &[
    "uuid",
    "brand",
    "state",
    "zone_state",
    "zonepath",
    "autoboot",
    "docker",
    "internal_metadata",
    "exit_status",
    "boot_timestamp",
    "exit_timestamp",
    "transition_expire",
    "transition_to",
    "vnc_port",
    "vnc_password",
    "spice_port",
    "spice_password",
    "spice_opts",
];

/// Fields needed to decide on and schedule a restart.
pub const RESTART_FIELDS: &[&str] = &[
    "uuid",
    "brand",
    "state",
    "zone_state",
    "zonepath",
    "autoboot",
    "docker",
    "internal_metadata",
    "exit_status",
    "boot_timestamp",
    "exit_timestamp",
];

/// Fields needed to (re)start a display session.
pub const DISPLAY_FIELDS: &[&str] = &[
    "uuid",
    "brand",
    "state",
    "zone_state",
    "zonepath",
    "vnc_port",
    "vnc_password",
    "spice_port",
    "spice_password",
    "spice_opts",
];

/// Fields read by the startup inventory pass.
pub const INVENTORY_FIELDS: &[&str] = &[
    "uuid",
    "brand",
    "state",
    "zone_state",
    "zonepath",
    "autoboot",
    "never_booted",
    "docker",
    "internal_metadata",
    "transition_expire",
    "transition_to",
    "real_state",
    "vnc_port",
    "vnc_password",
    "spice_port",
    "spice_password",
    "spice_opts",
];

/// Fields needed by the control surface actions.
pub const CONTROL_FIELDS: &[&str] = &[
    "uuid",
    "brand",
    "state",
    "zone_state",
    "zonepath",
    "transition_expire",
    "transition_to",
    "real_state",
    "vnc_port",
    "vnc_password",
    "spice_port",
    "spice_password",
    "spice_opts",
];

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Virtualization flavor of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Brand {
    /// Full hardware virtualization with a QMP control channel.
    Kvm,
    /// Lightweight hypervisor; has a display but no QMP channel.
    Bhyve,
    Joyent,
    JoyentMinimal,
    Lx,
    #[default]
    Unknown,
    Other(String),
}

impl Brand {
    pub fn parse(s: &str) -> Self {
        match s {
            "kvm" => Self::Kvm,
            "bhyve" => Self::Bhyve,
            "joyent" => Self::Joyent,
            "joyent-minimal" => Self::JoyentMinimal,
            "lx" => Self::Lx,
            "" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Kvm => "kvm",
            Self::Bhyve => "bhyve",
            Self::Joyent => "joyent",
            Self::JoyentMinimal => "joyent-minimal",
            Self::Lx => "lx",
            Self::Unknown => "",
            Self::Other(s) => s,
        }
    }

    /// Brands that get display sessions and log rotation.
    pub fn has_display(&self) -> bool {
        matches!(self, Self::Kvm | Self::Bhyve)
    }

    /// Brands that expose the hypervisor control channel.
    pub fn has_hypervisor_control(&self) -> bool {
        matches!(self, Self::Kvm)
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Brand {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(Brand::parse(&s))
    }
}

impl Serialize for Brand {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// VM state as reported by the store (not the raw zone state).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum VmState {
    Running,
    Stopped,
    Stopping,
    Provisioning,
    Failed,
    Installed,
    Configured,
    Incomplete,
    Receiving,
    Down,
    #[default]
    Unknown,
    Other(String),
}

impl VmState {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "stopping" => Self::Stopping,
            "provisioning" => Self::Provisioning,
            "failed" => Self::Failed,
            "installed" => Self::Installed,
            "configured" => Self::Configured,
            "incomplete" => Self::Incomplete,
            "receiving" => Self::Receiving,
            "down" => Self::Down,
            "" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Stopping => "stopping",
            Self::Provisioning => "provisioning",
            Self::Failed => "failed",
            Self::Installed => "installed",
            Self::Configured => "configured",
            Self::Incomplete => "incomplete",
            Self::Receiving => "receiving",
            Self::Down => "down",
            Self::Unknown => "",
            Self::Other(s) => s,
        }
    }

    /// A VM that is installed but not running.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped | Self::Installed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VmState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(VmState::parse(&s))
    }
}

impl Serialize for VmState {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// VmRecord
// ---------------------------------------------------------------------------

/// Internal metadata keys used by restart policies.
pub const META_RESTART_POLICY: &str = "docker:restartpolicy";
pub const META_RESTART_COUNT: &str = "docker:restartcount";
pub const META_RESTART_DELAY: &str = "docker:restartdelay";

/// The subset of a VM's properties the daemon consumes. Fields that were not
/// requested in a load keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmRecord {
    pub uuid: Uuid,
    pub brand: Brand,
    pub state: VmState,
    pub zone_state: Option<String>,
    pub zonepath: Option<PathBuf>,
    pub autoboot: bool,
    /// Set on a freshly created VM until its first boot.
    pub never_booted: bool,
    pub docker: bool,
    pub internal_metadata: HashMap<String, serde_json::Value>,
    pub exit_status: Option<i32>,
    pub boot_timestamp: Option<DateTime<Utc>>,
    pub exit_timestamp: Option<DateTime<Utc>>,
    /// Deadline of the current transition, in milliseconds since the epoch.
    #[serde(deserialize_with = "de_opt_millis")]
    pub transition_expire: Option<i64>,
    pub transition_to: Option<String>,
    /// Zone state underneath a pending transition.
    pub real_state: Option<String>,
    pub vnc_port: Option<i32>,
    pub vnc_password: Option<String>,
    pub spice_port: Option<i32>,
    pub spice_password: Option<String>,
    pub spice_opts: Option<String>,
}

impl VmRecord {
    pub fn new(uuid: Uuid, brand: Brand, state: VmState) -> Self {
        Self {
            uuid,
            brand,
            state,
            ..Default::default()
        }
    }

    /// The VM's zone path, defaulting to `/zones/<uuid>`.
    pub fn zone_root(&self) -> PathBuf {
        self.zonepath
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONES_ROOT).join(self.uuid.to_string()))
    }

    /// Path of the hypervisor control socket inside the zone.
    pub fn qmp_socket(&self) -> PathBuf {
        self.zone_root().join("root/tmp/vm.qmp")
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Running || self.zone_state.as_deref() == Some("running")
    }

    /// Failed VMs are never driven automatically.
    pub fn is_failed(&self) -> bool {
        self.state == VmState::Failed
    }

    pub fn restart_policy(&self) -> Option<&str> {
        self.internal_metadata
            .get(META_RESTART_POLICY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn restart_count(&self) -> u32 {
        self.internal_metadata
            .get(META_RESTART_COUNT)
            .and_then(json_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn restart_delay_ms(&self) -> Option<u64> {
        self.internal_metadata.get(META_RESTART_DELAY).and_then(json_u64)
    }

    /// How long the VM ran before its last exit.
    pub fn last_runtime(&self) -> Option<Duration> {
        let boot = self.boot_timestamp?;
        let exit = self.exit_timestamp?;
        (exit - boot).to_std().ok()
    }
}

/// Metadata values are written by several tools, some as strings.
fn json_u64(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_opt_millis<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("VM {0} not found")]
    NotFound(Uuid),

    #[error("VM {0} is busy")]
    Busy(Uuid),

    #[error("VM {uuid} is in invalid state: {detail}")]
    InvalidState { uuid: Uuid, detail: String },

    #[error("timed out waiting for VM {0}")]
    Timeout(Uuid),

    #[error(transparent)]
    Command(#[from] anyhow::Error),
}

impl StoreError {
    /// Stopping a VM that is already down is not a failure.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::InvalidState { detail, .. } if detail.contains("not running"))
    }
}

/// Options for [`VmStore::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Bump the restart counter as part of this start.
    pub increment_restart_count: bool,
    /// Restart delay to persist for the next restart.
    pub restart_delay_ms: Option<u64>,
}

/// Options for [`VmStore::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    pub force: bool,
}

impl StopOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Filter for [`VmStore::lookup`]. The default matches every VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupFilter {
    pub brand: Option<Brand>,
}

impl LookupFilter {
    #[cfg(test)]
    pub fn matches(&self, vm: &VmRecord) -> bool {
        self.brand.as_ref().map_or(true, |b| *b == vm.brand)
    }
}

/// Zone configuration and lifecycle manager.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// Load one VM, restricted to `fields`.
    async fn load(&self, uuid: Uuid, fields: &[&str]) -> Result<VmRecord, StoreError>;

    /// List VMs matching `filter`, restricted to `fields`.
    async fn lookup(&self, filter: &LookupFilter, fields: &[&str]) -> Result<Vec<VmRecord>, StoreError>;

    async fn start(&self, uuid: Uuid, opts: &StartOptions) -> Result<(), StoreError>;

    async fn stop(&self, uuid: Uuid, opts: &StopOptions) -> Result<(), StoreError>;

    /// Apply a JSON update payload to a VM.
    async fn update(&self, uuid: Uuid, payload: &serde_json::Value) -> Result<(), StoreError>;

    /// Record that a VM failed permanently.
    async fn mark_failed(&self, uuid: Uuid) -> Result<(), StoreError>;

    /// Block until the VM leaves the provisioning state, up to `timeout`.
    async fn wait_for_provisioning_done(&self, uuid: Uuid, timeout: Duration) -> Result<(), StoreError>;

    /// Clear the provisioning transition recorded on the VM.
    async fn unset_provisioning_transition(&self, uuid: Uuid) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_record_from_vmadm_json() {
        let json = r#"{
            "uuid": "fb622681-3d62-413b-dc8a-c7515367464f",
            "brand": "kvm",
            "state": "running",
            "zone_state": "running",
            "zonepath": "/zones/fb622681-3d62-413b-dc8a-c7515367464f",
            "autoboot": true,
            "vnc_port": 5901,
            "transition_expire": "1494617613097",
            "internal_metadata": {"docker:restartpolicy": "always", "docker:restartcount": "3"}
        }"#;
        let vm: VmRecord = serde_json::from_str(json).unwrap();
        assert_eq!(vm.brand, Brand::Kvm);
        assert_eq!(vm.state, VmState::Running);
        assert!(vm.autoboot);
        assert_eq!(vm.vnc_port, Some(5901));
        assert_eq!(vm.transition_expire, Some(1_494_617_613_097));
        assert_eq!(vm.restart_policy(), Some("always"));
        assert_eq!(vm.restart_count(), 3);
        assert_eq!(vm.restart_delay_ms(), None);
    }

    #[test]
    fn test_vm_record_numeric_transition_expire() {
        let vm: VmRecord =
            serde_json::from_str(r#"{"uuid":"fb622681-3d62-413b-dc8a-c7515367464f","transition_expire":42}"#)
                .unwrap();
        assert_eq!(vm.transition_expire, Some(42));
    }

    #[test]
    fn test_unknown_brand_and_state_are_preserved() {
        let vm: VmRecord = serde_json::from_str(
            r#"{"uuid":"fb622681-3d62-413b-dc8a-c7515367464f","brand":"sngl","state":"zombie"}"#,
        )
        .unwrap();
        assert_eq!(vm.brand, Brand::Other("sngl".into()));
        assert_eq!(vm.state, VmState::Other("zombie".into()));
        let back = serde_json::to_value(&vm).unwrap();
        assert_eq!(back["brand"], "sngl");
        assert_eq!(back["state"], "zombie");
    }

    #[test]
    fn test_zone_root_defaults_to_zones_uuid() {
        let id = Uuid::new_v4();
        let vm = VmRecord::new(id, Brand::Kvm, VmState::Running);
        assert_eq!(vm.zone_root(), PathBuf::from(format!("/zones/{}", id)));
        assert_eq!(vm.qmp_socket(), PathBuf::from(format!("/zones/{}/root/tmp/vm.qmp", id)));
    }

    #[test]
    fn test_last_runtime() {
        let mut vm = VmRecord::new(Uuid::new_v4(), Brand::Joyent, VmState::Stopped);
        assert!(vm.last_runtime().is_none());
        let boot = Utc::now();
        vm.boot_timestamp = Some(boot);
        vm.exit_timestamp = Some(boot + chrono::Duration::milliseconds(1500));
        assert_eq!(vm.last_runtime(), Some(Duration::from_millis(1500)));

        // Exit before boot means the VM has been booted again since.
        vm.exit_timestamp = Some(boot - chrono::Duration::seconds(1));
        assert!(vm.last_runtime().is_none());
    }

    #[test]
    fn test_brand_capabilities() {
        assert!(Brand::Kvm.has_display());
        assert!(Brand::Bhyve.has_display());
        assert!(!Brand::Joyent.has_display());
        assert!(!Brand::Lx.has_display());
        assert!(Brand::Kvm.has_hypervisor_control());
        assert!(!Brand::Bhyve.has_hypervisor_control());
    }

    #[test]
    fn test_store_error_not_running() {
        let id = Uuid::new_v4();
        assert!(StoreError::InvalidState { uuid: id, detail: "VM is not running".into() }.is_not_running());
        assert!(!StoreError::Busy(id).is_not_running());
    }

    #[test]
    fn test_lookup_filter() {
        let vm = VmRecord::new(Uuid::new_v4(), Brand::Kvm, VmState::Running);
        assert!(LookupFilter::default().matches(&vm));
        assert!(LookupFilter { brand: Some(Brand::Kvm) }.matches(&vm));
        assert!(!LookupFilter { brand: Some(Brand::Lx) }.matches(&vm));
    }
}

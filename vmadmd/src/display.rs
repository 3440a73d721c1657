//! Remote display sessions.
//!
//! A display session is a TCP listener on the host's admin address whose
//! connections are piped to the VNC or SPICE Unix socket inside the VM's
//! zone. Each VM has at most one session per protocol, and starting a
//! session replaces whatever the VM had before.
//!
//! Starts and stops for one VM are ordered by a per-VM epoch. Every
//! operation claims the next epoch when it is issued, and a start only
//! installs its listener if no later operation has claimed the VM since.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmadmd_protocol::{DisplayInfo, SpiceInfo, VncInfo, VNC_BASE_PORT};

use crate::hypervisor::{run_command, HypervisorControl};
use crate::metrics::MetricsRegistry;
use crate::store::VmRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayProtocol {
    Vnc,
    Spice,
}

impl DisplayProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vnc => "vnc",
            Self::Spice => "spice",
        }
    }
}

impl fmt::Display for DisplayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The session a VM's configuration asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    pub protocol: DisplayProtocol,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub password: Option<String>,
    pub spice_opts: Option<String>,
}

impl SessionPlan {
    /// SPICE wins whenever a SPICE port is configured. A port of `-1`
    /// disables the protocol; unset or `0` means any free port.
    pub fn for_vm(vm: &VmRecord) -> Option<Self> {
        if let Some(port) = vm.spice_port.filter(|p| *p >= 0) {
            return Some(Self {
                protocol: DisplayProtocol::Spice,
                port: clamp_port(port),
                password: vm.spice_password.clone().filter(|p| !p.is_empty()),
                spice_opts: vm.spice_opts.clone().filter(|o| !o.is_empty()),
            });
        }
        match vm.vnc_port {
            Some(-1) => None,
            port => Some(Self {
                protocol: DisplayProtocol::Vnc,
                port: clamp_port(port.unwrap_or(0)),
                password: vm.vnc_password.clone().filter(|p| !p.is_empty()),
                spice_opts: None,
            }),
        }
    }
}

fn clamp_port(port: i32) -> u16 {
    u16::try_from(port).unwrap_or(0)
}

struct Session {
    port: u16,
    password: Option<String>,
    spice_opts: Option<String>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct VmDisplay {
    vnc: Option<Session>,
    spice: Option<Session>,
}

impl VmDisplay {
    fn take_all(&mut self) -> Vec<Session> {
        self.vnc.take().into_iter().chain(self.spice.take()).collect()
    }
}

#[derive(Default)]
struct Sessions {
    live: HashMap<Uuid, VmDisplay>,
    /// Latest claim per VM. Epochs come from one host-wide counter, so a
    /// forgotten VM never hands an old epoch out again.
    epochs: HashMap<Uuid, u64>,
    next_epoch: u64,
}

impl Sessions {
    fn is_current(&self, claim: DisplayClaim) -> bool {
        self.epochs.get(&claim.uuid) == Some(&claim.epoch)
    }

    fn remove(&mut self, uuid: Uuid) -> Vec<Session> {
        self.live.remove(&uuid).map(|mut d| d.take_all()).unwrap_or_default()
    }
}

/// The right to change a VM's display, handed out in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayClaim {
    uuid: Uuid,
    epoch: u64,
}

/// Owns every active display session on the host.
pub struct DisplaySessionManager {
    host: String,
    hypervisor: Arc<dyn HypervisorControl>,
    metrics: MetricsRegistry,
    sessions: Mutex<Sessions>,
}

impl DisplaySessionManager {
    pub fn new(host: impl Into<String>, hypervisor: Arc<dyn HypervisorControl>, metrics: MetricsRegistry) -> Self {
        Self {
            host: host.into(),
            hypervisor,
            metrics,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the VM's display for the next operation. Any start claimed
    /// earlier and still in flight will not install its session.
    pub fn claim(&self, uuid: Uuid) -> DisplayClaim {
        let mut sessions = self.lock();
        sessions.next_epoch += 1;
        let epoch = sessions.next_epoch;
        sessions.epochs.insert(uuid, epoch);
        DisplayClaim { uuid, epoch }
    }

    /// Drop the claim bookkeeping of a VM that no longer exists. In-flight
    /// work for it is discarded.
    pub fn forget(&self, uuid: Uuid) {
        self.lock().epochs.remove(&uuid);
    }

    /// Start a display session for a running VM, replacing any existing one.
    pub async fn start(&self, vm: &VmRecord) -> Result<()> {
        let claim = self.claim(vm.uuid);
        self.start_claimed(vm, claim).await
    }

    /// Start under a claim taken earlier with [`claim`](Self::claim).
    pub async fn start_claimed(&self, vm: &VmRecord, claim: DisplayClaim) -> Result<()> {
        if !vm.is_running() {
            debug!(vm = %vm.uuid, state = %vm.state, "not starting display for VM that is not running");
            return Ok(());
        }
        let Some(plan) = SessionPlan::for_vm(vm) else {
            debug!(vm = %vm.uuid, "display disabled for VM");
            return Ok(());
        };

        // The old listener must be gone before a fixed port is bound again.
        if !self.close_claimed(claim).await {
            debug!(vm = %vm.uuid, "display start superseded before it began");
            return Ok(());
        }

        if let Some(password) = &plan.password {
            if vm.brand.has_hypervisor_control() {
                let args = json!({ "protocol": plan.protocol.as_str(), "password": password });
                if let Err(e) = run_command(self.hypervisor.as_ref(), &vm.qmp_socket(), "set_password", Some(args)).await {
                    warn!(vm = %vm.uuid, protocol = %plan.protocol, error = %e, "failed to set display password");
                    self.metrics.record_error("display_password");
                }
            }
        }

        let listener = TcpListener::bind((self.host.as_str(), plan.port))
            .await
            .with_context(|| format!("failed to bind {} listener on {}:{}", plan.protocol, self.host, plan.port))?;
        let port = listener.local_addr().context("display listener has no address")?.port();

        let target = vm.zone_root().join(format!("root/tmp/vm.{}", plan.protocol.as_str()));
        let task = tokio::spawn(accept_loop(vm.uuid, plan.protocol, listener, target));
        let session = Session {
            port,
            password: plan.password,
            spice_opts: plan.spice_opts,
            task,
        };

        let installed = {
            let mut sessions = self.lock();
            if sessions.is_current(claim) {
                let entry = sessions.live.entry(vm.uuid).or_default();
                let replaced = entry.take_all();
                match plan.protocol {
                    DisplayProtocol::Vnc => entry.vnc = Some(session),
                    DisplayProtocol::Spice => entry.spice = Some(session),
                }
                self.metrics.set_display_sessions(sessions.live.len());
                Ok(replaced)
            } else {
                Err(session)
            }
        };
        let replaced = match installed {
            Ok(replaced) => replaced,
            Err(stale) => {
                // A later stop or start took the VM over while we were binding
                stale.task.abort();
                let _ = stale.task.await;
                debug!(vm = %vm.uuid, port, "display start superseded, listener dropped");
                return Ok(());
            }
        };
        for old in replaced {
            old.task.abort();
        }

        info!(vm = %vm.uuid, protocol = %plan.protocol, host = %self.host, port, "display session started");
        Ok(())
    }

    /// Close every session of a VM and cancel any start still in flight.
    /// Safe to call when there is none.
    pub async fn stop(&self, uuid: Uuid) {
        let claim = self.claim(uuid);
        self.stop_claimed(claim).await;
    }

    /// Stop under a claim taken earlier with [`claim`](Self::claim).
    pub async fn stop_claimed(&self, claim: DisplayClaim) {
        if !self.close_claimed(claim).await {
            debug!(vm = %claim.uuid, "display stop superseded by a later operation");
        }
    }

    /// Close the VM's sessions if `claim` is still the latest one.
    async fn close_claimed(&self, claim: DisplayClaim) -> bool {
        let closed = {
            let mut sessions = self.lock();
            if !sessions.is_current(claim) {
                return false;
            }
            let closed = sessions.remove(claim.uuid);
            self.metrics.set_display_sessions(sessions.live.len());
            closed
        };
        for session in closed {
            session.task.abort();
            // Wait for the listener to be dropped
            let _ = session.task.await;
            debug!(vm = %claim.uuid, port = session.port, "display session closed");
        }
        true
    }

    /// Close and restart the sessions of a VM from a freshly loaded record.
    pub async fn reload(&self, vm: &VmRecord) -> Result<()> {
        let claim = self.claim(vm.uuid);
        if !self.close_claimed(claim).await {
            return Ok(());
        }
        self.start_claimed(vm, claim).await
    }

    /// Descriptor of the VM's live sessions.
    pub fn describe(&self, uuid: Uuid) -> DisplayInfo {
        let sessions = self.lock();
        let Some(display) = sessions.live.get(&uuid) else {
            return DisplayInfo::default();
        };
        DisplayInfo {
            vnc: display.vnc.as_ref().map(|s| VncInfo {
                host: self.host.clone(),
                port: s.port,
                display: s.port.checked_sub(VNC_BASE_PORT),
                password: s.password.clone(),
            }),
            spice: display.spice.as_ref().map(|s| SpiceInfo {
                host: self.host.clone(),
                port: s.port,
                password: s.password.clone(),
                spice_opts: s.spice_opts.clone(),
            }),
        }
    }

    pub fn has_session(&self, uuid: Uuid) -> bool {
        self.lock().live.contains_key(&uuid)
    }

    pub fn active_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Close every session on the host.
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.lock().live.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }
}

/// Accept display clients until the session is closed. Dropping this future
/// drops the listener and every open connection with it.
async fn accept_loop(uuid: Uuid, protocol: DisplayProtocol, listener: TcpListener, target: PathBuf) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => {
                    debug!(vm = %uuid, %protocol, peer = %peer, "display client connected");
                    connections.spawn(pipe_connection(uuid, protocol, client, target.clone()));
                }
                Err(e) => {
                    warn!(vm = %uuid, %protocol, error = %e, "display accept failed");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn pipe_connection(uuid: Uuid, protocol: DisplayProtocol, mut client: TcpStream, target: PathBuf) {
    let mut console = match UnixStream::connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            warn!(vm = %uuid, %protocol, socket = %target.display(), error = %e, "failed to connect to display socket");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut client, &mut console).await {
        Ok((up, down)) => debug!(vm = %uuid, %protocol, up, down, "display client disconnected"),
        Err(e) => info!(vm = %uuid, %protocol, error = %e, "display connection closed with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::store::{Brand, VmState};
    use crate::testing::FakeHypervisor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn manager(hv: &FakeHypervisor) -> DisplaySessionManager {
        DisplaySessionManager::new("127.0.0.1", Arc::new(hv.clone()), MetricsRegistry::new())
    }

    fn running_kvm() -> VmRecord {
        VmRecord::new(Uuid::new_v4(), Brand::Kvm, VmState::Running)
    }

    #[test]
    fn test_plan_prefers_spice() {
        let mut vm = running_kvm();
        vm.vnc_port = Some(5901);
        vm.spice_port = Some(0);
        vm.spice_password = Some("s3cret".into());
        vm.spice_opts = Some("-vga qxl".into());
        let plan = SessionPlan::for_vm(&vm).unwrap();
        assert_eq!(plan.protocol, DisplayProtocol::Spice);
        assert_eq!(plan.port, 0);
        assert_eq!(plan.password.as_deref(), Some("s3cret"));
        assert_eq!(plan.spice_opts.as_deref(), Some("-vga qxl"));
    }

    #[test]
    fn test_plan_falls_back_to_vnc() {
        let mut vm = running_kvm();
        vm.spice_port = Some(-1);
        vm.vnc_port = Some(5901);
        let plan = SessionPlan::for_vm(&vm).unwrap();
        assert_eq!(plan.protocol, DisplayProtocol::Vnc);
        assert_eq!(plan.port, 5901);

        vm.vnc_port = None;
        assert_eq!(SessionPlan::for_vm(&vm).unwrap().port, 0);
    }

    #[test]
    fn test_plan_vnc_disabled() {
        let mut vm = running_kvm();
        vm.vnc_port = Some(-1);
        assert!(SessionPlan::for_vm(&vm).is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let vm = running_kvm();

        displays.start(&vm).await.unwrap();
        let first = displays.describe(vm.uuid).vnc.unwrap().port;
        displays.start(&vm).await.unwrap();
        let info = displays.describe(vm.uuid);

        assert_eq!(displays.active_count(), 1);
        assert!(info.spice.is_none());
        let vnc = info.vnc.unwrap();
        assert_ne!(vnc.port, 0);
        assert_eq!(vnc.host, "127.0.0.1");
        // The first listener is closed
        if vnc.port != first {
            assert!(TcpStream::connect(("127.0.0.1", first)).await.is_err());
        }
        displays.stop_all().await;
    }

    #[tokio::test]
    async fn test_start_ignores_stopped_vm() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let vm = VmRecord::new(Uuid::new_v4(), Brand::Kvm, VmState::Stopped);
        displays.start(&vm).await.unwrap();
        assert!(!displays.has_session(vm.uuid));
        assert_eq!(displays.describe(vm.uuid), DisplayInfo::default());
    }

    #[tokio::test]
    async fn test_password_set_through_hypervisor_for_kvm_only() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);

        let mut kvm = running_kvm();
        kvm.vnc_password = Some("pw".into());
        displays.start(&kvm).await.unwrap();
        let calls = hv.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, kvm.qmp_socket());
        assert_eq!(calls[0].1, "set_password");
        assert_eq!(calls[0].2.as_ref().unwrap()["protocol"], "vnc");
        assert_eq!(displays.describe(kvm.uuid).vnc.unwrap().password.as_deref(), Some("pw"));

        let mut bhyve = VmRecord::new(Uuid::new_v4(), Brand::Bhyve, VmState::Running);
        bhyve.vnc_password = Some("pw".into());
        displays.start(&bhyve).await.unwrap();
        assert_eq!(hv.calls().len(), 1);
        assert!(displays.has_session(bhyve.uuid));
        displays.stop_all().await;
    }

    #[tokio::test]
    async fn test_password_failure_still_starts_session() {
        let hv = FakeHypervisor::new();
        hv.refuse_connections();
        let displays = manager(&hv);
        let mut vm = running_kvm();
        vm.vnc_password = Some("pw".into());
        displays.start(&vm).await.unwrap();
        assert!(displays.has_session(vm.uuid));
        displays.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let vm = running_kvm();
        displays.start(&vm).await.unwrap();
        let port = displays.describe(vm.uuid).vnc.unwrap().port;

        displays.stop(vm.uuid).await;
        displays.stop(vm.uuid).await;
        assert!(!displays.has_session(vm.uuid));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_while_start_is_setting_password() {
        let hv = FakeHypervisor::new();
        hv.hold_connections();
        let displays = Arc::new(manager(&hv));
        let mut vm = running_kvm();
        vm.vnc_password = Some("pw".into());

        let start = tokio::spawn({
            let displays = Arc::clone(&displays);
            let vm = vm.clone();
            async move { displays.start(&vm).await }
        });
        while hv.connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        displays.stop(vm.uuid).await;
        hv.release_connections();
        start.await.unwrap().unwrap();

        // The stop came last, so the VM is left without a listener
        assert!(!displays.has_session(vm.uuid));
        assert_eq!(displays.active_count(), 0);
    }

    #[tokio::test]
    async fn test_earlier_stop_does_not_close_later_start() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let vm = running_kvm();

        let stop = displays.claim(vm.uuid);
        let start = displays.claim(vm.uuid);
        displays.start_claimed(&vm, start).await.unwrap();
        displays.stop_claimed(stop).await;

        assert!(displays.has_session(vm.uuid));
        displays.stop_all().await;
    }

    #[tokio::test]
    async fn test_forgotten_vm_discards_pending_start() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let vm = running_kvm();

        let claim = displays.claim(vm.uuid);
        displays.forget(vm.uuid);
        displays.start_claimed(&vm, claim).await.unwrap();
        assert!(!displays.has_session(vm.uuid));

        // A fresh claim works again
        displays.start(&vm).await.unwrap();
        assert!(displays.has_session(vm.uuid));
        displays.stop_all().await;
    }

    #[tokio::test]
    async fn test_describe_spice() {
        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let mut vm = VmRecord::new(Uuid::new_v4(), Brand::Bhyve, VmState::Running);
        vm.spice_port = Some(0);
        vm.spice_opts = Some("opts".into());
        displays.start(&vm).await.unwrap();

        let info = displays.describe(vm.uuid);
        assert!(info.vnc.is_none());
        let spice = info.spice.unwrap();
        assert_eq!(spice.spice_opts.as_deref(), Some("opts"));
        assert!(spice.password.is_none());
        displays.stop_all().await;
    }

    #[tokio::test]
    async fn test_connections_are_piped_to_zone_socket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("root/tmp")).unwrap();
        let console = UnixListener::bind(dir.path().join("root/tmp/vm.vnc")).unwrap();

        let hv = FakeHypervisor::new();
        let displays = manager(&hv);
        let mut vm = running_kvm();
        vm.zonepath = Some(dir.path().to_path_buf());
        displays.start(&vm).await.unwrap();
        let port = displays.describe(vm.uuid).vnc.unwrap().port;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut server_side, _) = console.accept().await.unwrap();

        client.write_all(b"RFB?").await.unwrap();
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"RFB?");

        server_side.write_all(b"ok").await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");

        displays.stop_all().await;
    }
}

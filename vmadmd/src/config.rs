use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the vmadmd daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter when `RUST_LOG` is unset (e.g. "info", "vmadmd=debug").
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub display: DisplayConfig,
    pub zones: ZonesConfig,
    pub reconciler: ReconcilerConfig,
    pub restart: RestartConfig,
    pub hypervisor: HypervisorConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.reconciler.sweep_interval_secs >= 1,
            "reconciler.sweep_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.reconciler.summary_interval_secs >= 1,
            "reconciler.summary_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.reconciler.provision_timeout_secs >= 1,
            "reconciler.provision_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.restart.base_delay_ms >= 1, "restart.base_delay_ms must be >= 1");
        anyhow::ensure!(
            self.hypervisor.command_timeout_secs >= 1,
            "hypervisor.command_timeout_secs must be >= 1"
        );
        if let Some(addr) = &self.display.bind_addr {
            anyhow::ensure!(
                addr.parse::<IpAddr>().is_ok(),
                "display.bind_addr is not a valid IP address: {}",
                addr
            );
        }
        if let Some(addr) = &self.server.http_addr {
            anyhow::ensure!(
                addr.parse::<std::net::SocketAddr>().is_ok(),
                "server.http_addr is not a valid socket address: {}",
                addr
            );
        }
        Ok(())
    }
}

/// Control surface and process bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket the HTTP control surface listens on.
    pub socket_path: PathBuf,
    /// Listen on this TCP address instead of the Unix socket (e.g. "127.0.0.1:8787").
    pub http_addr: Option<String>,
    /// Exclusive lock held for the lifetime of the daemon.
    pub lock_file: PathBuf,
    /// Marker created after the first start since host boot. Its absence
    /// means autoboot VMs should be booted.
    pub autoboot_marker: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(vmadmd_protocol::DEFAULT_CONTROL_SOCKET),
            http_addr: None,
            lock_file: PathBuf::from("/var/run/vmadmd.lock"),
            autoboot_marker: PathBuf::from("/tmp/.autoboot_vmadmd"),
        }
    }
}

/// Remote display (VNC / SPICE) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Address display listeners bind to. When unset the admin IP is read
    /// from `sysinfo`.
    pub bind_addr: Option<String>,
    /// Path to the `sysinfo` binary used to discover the admin IP.
    pub sysinfo_binary: PathBuf,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            sysinfo_binary: PathBuf::from("/usr/bin/sysinfo"),
        }
    }
}

/// Zone tooling locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonesConfig {
    /// Helper emitting one JSON zone event per line.
    pub zoneevent_binary: PathBuf,
    pub vmadm_binary: PathBuf,
    pub zonecfg_binary: PathBuf,
    /// Root under which zonepaths live when a VM does not report one.
    pub zones_root: PathBuf,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            zoneevent_binary: PathBuf::from("/usr/vm/sbin/zoneevent"),
            vmadm_binary: PathBuf::from("/usr/sbin/vmadm"),
            zonecfg_binary: PathBuf::from("/usr/sbin/zonecfg"),
            zones_root: PathBuf::from("/zones"),
        }
    }
}

/// Event reconciler timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Interval of the seen-VM garbage collection sweep.
    pub sweep_interval_secs: u64,
    /// Interval of the trace-level state summary.
    pub summary_interval_secs: u64,
    /// Delay between a VM reaching running and its log rotation.
    pub log_rotate_delay_secs: u64,
    /// Script rotating a VM's logs; invoked as `<script> <uuid>`. Disabled when unset.
    pub log_rotate_script: Option<PathBuf>,
    /// Upper bound on a single provisioning wait.
    pub provision_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            summary_interval_secs: 60,
            log_rotate_delay_secs: 5,
            log_rotate_script: Some(PathBuf::from("/usr/vm/sbin/rotate-kvm-logs.sh")),
            provision_timeout_secs: 300,
        }
    }
}

impl ReconcilerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_secs(self.summary_interval_secs)
    }

    pub fn log_rotate_delay(&self) -> Duration {
        Duration::from_secs(self.log_rotate_delay_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }
}

/// Docker-compatible restart backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// First restart delay; doubles per consecutive restart.
    pub base_delay_ms: u64,
    /// A run longer than this resets the backoff to `base_delay_ms`.
    pub runtime_reset_threshold_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            runtime_reset_threshold_ms: 10_000,
        }
    }
}

/// Hypervisor control channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Timeout for a single hypervisor command.
    pub command_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 10,
        }
    }
}

impl HypervisorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

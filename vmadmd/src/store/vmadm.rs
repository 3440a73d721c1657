use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    LookupFilter, StartOptions, StopOptions, StoreError, VmRecord, VmState, VmStore, META_RESTART_COUNT,
    META_RESTART_DELAY,
};

/// Interval between state polls while waiting out provisioning.
const PROVISION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `VmStore` backed by the `vmadm` and `zonecfg` command-line tools.
#[derive(Debug, Clone)]
pub struct VmadmStore {
    vmadm: PathBuf,
    zonecfg: PathBuf,
    zones_root: Option<PathBuf>,
}

impl VmadmStore {
    pub fn new(vmadm: impl Into<PathBuf>, zonecfg: impl Into<PathBuf>) -> Self {
        Self {
            vmadm: vmadm.into(),
            zonecfg: zonecfg.into(),
            zones_root: None,
        }
    }

    /// Fill in `<root>/<uuid>` for VMs whose lookup output carries no zonepath.
    pub fn with_zones_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.zones_root = Some(root.into());
        self
    }

    async fn lookup_raw(&self, filters: &[String], fields: &[&str]) -> Result<Vec<VmRecord>> {
        let fields = fields.join(",");
        let mut args: Vec<&str> = vec!["lookup", "-j", "-o", &fields];
        args.extend(filters.iter().map(String::as_str));

        let stdout = run_tool(&self.vmadm, &args, None).await?;
        let mut vms: Vec<VmRecord> =
            serde_json::from_str(&stdout).context("failed to parse vmadm lookup output")?;
        if let Some(root) = &self.zones_root {
            for vm in vms.iter_mut().filter(|vm| vm.zonepath.is_none()) {
                vm.zonepath = Some(root.join(vm.uuid.to_string()));
            }
        }
        Ok(vms)
    }

    /// Run one zonecfg subcommand against a VM's zone.
    async fn zonecfg(&self, uuid: Uuid, subcommand: &str) -> Result<()> {
        let zone = uuid.to_string();
        run_tool(&self.zonecfg, &["-z", &zone, subcommand], None).await?;
        Ok(())
    }
}

#[async_trait]
impl VmStore for VmadmStore {
    #[instrument(skip(self, fields))]
    async fn load(&self, uuid: Uuid, fields: &[&str]) -> Result<VmRecord, StoreError> {
        let vms = self
            .lookup_raw(&[format!("uuid={}", uuid)], fields)
            .await
            .map_err(|e| store_error(uuid, e))?;
        vms.into_iter().next().ok_or(StoreError::NotFound(uuid))
    }

    #[instrument(skip(self, fields))]
    async fn lookup(&self, filter: &LookupFilter, fields: &[&str]) -> Result<Vec<VmRecord>, StoreError> {
        let mut filters = Vec::new();
        if let Some(brand) = &filter.brand {
            filters.push(format!("brand={}", brand));
        }
        Ok(self.lookup_raw(&filters, fields).await?)
    }

    #[instrument(skip(self))]
    async fn start(&self, uuid: Uuid, opts: &StartOptions) -> Result<(), StoreError> {
        if opts.increment_restart_count || opts.restart_delay_ms.is_some() {
            let mut metadata = serde_json::Map::new();
            if opts.increment_restart_count {
                let current = self.load(uuid, &["uuid", "internal_metadata"]).await?;
                metadata.insert(
                    META_RESTART_COUNT.to_string(),
                    json!(current.restart_count().saturating_add(1)),
                );
            }
            if let Some(delay) = opts.restart_delay_ms {
                metadata.insert(META_RESTART_DELAY.to_string(), json!(delay));
            }
            self.update(uuid, &json!({ "set_internal_metadata": metadata }))
                .await?;
        }

        let id = uuid.to_string();
        run_tool(&self.vmadm, &["start", &id], None)
            .await
            .map_err(|e| store_error(uuid, e))?;
        info!(vm = %uuid, "started VM");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, uuid: Uuid, opts: &StopOptions) -> Result<(), StoreError> {
        let id = uuid.to_string();
        let mut args = vec!["stop", id.as_str()];
        if opts.force {
            args.push("-F");
        }
        run_tool(&self.vmadm, &args, None)
            .await
            .map_err(|e| store_error(uuid, e))?;
        info!(vm = %uuid, force = opts.force, "stopped VM");
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn update(&self, uuid: Uuid, payload: &serde_json::Value) -> Result<(), StoreError> {
        let id = uuid.to_string();
        let body = serde_json::to_vec(payload).context("failed to serialize update payload")?;
        run_tool(&self.vmadm, &["update", &id], Some(&body))
            .await
            .map_err(|e| store_error(uuid, e))?;
        debug!(vm = %uuid, "updated VM");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, uuid: Uuid) -> Result<(), StoreError> {
        self.zonecfg(
            uuid,
            "add attr; set name=failed; set type=string; set value=provisioning; end",
        )
        .await
        .map_err(|e| store_error(uuid, e))?;
        info!(vm = %uuid, "marked VM failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wait_for_provisioning_done(&self, uuid: Uuid, timeout: Duration) -> Result<(), StoreError> {
        let poll = async {
            let mut interval = tokio::time::interval(PROVISION_POLL_INTERVAL);
            loop {
                interval.tick().await;
                let vm = self.load(uuid, &["uuid", "state"]).await?;
                if vm.state != VmState::Provisioning {
                    debug!(vm = %uuid, state = %vm.state, "VM left provisioning");
                    return Ok::<(), StoreError>(());
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| StoreError::Timeout(uuid))?
    }

    #[instrument(skip(self))]
    async fn unset_provisioning_transition(&self, uuid: Uuid) -> Result<(), StoreError> {
        self.zonecfg(uuid, "remove -F attr name=transition")
            .await
            .map_err(|e| store_error(uuid, e))?;
        debug!(vm = %uuid, "cleared provisioning transition");
        Ok(())
    }
}

/// Run a zone tool and return its stdout, feeding `stdin` when given.
pub(crate) async fn run_tool(program: &Path, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
    debug!(program = %program.display(), args = ?args, "running zone tool");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {}", program.display()))?;

    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().context("stdin not captured")?;
        pipe.write_all(input)
            .await
            .with_context(|| format!("failed to write to {}", program.display()))?;
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {}", program.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} failed: {}",
            program.display(),
            args.first().unwrap_or(&""),
            stderr.trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Classify a failed tool invocation by the message the tool printed.
fn store_error(uuid: Uuid, err: anyhow::Error) -> StoreError {
    let message = format!("{:#}", err);
    let lower = message.to_lowercase();
    if lower.contains("no such zone") || lower.contains("not found") {
        StoreError::NotFound(uuid)
    } else if lower.contains("not running") || lower.contains("invalid state") {
        StoreError::InvalidState { uuid, detail: message }
    } else if lower.contains("busy") || lower.contains("lock") {
        StoreError::Busy(uuid)
    } else {
        StoreError::Command(err)
    }
}

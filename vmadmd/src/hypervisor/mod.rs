//! Out-of-band hypervisor control.
//!
//! Each command opens its own connection to the VM's control socket, runs a
//! single command and disconnects. No connection is kept across commands.

pub mod qmp;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub use qmp::QmpControl;

/// Connects to a VM's hypervisor control socket.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    async fn connect(&self, socket_path: &Path) -> Result<Box<dyn HypervisorSession>>;
}

/// An open, negotiated control connection.
#[async_trait]
pub trait HypervisorSession: Send {
    /// Run one command and return its `return` payload.
    async fn command(&mut self, name: &str, arguments: Option<Value>) -> Result<Value>;

    async fn disconnect(self: Box<Self>) -> Result<()>;
}

/// Connect, run one command and disconnect.
pub async fn run_command(
    control: &dyn HypervisorControl,
    socket_path: &Path,
    name: &str,
    arguments: Option<Value>,
) -> Result<Value> {
    let mut session = control.connect(socket_path).await?;
    let result = session.command(name, arguments).await;
    if let Err(e) = session.disconnect().await {
        tracing::debug!(error = %e, socket = %socket_path.display(), "hypervisor disconnect failed");
    }
    result
}

/// Arguments for a `human-monitor-command` running `line`.
pub fn monitor_line(line: &str) -> Option<Value> {
    Some(json!({ "command-line": line }))
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::{HypervisorControl, HypervisorSession};

/// Default timeout for individual QMP commands. If QEMU does not respond
/// within this duration the command is considered failed.
pub const DEFAULT_QMP_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// `HypervisorControl` over the QEMU Machine Protocol.
#[derive(Debug, Clone)]
pub struct QmpControl {
    command_timeout: Duration,
}

impl QmpControl {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

impl Default for QmpControl {
    fn default() -> Self {
        Self::new(DEFAULT_QMP_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl HypervisorControl for QmpControl {
    async fn connect(&self, socket_path: &Path) -> Result<Box<dyn HypervisorSession>> {
        let session = QmpSession::connect(socket_path, self.command_timeout).await?;
        Ok(Box::new(session))
    }
}

/// One negotiated QMP connection.
///
/// QMP is a JSON-based protocol over a Unix domain socket. The client must
/// first negotiate capabilities before sending commands.
pub struct QmpSession {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    socket_path: PathBuf,
    command_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<serde_json::Value>,
}

/// The greeting QEMU sends on connection.
#[derive(Debug, Deserialize)]
struct QmpGreeting {
    #[serde(rename = "QMP")]
    qmp: QmpGreetingInfo,
}

#[derive(Debug, Deserialize)]
struct QmpGreetingInfo {
    version: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QmpResponse {
    Return {
        #[serde(rename = "return")]
        ret: serde_json::Value,
    },
    Error {
        error: QmpError,
    },
    Event {
        event: String,
    },
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

impl QmpSession {
    /// Connect, read the greeting and enter command mode.
    pub async fn connect(socket_path: &Path, command_timeout: Duration) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to QMP socket: {}", socket_path.display()))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            socket_path: socket_path.to_path_buf(),
            command_timeout,
        };

        let greeting_line = tokio::time::timeout(command_timeout, session.read_line())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for QMP greeting"))??;
        let greeting: QmpGreeting = serde_json::from_str(&greeting_line)
            .with_context(|| format!("failed to parse QMP greeting: {}", greeting_line))?;
        debug!(socket = %socket_path.display(), version = %greeting.qmp.version, "QMP greeting received");

        session
            .execute("qmp_capabilities", None)
            .await
            .context("QMP capability negotiation failed")?;

        Ok(session)
    }

    /// Send a command and read its response, bounded by the command timeout.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let timeout = self.command_timeout;
        tokio::time::timeout(timeout, self.execute_inner(command, arguments))
            .await
            .map_err(|_| anyhow::anyhow!("QMP command '{}' timed out after {:?}", command, timeout))?
    }

    async fn execute_inner(
        &mut self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut json = serde_json::to_string(&QmpCommand { execute: command, arguments })
            .context("failed to serialize QMP command")?;
        json.push('\n');

        trace!(command, json = %json.trim(), "sending QMP command");

        self.writer
            .write_all(json.as_bytes())
            .await
            .context("failed to write to QMP socket")?;
        self.writer.flush().await.context("failed to flush QMP socket")?;

        // Async events may arrive ahead of the response
        loop {
            let line = self.read_line().await?;
            let response: QmpResponse = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse QMP response: {}", line))?;

            match response {
                QmpResponse::Return { ret } => {
                    debug!(command, "QMP command succeeded");
                    return Ok(ret);
                }
                QmpResponse::Error { error } => {
                    bail!("QMP command '{}' failed: {} ({})", command, error.desc, error.class);
                }
                QmpResponse::Event { event } => {
                    trace!(event, "QMP async event received (skipping)");
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .context("failed to read from QMP socket")?;

        if bytes_read == 0 {
            bail!("QMP socket closed unexpectedly: {}", self.socket_path.display());
        }

        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl HypervisorSession for QmpSession {
    async fn command(&mut self, name: &str, arguments: Option<serde_json::Value>) -> Result<serde_json::Value> {
        self.execute(name, arguments).await
    }

    async fn disconnect(mut self: Box<Self>) -> Result<()> {
        self.writer.shutdown().await.context("failed to close QMP socket")?;
        Ok(())
    }
}

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vmadmd_protocol::RawZoneEvent;

/// Capacity of the channel between the event source and the reconciler.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Consecutive helper failures tolerated before the stream is abandoned.
const MAX_FAILURES: u32 = 10;

/// Delay before restarting a helper that exited.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A helper that ran at least this long resets the failure count.
const HEALTHY_RESET: Duration = Duration::from_secs(30);

/// Source of raw zone transition events.
///
/// The reconciler subscribes exactly once at startup. A subscription failure
/// is fatal; after that the source is expected to recover on its own.
#[async_trait]
pub trait ZoneEventSource: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<RawZoneEvent>>;
}

/// Event source backed by the `zoneevent` helper, which prints one JSON
/// object per line for every zone state change on the host.
#[derive(Debug, Clone)]
pub struct ZoneeventCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl ZoneeventCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["vmadmd".to_string()],
        }
    }

    /// Replace the helper's arguments.
    #[allow(dead_code)] // used by tests to drive a shell in place of the helper
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn spawn(&self) -> Result<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        info!(pid = child.id().unwrap_or(0), program = %self.program.display(), "zoneevent running");
        Ok(child)
    }

    /// Keep a helper running, restarting it after it exits, until the
    /// subscriber goes away or the failure budget is exhausted.
    async fn supervise(self, first: Child, tx: mpsc::Sender<RawZoneEvent>) {
        let mut next = Some(first);
        let mut failures = 0u32;

        loop {
            let started = Instant::now();
            let outcome = match next.take() {
                Some(child) => pump_lines(child, &tx).await,
                None => match self.spawn() {
                    Ok(child) => pump_lines(child, &tx).await,
                    Err(e) => Err(e),
                },
            };

            if tx.is_closed() {
                debug!("zone event subscriber gone, stopping zoneevent supervisor");
                return;
            }

            match outcome {
                Ok(()) => warn!("zoneevent helper exited"),
                Err(e) => warn!(error = %e, "zoneevent helper failed"),
            }

            if started.elapsed() >= HEALTHY_RESET {
                failures = 0;
            }
            failures += 1;
            if failures >= MAX_FAILURES {
                error!(failures, "zoneevent failed too many times, giving up on zone events");
                return;
            }

            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
}

#[async_trait]
impl ZoneEventSource for ZoneeventCommand {
    async fn subscribe(&self) -> Result<mpsc::Receiver<RawZoneEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let child = self.spawn()?;
        tokio::spawn(self.clone().supervise(child, tx));
        Ok(rx)
    }
}

/// Forward every parseable stdout line of `child` to `tx` until EOF.
async fn pump_lines(mut child: Child, tx: &mpsc::Sender<RawZoneEvent>) -> Result<()> {
    let stdout = child.stdout.take().context("zoneevent stdout not captured")?;
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await.context("reading zoneevent output")? {
        let Some(event) = parse_event_line(&line) else {
            continue;
        };
        if tx.send(event).await.is_err() {
            return Ok(());
        }
    }

    let status = child.wait().await.context("waiting for zoneevent")?;
    debug!(status = %status, "zoneevent exited");
    Ok(())
}

/// Parse one helper output line. Blank and malformed lines yield `None`.
pub fn parse_event_line(line: &str) -> Option<RawZoneEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<RawZoneEvent>(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(line, error = %e, "skipping unparseable zoneevent line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_line() {
        let ev = parse_event_line(
            r#"{"zonename":"z","oldstate":"ready","newstate":"running","when":"12"}"#,
        )
        .unwrap();
        assert_eq!(ev.newstate.as_deref(), Some("running"));
    }

    #[test]
    fn test_parse_event_line_skips_garbage() {
        assert!(parse_event_line("").is_none());
        assert!(parse_event_line("   ").is_none());
        assert!(parse_event_line("not json").is_none());
        assert!(parse_event_line("[1,2,3]").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_streams_helper_output() {
        let source = ZoneeventCommand::new("/bin/sh").with_args([
            "-c",
            r#"printf '%s\n' '{"zonename":"a","oldstate":"ready","newstate":"running","when":"1"}' 'garbage' '{"zonename":"b","oldstate":"running","newstate":"down","when":"2"}'; sleep 5"#,
        ]);
        let mut rx = source.subscribe().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.zonename.as_deref(), Some("a"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.zonename.as_deref(), Some("b"));
        assert_eq!(second.newstate.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_subscribe_fails_for_missing_helper() {
        let source = ZoneeventCommand::new("/nonexistent/zoneevent");
        let err = source.subscribe().await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}

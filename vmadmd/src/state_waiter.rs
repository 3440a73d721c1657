use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;
use vmadmd_protocol::WaitState;

/// Buffered notifications per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// A VM reached a reportable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub uuid: Uuid,
    pub state: WaitState,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for VM {1} to become {2}")]
    Timeout(Duration, Uuid, WaitState),

    #[error("state notifications closed")]
    Closed,
}

/// Fan-out of VM state changes to callers blocked on a target state.
#[derive(Clone)]
pub struct StateWaiter {
    tx: broadcast::Sender<StateChange>,
}

impl Default for StateWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWaiter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, uuid: Uuid, state: WaitState) {
        // No receivers is the common case
        let _ = self.tx.send(StateChange { uuid, state });
    }

    /// Subscribe before triggering the transition to avoid missing it.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    /// Wait until `uuid` reaches `target`, or `timeout` elapses. The
    /// subscription is taken when this is called, not when the returned
    /// future is first polled, so a caller can check the current state in
    /// between without missing a transition.
    pub fn wait_for(
        &self,
        uuid: Uuid,
        target: WaitState,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), WaitError>> + Send + 'static {
        let rx = self.subscribe();
        Self::wait_on(rx, uuid, target, timeout)
    }

    async fn wait_on(
        mut rx: broadcast::Receiver<StateChange>,
        uuid: Uuid,
        target: WaitState,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let matching = async {
            loop {
                match rx.recv().await {
                    Ok(change) if change.uuid == uuid && change.state == target => return Ok(()),
                    Ok(_) => {}
                    // Missed notifications may include ours; keep listening
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(vm = %uuid, skipped = n, "state waiter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(WaitError::Closed),
                }
            }
        };

        tokio::select! {
            result = matching => result,
            _ = tokio::time::sleep(timeout) => Err(WaitError::Timeout(timeout, uuid, target)),
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

//! Docker-compatible restart policies.
//!
//! A VM carrying `docker:restartpolicy` is restarted after it stops, with an
//! exponential backoff persisted in its internal metadata. At most one
//! restart is pending per VM.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RestartConfig;
use crate::metrics::MetricsRegistry;
use crate::store::{StartOptions, VmRecord, VmStore, RESTART_FIELDS};
use crate::timers::TimerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    /// Restart after a non-zero exit. `max_restarts == 0` means unlimited.
    OnFailure { max_restarts: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid restart policy \"{0}\"")]
    Invalid(String),

    #[error("invalid on-failure restart count in \"{0}\"")]
    BadMaxRestarts(String),
}

impl FromStr for RestartPolicy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "always" => Ok(Self::Always),
            None if s == "on-failure" => Ok(Self::OnFailure { max_restarts: 0 }),
            Some(("on-failure", max)) => max
                .parse()
                .map(|max_restarts| Self::OnFailure { max_restarts })
                .map_err(|_| PolicyError::BadMaxRestarts(s.to_string())),
            _ => Err(PolicyError::Invalid(s.to_string())),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("always"),
            Self::OnFailure { max_restarts: 0 } => f.write_str("on-failure"),
            Self::OnFailure { max_restarts } => write!(f, "on-failure:{}", max_restarts),
        }
    }
}

/// Outcome of the policy gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Restart,
    /// `on-failure` and the VM exited cleanly.
    CleanExit,
    /// `on-failure:N` and N restarts already happened.
    Exhausted,
}

pub fn decide(policy: &str, exit_status: Option<i32>, restart_count: u32) -> Result<Decision, PolicyError> {
    match policy.parse::<RestartPolicy>()? {
        RestartPolicy::Always => Ok(Decision::Restart),
        RestartPolicy::OnFailure { max_restarts } => {
            if exit_status.unwrap_or(0) == 0 {
                Ok(Decision::CleanExit)
            } else if max_restarts > 0 && restart_count >= max_restarts {
                Ok(Decision::Exhausted)
            } else {
                Ok(Decision::Restart)
            }
        }
    }
}

/// Delay before the next restart, in milliseconds.
pub fn compute_delay(
    config: &RestartConfig,
    restart_count: u32,
    stored_delay_ms: Option<u64>,
    last_runtime: Option<Duration>,
) -> u64 {
    let ran_long = last_runtime
        .map(|r| r.as_millis() > u128::from(config.runtime_reset_threshold_ms))
        .unwrap_or(false);
    if ran_long {
        return config.base_delay_ms;
    }
    if let Some(delay) = stored_delay_ms {
        return delay;
    }
    let factor = 1u64.checked_shl(restart_count).unwrap_or(u64::MAX);
    config.base_delay_ms.saturating_mul(factor)
}

/// Schedules restarts for VMs with a restart policy.
pub struct RestartEngine {
    store: Arc<dyn VmStore>,
    config: RestartConfig,
    pending: TimerRegistry<Uuid>,
    metrics: MetricsRegistry,
}

impl RestartEngine {
    pub fn new(store: Arc<dyn VmStore>, config: RestartConfig, metrics: MetricsRegistry) -> Self {
        Self {
            store,
            config,
            pending: TimerRegistry::new(),
            metrics,
        }
    }

    /// Schedule a restart of `vm` if its policy asks for one. Returns the
    /// scheduled delay. A VM with a pending restart is left alone.
    pub fn apply(&self, vm: &VmRecord, last_runtime: Option<Duration>) -> Option<u64> {
        let uuid = vm.uuid;
        let policy = vm.restart_policy()?;

        if self.pending.is_armed(&uuid) {
            debug!(vm = %uuid, "restart already pending");
            return None;
        }

        let restart_count = vm.restart_count();
        match decide(policy, vm.exit_status, restart_count) {
            Err(e) => {
                error!(vm = %uuid, error = %e, "not restarting VM");
                return None;
            }
            Ok(Decision::CleanExit) => {
                info!(vm = %uuid, policy, "VM exited cleanly, not restarting");
                return None;
            }
            Ok(Decision::Exhausted) => {
                warn!(vm = %uuid, policy, restart_count, "restart limit reached, not restarting");
                return None;
            }
            Ok(Decision::Restart) => {}
        }

        let delay = compute_delay(&self.config, restart_count, vm.restart_delay_ms(), last_runtime);
        let store = Arc::clone(&self.store);
        self.pending
            .arm_if_absent(uuid, Duration::from_millis(delay), restart_vm(store, uuid, delay))?;

        self.metrics.record_restart_scheduled();
        info!(vm = %uuid, policy, restart_count, delay_ms = delay, "restart scheduled");
        Some(delay)
    }

    /// Drop the pending restart of a VM, if any.
    pub fn cancel(&self, uuid: Uuid) -> bool {
        self.pending.cancel(&uuid)
    }

    #[cfg(test)]
    pub fn is_pending(&self, uuid: Uuid) -> bool {
        self.pending.is_armed(&uuid)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cancel_all(&self) {
        self.pending.cancel_all();
    }
}

/// Fired by the restart timer, after the pending entry has been cleared.
async fn restart_vm(store: Arc<dyn VmStore>, uuid: Uuid, delay: u64) {
    let vm = match store.load(uuid, RESTART_FIELDS).await {
        Ok(vm) => vm,
        Err(e) => {
            warn!(vm = %uuid, error = %e, "failed to reload VM for restart");
            return;
        }
    };
    if !vm.state.is_stopped() || !vm.autoboot {
        info!(vm = %uuid, state = %vm.state, autoboot = vm.autoboot, "VM no longer eligible, abandoning restart");
        return;
    }

    let opts = StartOptions {
        increment_restart_count: true,
        restart_delay_ms: Some(delay.saturating_mul(2)),
    };
    match store.start(uuid, &opts).await {
        Ok(()) => info!(vm = %uuid, next_delay_ms = delay.saturating_mul(2), "VM restarted"),
        Err(e) => error!(vm = %uuid, error = %e, "failed to restart VM"),
    }
}

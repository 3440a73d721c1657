//! Zone state vocabulary and validated zone transition events.
//!
//! The OS reports zone transitions with its own state names. `ZoneState`
//! captures that vocabulary; `ZoneTransitionEvent` is a fully validated event
//! keyed by VM identity.

pub mod events;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;
use vmadmd_protocol::{RawZoneEvent, WaitState};

/// Zone lifecycle states as reported by zone transition events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ZoneState {
    /// The empty state a zone has before it is configured.
    Empty,
    Configured,
    Incomplete,
    Installed,
    Ready,
    Running,
    ShuttingDown,
    Down,
    Mounted,
    /// Reported when a zone returns to installed after running.
    Uninitialized,
    Other(String),
}

impl ZoneState {
    pub fn parse(s: &str) -> Self {
        match s {
            "" => Self::Empty,
            "configured" => Self::Configured,
            "incomplete" => Self::Incomplete,
            "installed" => Self::Installed,
            "ready" => Self::Ready,
            "running" => Self::Running,
            "shutting_down" => Self::ShuttingDown,
            "down" => Self::Down,
            "mounted" => Self::Mounted,
            "uninitialized" => Self::Uninitialized,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::Configured => "configured",
            Self::Incomplete => "incomplete",
            Self::Installed => "installed",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Down => "down",
            Self::Mounted => "mounted",
            Self::Uninitialized => "uninitialized",
            Self::Other(s) => s,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// The state a zone lands in once its VM has stopped.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Uninitialized)
    }
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a raw zone event was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("zone event is missing field '{0}'")]
    MissingField(&'static str),

    #[error("zone name '{0}' is not a VM uuid")]
    NotAVm(String),

    #[error("zone event has invalid timestamp '{0}'")]
    BadTimestamp(String),
}

/// A validated zone state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneTransitionEvent {
    pub identity: Uuid,
    pub old_state: ZoneState,
    pub new_state: ZoneState,
    /// Nanoseconds since the epoch.
    pub timestamp: u64,
}

impl ZoneTransitionEvent {
    pub fn new(identity: Uuid, old_state: ZoneState, new_state: ZoneState) -> Self {
        Self {
            identity,
            old_state,
            new_state,
            timestamp: 0,
        }
    }

    /// Validate a raw event. VM zones are always named after their uuid, so a
    /// zone name that is not a uuid does not belong to a VM.
    pub fn from_raw(raw: &RawZoneEvent) -> Result<Self, EventError> {
        let zonename = raw.zonename.as_deref().ok_or(EventError::MissingField("zonename"))?;
        let old = raw.oldstate.as_deref().ok_or(EventError::MissingField("oldstate"))?;
        let new = raw.newstate.as_deref().ok_or(EventError::MissingField("newstate"))?;
        let when = raw.when.as_deref().ok_or(EventError::MissingField("when"))?;

        let identity =
            Uuid::parse_str(zonename).map_err(|_| EventError::NotAVm(zonename.to_string()))?;
        let timestamp = when
            .parse::<u64>()
            .map_err(|_| EventError::BadTimestamp(when.to_string()))?;

        Ok(Self {
            identity,
            old_state: ZoneState::parse(old),
            new_state: ZoneState::parse(new),
            timestamp,
        })
    }

    /// Transitions a zone goes through while being created. They precede the
    /// VM being loadable.
    pub fn is_pre_install(&self) -> bool {
        matches!(
            (&self.old_state, &self.new_state),
            (ZoneState::Empty, ZoneState::Configured)
                | (ZoneState::Configured, ZoneState::Incomplete)
                | (ZoneState::Incomplete, ZoneState::Installed)
        )
    }

    /// The state to publish to state waiters, if this transition is one.
    pub fn reported_state(&self) -> Option<WaitState> {
        if self.new_state.is_running() {
            Some(WaitState::Running)
        } else if self.new_state.is_stopped() {
            Some(WaitState::Stopped)
        } else {
            None
        }
    }

    pub fn touches_running(&self) -> bool {
        self.old_state.is_running() || self.new_state.is_running()
    }
}

impl fmt::Display for ZoneTransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' -> '{}' at {}",
            self.identity, self.old_state, self.new_state, self.timestamp
        )
    }
}

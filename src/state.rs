//! Loop state machine.
//!
//! Pure transition logic for one project's loop lifecycle. The registry and
//! supervisor never assign states directly; they ask [`LoopState::transition`]
//! whether a trigger is legal from the current state and get back the next
//! state or an `InvalidTransition` error. Unlisted transitions are rejected,
//! never silently applied.

use serde::{Deserialize, Serialize};

use crate::error::{HerdError, Result};

/// State machine for a project's loop lifecycle.
///
/// `Idle` is the initial state and, together with `Error`, the only states a
/// new start may be issued from.
///
/// # Example
///
/// ```
/// use loopherd::state::{LoopState, Trigger};
///
/// let next = LoopState::Idle.transition(Trigger::StartAdmitted).unwrap();
/// assert_eq!(next, LoopState::Starting);
///
/// // pause from IDLE is a conflict, not a panic
/// assert!(LoopState::Idle.transition(Trigger::Pause).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No loop activity; startable.
    Idle,
    /// Subprocess spawn in flight, liveness not yet confirmed.
    Starting,
    /// Subprocess confirmed alive and working.
    Running,
    /// Pause flag written; waiting for the subprocess to reach a phase
    /// boundary and acknowledge.
    PauseRequested,
    /// Subprocess acknowledged the pause at a phase boundary.
    Paused,
    /// Waiting for a concurrency slot; startable only by admission.
    Queued,
    /// Spawn failure or watchdog-detected crash; startable.
    Error,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::PauseRequested => "pause_requested",
            LoopState::Paused => "paused",
            LoopState::Queued => "queued",
            LoopState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Trigger driving a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Start request granted a concurrency slot.
    StartAdmitted,
    /// Start request deferred; no slot available.
    StartQueued,
    /// Supervisor confirmed the subprocess is alive.
    SpawnConfirmed,
    /// Subprocess failed to start or exited non-zero immediately.
    SpawnFailed,
    /// Pause requested; flag written.
    Pause,
    /// Phase-boundary event received while a pause was pending.
    PhaseBoundary,
    /// Resume requested; flag removed.
    Resume,
    /// Stop requested (or clean exit observed).
    Stop,
    /// Watchdog found the subprocess dead.
    Crash,
    /// Queue head granted a freed slot.
    Admit,
}

impl Trigger {
    /// User-facing name of the action, used in conflict errors.
    pub fn action_name(&self) -> &'static str {
        match self {
            Trigger::StartAdmitted | Trigger::StartQueued => "start",
            Trigger::SpawnConfirmed => "confirm spawn",
            Trigger::SpawnFailed => "fail spawn",
            Trigger::Pause => "pause",
            Trigger::PhaseBoundary => "acknowledge pause",
            Trigger::Resume => "resume",
            Trigger::Stop => "stop",
            Trigger::Crash => "record crash",
            Trigger::Admit => "admit",
        }
    }
}

impl LoopState {
    /// Validate a trigger against the transition table and return the next
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`HerdError::InvalidTransition`] for any pairing not listed in
    /// the table. Notably, `start` while `Running` or `Starting` is a
    /// conflict so a second spawn can never happen.
    pub fn transition(self, trigger: Trigger) -> Result<LoopState> {
        use LoopState::*;
        use Trigger::*;

        let next = match (self, trigger) {
            (Idle | Error, StartAdmitted) => Starting,
            (Idle | Error, StartQueued) => Queued,
            (Starting, SpawnConfirmed) => Running,
            (Starting, SpawnFailed) => Error,
            (Running, Pause) => PauseRequested,
            (PauseRequested, PhaseBoundary) => Paused,
            (Paused, Resume) => Running,
            (Running | PauseRequested | Paused | Starting | Queued, Stop) => Idle,
            (Running | PauseRequested | Paused, Crash) => Error,
            (Queued, Admit) => Starting,
            (state, trigger) => {
                return Err(HerdError::invalid_transition(state, trigger.action_name()))
            }
        };
        Ok(next)
    }

    /// Whether this state occupies a concurrency slot.
    ///
    /// Queued, idle, and errored projects do not count against
    /// `max_concurrent_loops`.
    pub fn occupies_slot(&self) -> bool {
        matches!(
            self,
            LoopState::Starting | LoopState::Running | LoopState::PauseRequested | LoopState::Paused
        )
    }

    /// Whether the project may be unregistered in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Idle | LoopState::Error)
    }

    /// Whether a live subprocess may exist in this state.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            LoopState::Starting | LoopState::Running | LoopState::PauseRequested | LoopState::Paused
        )
    }
}

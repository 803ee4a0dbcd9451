//! Custom error types for loopherd.
//!
//! Most variants here are not exceptional at all: control requests racing
//! each other produce `InvalidTransition`, a full admission queue produces
//! `QueueFull`, and so on. Callers are expected to match on these and report
//! them inline rather than treat them as failures of the registry itself.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::LoopState;

/// Main error type for registry, supervisor, and queue operations.
#[derive(Error, Debug)]
pub enum HerdError {
    // =========================================================================
    // Registration errors
    // =========================================================================
    /// Path does not exist or is not a directory.
    #[error("Invalid project path: {path}")]
    InvalidPath { path: PathBuf },

    /// The canonical path is already registered.
    #[error("Project already registered at {path} (id {id})")]
    AlreadyRegistered { path: PathBuf, id: String },

    /// No project with the given id.
    #[error("Project not found: {id}")]
    ProjectNotFound { id: String },

    /// Unregister attempted while the loop is active.
    #[error("Project '{name}' is busy: loop is {state}")]
    ProjectBusy { name: String, state: LoopState },

    // =========================================================================
    // Control errors
    // =========================================================================
    /// A control operation is not valid for the current state.
    #[error("Invalid transition: cannot {action} while {state}")]
    InvalidTransition { state: LoopState, action: String },

    /// Admission queue is at capacity.
    #[error("Start queue is full (max {max})")]
    QueueFull { max: usize },

    // =========================================================================
    // Supervisor errors
    // =========================================================================
    /// The loop subprocess failed to start.
    #[error("Failed to spawn loop subprocess: {message}")]
    Spawn { message: String },

    /// The watchdog found the loop subprocess dead.
    #[error("Loop subprocess died unexpectedly (exit code {exit_code})")]
    WatchdogCrash { exit_code: i32 },

    /// Reconciliation found a registered path that no longer exists.
    #[error("Project path no longer exists: {path}")]
    PathStale { path: PathBuf },

    // =========================================================================
    // Wrapped errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HerdError {
    /// Create an invalid-path error.
    pub fn invalid_path(path: impl Into<PathBuf>) -> Self {
        Self::InvalidPath { path: path.into() }
    }

    /// Create a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::ProjectNotFound { id: id.into() }
    }

    /// Create an invalid-transition error for a control action.
    pub fn invalid_transition(state: LoopState, action: impl Into<String>) -> Self {
        Self::InvalidTransition {
            state,
            action: action.into(),
        }
    }

    /// Create a spawn error.
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Check if this error is a routine concurrency/ordering conflict.
    ///
    /// Conflicts are expected outcomes of concurrent control requests and
    /// should be reported to the caller, not logged as registry failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::ProjectBusy { .. } | Self::QueueFull { .. }
        )
    }

    /// Check if this error leaves the project in the ERROR state.
    pub fn is_terminal_for_loop(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::WatchdogCrash { .. })
    }

    /// Short machine-readable code, used in broadcast `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath { .. } => "invalid_path",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::ProjectNotFound { .. } => "not_found",
            Self::ProjectBusy { .. } => "project_busy",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::QueueFull { .. } => "queue_full",
            Self::Spawn { .. } => "spawn_failed",
            Self::WatchdogCrash { .. } => "subprocess_crash",
            Self::PathStale { .. } => "path_stale",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "internal",
        }
    }
}

/// Type alias for loopherd results.
pub type Result<T> = std::result::Result<T, HerdError>;

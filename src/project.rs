//! Per-project runtime state.
//!
//! [`ProjectContext`] is the one mutable record for a registered project:
//! identity, loop state, the live process handle, the raw-output ring
//! buffer, and the execution position reported by the subprocess. All
//! state changes go through [`ProjectContext::apply`], which delegates to
//! the pure transition table in [`crate::state`] — a context can never hold
//! a state the machine would reject.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{HerdError, Result};
use crate::events::EpicId;
use crate::state::{LoopState, Trigger};
use crate::supervisor::ProcessHandle;

/// Completion status of the most recent loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunOutcome {
    #[default]
    Idle,
    Success,
    Failed,
}

/// Runtime record for one registered project.
pub struct ProjectContext {
    /// Stable id, generated once at registration. Never derived from the
    /// path; paths get renamed and symlinked, ids do not.
    pub id: Uuid,
    /// Absolute canonicalized project root.
    pub root_path: PathBuf,
    /// User-facing label, defaults to the path basename.
    pub display_name: String,
    /// Current loop state.
    state: LoopState,
    /// Live subprocess handle; owned by the supervisor while alive.
    pub process: Option<Box<dyn ProcessHandle>>,
    /// Ring buffer of raw output lines, drop-oldest.
    log_buffer: VecDeque<String>,
    log_capacity: usize,
    /// When the current phase started.
    pub phase_start_time: Option<DateTime<Utc>>,
    /// Dense 1-based rank, set only while queued.
    pub queue_position: Option<usize>,
    /// Last successful health-check or activity timestamp.
    pub last_seen: DateTime<Utc>,
    /// Outcome of the previous run.
    pub last_status: RunOutcome,
    pub current_epic: Option<EpicId>,
    pub current_story: Option<String>,
    pub current_phase: Option<String>,
    /// Failure reason while in the ERROR state.
    pub error_message: Option<String>,
    /// Set by reconciliation when the root path has vanished.
    pub path_stale: bool,
}

impl std::fmt::Debug for ProjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectContext")
            .field("id", &self.id)
            .field("root_path", &self.root_path)
            .field("display_name", &self.display_name)
            .field("state", &self.state)
            .field("process", &self.process.as_ref().map(|_| ".."))
            .field("log_buffer", &self.log_buffer)
            .field("log_capacity", &self.log_capacity)
            .field("phase_start_time", &self.phase_start_time)
            .field("queue_position", &self.queue_position)
            .field("last_seen", &self.last_seen)
            .field("last_status", &self.last_status)
            .field("current_epic", &self.current_epic)
            .field("current_story", &self.current_story)
            .field("current_phase", &self.current_phase)
            .field("error_message", &self.error_message)
            .field("path_stale", &self.path_stale)
            .finish()
    }
}

impl ProjectContext {
    /// Create a context for a freshly registered project.
    ///
    /// Canonicalizes the path and validates it is an existing directory.
    ///
    /// # Errors
    ///
    /// Returns [`HerdError::InvalidPath`] when the path does not exist or is
    /// not a directory.
    pub fn create(
        root_path: &Path,
        display_name: Option<String>,
        log_capacity: usize,
    ) -> Result<Self> {
        let canonical = root_path
            .canonicalize()
            .map_err(|_| HerdError::invalid_path(root_path))?;
        if !canonical.is_dir() {
            return Err(HerdError::invalid_path(canonical));
        }

        let name = display_name.unwrap_or_else(|| {
            canonical
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| canonical.display().to_string())
        });

        Ok(Self::restore(
            Uuid::new_v4(),
            canonical,
            name,
            RunOutcome::Idle,
            log_capacity,
        ))
    }

    /// Rebuild a context from persisted registration data.
    ///
    /// Unlike [`Self::create`] this never fails: a vanished path is caught
    /// by reconciliation, not by load.
    pub fn restore(
        id: Uuid,
        root_path: PathBuf,
        display_name: String,
        last_status: RunOutcome,
        log_capacity: usize,
    ) -> Self {
        Self {
            id,
            root_path,
            display_name,
            state: LoopState::Idle,
            process: None,
            log_buffer: VecDeque::with_capacity(log_capacity),
            log_capacity,
            phase_start_time: None,
            queue_position: None,
            last_seen: Utc::now(),
            last_status: RunOutcome::Idle,
            current_epic: None,
            current_story: None,
            current_phase: None,
            error_message: None,
            path_stale: false,
        }
        .with_last_status(last_status)
    }

    fn with_last_status(mut self, last_status: RunOutcome) -> Self {
        self.last_status = last_status;
        self
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Drive the state machine with a trigger and perform the per-state
    /// housekeeping (clearing handles, positions, error messages).
    ///
    /// # Errors
    ///
    /// Propagates `InvalidTransition` from the transition table; the context
    /// is left untouched in that case.
    pub fn apply(&mut self, trigger: Trigger) -> Result<LoopState> {
        let next = self.state.transition(trigger)?;
        self.state = next;
        self.last_seen = Utc::now();

        match next {
            LoopState::Idle => {
                self.process = None;
                self.phase_start_time = None;
                self.current_epic = None;
                self.current_story = None;
                self.current_phase = None;
                self.error_message = None;
                self.queue_position = None;
            }
            LoopState::Error => {
                self.process = None;
                self.queue_position = None;
                self.last_status = RunOutcome::Failed;
            }
            LoopState::Running => {
                self.error_message = None;
                self.queue_position = None;
                if self.phase_start_time.is_none() {
                    self.phase_start_time = Some(Utc::now());
                }
            }
            LoopState::Starting | LoopState::PauseRequested | LoopState::Paused => {}
            LoopState::Queued => {
                self.process = None;
            }
        }

        info!(
            project = %self.display_name,
            id = %short_id(&self.id),
            state = %next,
            "state transition"
        );
        Ok(next)
    }

    /// Record a loop failure: transition via `trigger` (SpawnFailed or
    /// Crash) and store the reason.
    pub fn fail(&mut self, trigger: Trigger, message: impl Into<String>) -> Result<()> {
        self.apply(trigger)?;
        let message = message.into();
        error!(project = %self.display_name, %message, "loop failed");
        self.error_message = Some(message);
        Ok(())
    }

    /// Record a clean stop or completion and the run outcome.
    pub fn finish(&mut self, success: bool) -> Result<()> {
        self.apply(Trigger::Stop)?;
        self.last_status = if success {
            RunOutcome::Success
        } else {
            RunOutcome::Failed
        };
        Ok(())
    }

    /// Force the project into ERROR because its root path has vanished.
    ///
    /// Reconciliation bypasses the transition table here: there is no valid
    /// trigger from IDLE to ERROR, but a project whose directory is gone
    /// cannot be started either way.
    pub fn mark_stale(&mut self) {
        let message = HerdError::PathStale {
            path: self.root_path.clone(),
        }
        .to_string();
        error!(project = %self.display_name, %message, "project path vanished");
        self.path_stale = true;
        self.state = LoopState::Error;
        self.process = None;
        self.queue_position = None;
        self.last_status = RunOutcome::Failed;
        self.error_message = Some(message);
        self.last_seen = Utc::now();
    }

    /// Append a raw output line, dropping the oldest when full.
    ///
    /// Inserting into a full buffer never errors.
    pub fn add_log(&mut self, line: impl Into<String>) {
        if self.log_capacity == 0 {
            return;
        }
        if self.log_buffer.len() >= self.log_capacity {
            self.log_buffer.pop_front();
        }
        self.log_buffer.push_back(line.into());
        self.last_seen = Utc::now();
    }

    /// Snapshot of the buffered log lines, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.log_buffer.iter().cloned().collect()
    }

    /// Number of buffered log lines.
    pub fn log_len(&self) -> usize {
        self.log_buffer.len()
    }

    /// Update the live execution position reported by the subprocess.
    ///
    /// A new phase restarts the phase clock.
    pub fn update_position(
        &mut self,
        epic: Option<EpicId>,
        story: Option<String>,
        phase: Option<String>,
    ) {
        if let Some(epic) = epic {
            self.current_epic = Some(epic);
        }
        if let Some(story) = story {
            self.current_story = Some(story);
        }
        if let Some(phase) = phase {
            self.current_phase = Some(phase);
            self.phase_start_time = Some(Utc::now());
        }
        self.last_seen = Utc::now();
    }

    /// Seconds spent in the current phase, if any.
    pub fn phase_duration_seconds(&self) -> Option<f64> {
        self.phase_start_time
            .map(|start| (Utc::now() - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Build the read-only snapshot served by `status` and `list_all`.
    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id,
            path: self.root_path.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            last_seen: self.last_seen,
            last_status: self.last_status,
            current_epic: self.current_epic.clone(),
            current_story: self.current_story.clone(),
            current_phase: self.current_phase.clone(),
            phase_duration_seconds: self.phase_duration_seconds(),
            error_message: self.error_message.clone(),
            queue_position: self.queue_position,
            path_stale: self.path_stale,
        }
    }
}

/// Read-only snapshot of one project, safe to serve while the context is
/// busy with a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: Uuid,
    pub path: PathBuf,
    pub display_name: String,
    pub state: LoopState,
    pub last_seen: DateTime<Utc>,
    pub last_status: RunOutcome,
    pub current_epic: Option<EpicId>,
    pub current_story: Option<String>,
    pub current_phase: Option<String>,
    pub phase_duration_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub queue_position: Option<usize>,
    pub path_stale: bool,
}

/// First hex group of a UUID, for compact log lines.
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Shared handle to one project: the context behind an async mutex, plus a
/// read-side summary snapshot that stays current without the lock.
pub type SharedProject = Arc<ProjectShared>;

/// A [`ProjectContext`] shared between the registry, the watchdog, and the
/// output readers.
///
/// Mutations go through [`ProjectShared::lock`]; when the guard drops, the
/// summary snapshot is republished. `list_all` and `status` read only the
/// snapshot, so a project busy in a long stop never blocks them.
pub struct ProjectShared {
    ctx: Mutex<ProjectContext>,
    summary: RwLock<ProjectSummary>,
}

impl ProjectShared {
    pub fn new(ctx: ProjectContext) -> SharedProject {
        let summary = RwLock::new(ctx.summary());
        Arc::new(Self {
            ctx: Mutex::new(ctx),
            summary,
        })
    }

    /// Lock the context for mutation. The snapshot is republished when the
    /// returned guard drops.
    pub async fn lock(&self) -> ProjectGuard<'_> {
        ProjectGuard {
            guard: self.ctx.lock().await,
            summary: &self.summary,
        }
    }

    /// Current read-only snapshot; never blocks behind the context lock.
    pub fn summary(&self) -> ProjectSummary {
        match self.summary.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Mutation guard over a [`ProjectContext`]; republishes the summary
/// snapshot on drop.
pub struct ProjectGuard<'a> {
    guard: MutexGuard<'a, ProjectContext>,
    summary: &'a RwLock<ProjectSummary>,
}

impl Deref for ProjectGuard<'_> {
    type Target = ProjectContext;

    fn deref(&self) -> &ProjectContext {
        &self.guard
    }
}

impl DerefMut for ProjectGuard<'_> {
    fn deref_mut(&mut self) -> &mut ProjectContext {
        &mut self.guard
    }
}

impl Drop for ProjectGuard<'_> {
    fn drop(&mut self) {
        let snapshot = self.guard.summary();
        match self.summary.write() {
            Ok(mut s) => *s = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ProjectContext {
        ProjectContext::create(dir.path(), None, 5).unwrap()
    }

    #[test]
    fn test_create_canonicalizes_and_names() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        assert!(ctx.root_path.is_absolute());
        assert_eq!(ctx.state(), LoopState::Idle);
        assert_eq!(
            ctx.display_name,
            ctx.root_path.file_name().unwrap().to_string_lossy()
        );
    }

    #[test]
    fn test_create_rejects_missing_path() {
        let err = ProjectContext::create(Path::new("/definitely/not/here"), None, 5).unwrap_err();
        assert!(matches!(err, HerdError::InvalidPath { .. }));
    }

    #[test]
    fn test_create_rejects_file_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(ProjectContext::create(&file, None, 5).is_err());
    }

    #[test]
    fn test_log_buffer_drops_oldest() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        for i in 0..8 {
            ctx.add_log(format!("line {i}"));
        }
        assert_eq!(ctx.log_len(), 5);
        let logs = ctx.logs();
        assert_eq!(logs.first().unwrap(), "line 3");
        assert_eq!(logs.last().unwrap(), "line 7");
    }

    #[test]
    fn test_apply_rejects_bad_transition_without_mutation() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        assert!(ctx.apply(Trigger::Pause).is_err());
        assert_eq!(ctx.state(), LoopState::Idle);
    }

    #[test]
    fn test_fail_records_reason_and_outcome() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        ctx.apply(Trigger::StartAdmitted).unwrap();
        ctx.fail(Trigger::SpawnFailed, "binary missing").unwrap();
        assert_eq!(ctx.state(), LoopState::Error);
        assert_eq!(ctx.error_message.as_deref(), Some("binary missing"));
        assert_eq!(ctx.last_status, RunOutcome::Failed);
    }

    #[test]
    fn test_finish_clears_runtime_fields() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        ctx.apply(Trigger::StartAdmitted).unwrap();
        ctx.apply(Trigger::SpawnConfirmed).unwrap();
        ctx.update_position(Some(EpicId::Num(1)), Some("1-1".into()), Some("implement".into()));
        ctx.finish(true).unwrap();

        assert_eq!(ctx.state(), LoopState::Idle);
        assert_eq!(ctx.last_status, RunOutcome::Success);
        assert!(ctx.current_phase.is_none());
        assert!(ctx.phase_start_time.is_none());
        assert!(ctx.queue_position.is_none());
    }

    #[test]
    fn test_queued_then_admitted() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        ctx.apply(Trigger::StartQueued).unwrap();
        ctx.queue_position = Some(1);
        ctx.apply(Trigger::Admit).unwrap();
        assert_eq!(ctx.state(), LoopState::Starting);
        ctx.apply(Trigger::SpawnConfirmed).unwrap();
        // admission to RUNNING clears the stale queue position
        assert!(ctx.queue_position.is_none());
    }

    #[tokio::test]
    async fn test_shared_snapshot_tracks_mutations() {
        let dir = TempDir::new().unwrap();
        let shared = ProjectShared::new(ctx(&dir));
        assert_eq!(shared.summary().state, LoopState::Idle);

        {
            let mut guard = shared.lock().await;
            guard.apply(Trigger::StartQueued).unwrap();
            guard.queue_position = Some(1);
        }

        let summary = shared.summary();
        assert_eq!(summary.state, LoopState::Queued);
        assert_eq!(summary.queue_position, Some(1));
    }

    #[test]
    fn test_summary_reflects_state() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        ctx.update_position(None, None, Some("validate".into()));
        let summary = ctx.summary();
        assert_eq!(summary.id, ctx.id);
        assert_eq!(summary.current_phase.as_deref(), Some("validate"));
        assert!(summary.phase_duration_seconds.unwrap() >= 0.0);
    }
}

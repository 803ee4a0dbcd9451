//! The project registry: registration, admission, and control routing.
//!
//! [`ProjectRegistry`] is the single authority over every registered project.
//! It owns the map of [`SharedProject`]s, the [`AdmissionQueue`], the
//! [`Broadcaster`], and the [`ProcessSupervisor`], and wires them together:
//! control requests validate against the per-project state machine, slot
//! accounting goes through the queue, and every lifecycle change lands on
//! the project's event channel.
//!
//! Locking discipline: the project map lock and the queue lock are plain
//! sync locks, never held across an await. Per-project context locks are
//! async and may be held across long operations (a graceful stop); reads
//! like `list_all` and `status` use the published summary snapshots and
//! never touch the context locks.
//!
//! Registrations persist in `projects.toml` inside the config directory; an
//! exclusive `registry.lock` file guards against two registry instances
//! sharing that directory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Broadcaster, ChannelConfig, Subscription};
use crate::config::{RegistryConfig, CONTROL_DIR, PROJECTS_FILE, REGISTRY_LOCK_FILE};
use crate::error::{HerdError, Result};
use crate::events::LoopEvent;
use crate::flags::ControlFlags;
use crate::project::{
    short_id, ProjectContext, ProjectShared, ProjectSummary, RunOutcome, SharedProject,
};
use crate::queue::AdmissionQueue;
use crate::state::{LoopState, Trigger};
use crate::supervisor::{ExitNotice, ProcessSupervisor};

/// One row of `projects.toml`.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedProject {
    id: Uuid,
    path: PathBuf,
    display_name: String,
    #[serde(default)]
    last_status: RunOutcome,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<PersistedProject>,
}

/// Registry of projects and the loops running inside them.
pub struct ProjectRegistry {
    config: RegistryConfig,
    config_dir: PathBuf,
    supervisor: ProcessSupervisor,
    broadcaster: Broadcaster,
    projects: RwLock<HashMap<Uuid, SharedProject>>,
    queue: Mutex<AdmissionQueue>,
    exits: mpsc::UnboundedSender<ExitNotice>,
    /// Held exclusively for the lifetime of this instance.
    _instance_lock: File,
}

impl ProjectRegistry {
    /// Open the registry in `config_dir`, loading `server.toml` from it.
    ///
    /// Must be called inside a tokio runtime; the registry spawns its
    /// admission pump on open.
    pub fn open(config_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(config_dir)?;
        let config = RegistryConfig::load(config_dir);
        Self::open_with(config_dir, config)
    }

    /// Open the registry with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails when another instance already holds the registry lock for this
    /// config directory.
    pub fn open_with(config_dir: &Path, config: RegistryConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(config_dir)?;

        let lock_path = config_dir.join(REGISTRY_LOCK_FILE);
        let instance_lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        instance_lock.try_lock_exclusive().map_err(|_| {
            HerdError::Other(anyhow::anyhow!(
                "another registry instance holds {}",
                lock_path.display()
            ))
        })?;

        let projects = Self::load_projects(config_dir, &config);
        info!(
            config_dir = %config_dir.display(),
            projects = projects.len(),
            max_concurrent = config.max_concurrent_loops,
            "registry opened"
        );

        let (exits, exit_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            supervisor: ProcessSupervisor::new(config.clone()),
            broadcaster: Broadcaster::new(ChannelConfig::from(&config)),
            projects: RwLock::new(projects),
            queue: Mutex::new(AdmissionQueue::new(
                config.max_concurrent_loops,
                config.queue_max_size,
            )),
            exits,
            config,
            config_dir: config_dir.to_path_buf(),
            _instance_lock: instance_lock,
        });
        registry.spawn_admission_pump(exit_rx);
        Ok(registry)
    }

    fn load_projects(
        config_dir: &Path,
        config: &RegistryConfig,
    ) -> HashMap<Uuid, SharedProject> {
        let path = config_dir.join(PROJECTS_FILE);
        let persisted: ProjectsFile = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "malformed project list, starting empty");
                ProjectsFile::default()
            }),
            Err(_) => ProjectsFile::default(),
        };

        let mut map = HashMap::new();
        for entry in persisted.projects {
            let ctx = ProjectContext::restore(
                entry.id,
                entry.path,
                entry.display_name,
                entry.last_status,
                config.log_buffer_size,
            );
            // flags left over from a previous run would wedge the next loop
            ControlFlags::new(&ctx.root_path).cleanup_stale();
            map.insert(entry.id, ProjectShared::new(ctx));
        }
        map
    }

    /// The configuration this registry runs with.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a project root and persist the registration.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for a missing or non-directory path,
    /// `AlreadyRegistered` when the canonical path is already known.
    pub fn register(
        &self,
        path: &Path,
        display_name: Option<String>,
    ) -> Result<ProjectSummary> {
        let ctx = ProjectContext::create(path, display_name, self.config.log_buffer_size)?;
        let summary = ctx.summary();

        {
            let mut projects = self.projects.write().expect("registry poisoned");
            for existing in projects.values() {
                let s = existing.summary();
                if s.path == ctx.root_path {
                    return Err(HerdError::AlreadyRegistered {
                        path: s.path,
                        id: s.id.to_string(),
                    });
                }
            }
            projects.insert(ctx.id, ProjectShared::new(ctx));
        }

        self.save()?;
        info!(
            project = %summary.display_name,
            id = %short_id(&summary.id),
            path = %summary.path.display(),
            "project registered"
        );
        Ok(summary)
    }

    /// Unregister a project.
    ///
    /// # Errors
    ///
    /// `ProjectBusy` while its loop is active or queued; stop it first.
    pub async fn unregister(&self, id: Uuid) -> Result<()> {
        let project = self.project(id)?;
        {
            let ctx = project.lock().await;
            if !ctx.state().is_terminal() {
                return Err(HerdError::ProjectBusy {
                    name: ctx.display_name.clone(),
                    state: ctx.state(),
                });
            }
        }

        self.projects
            .write()
            .expect("registry poisoned")
            .remove(&id);
        self.broadcaster.remove(id);
        self.save()?;
        info!(id = %short_id(&id), "project unregistered");
        Ok(())
    }

    /// Summaries of every registered project, sorted by display name.
    ///
    /// Reads only published snapshots; never blocks behind a busy project.
    pub fn list_all(&self) -> Vec<ProjectSummary> {
        let mut all: Vec<ProjectSummary> = self
            .projects
            .read()
            .expect("registry poisoned")
            .values()
            .map(|p| p.summary())
            .collect();
        all.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        all
    }

    /// Snapshot of one project.
    pub fn status(&self, id: Uuid) -> Result<ProjectSummary> {
        Ok(self.project(id)?.summary())
    }

    /// Buffered raw output lines of one project, oldest first.
    pub async fn logs(&self, id: Uuid) -> Result<Vec<String>> {
        let project = self.project(id)?;
        let ctx = project.lock().await;
        Ok(ctx.logs())
    }

    /// Subscribe to a project's event channel (replay first, then live).
    pub fn subscribe(&self, id: Uuid) -> Result<Subscription> {
        self.project(id)?;
        Ok(self.broadcaster.channel(id).subscribe())
    }

    /// Immediate subdirectories of `dir` that look like unregistered
    /// projects (they carry a `.git` or control directory).
    pub fn scan_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let registered: Vec<PathBuf> = self
            .projects
            .read()
            .expect("registry poisoned")
            .values()
            .map(|p| p.summary().path)
            .collect();

        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if !path.join(".git").exists() && !path.join(CONTROL_DIR).exists() {
                continue;
            }
            let canonical = path.canonicalize().unwrap_or(path);
            if !registered.contains(&canonical) {
                found.push(canonical);
            }
        }
        found.sort();
        Ok(found)
    }

    // =========================================================================
    // Loop control
    // =========================================================================

    /// Start a project's loop, or queue it when the concurrency budget is
    /// spent.
    ///
    /// Starting an already-queued project is idempotent and returns its
    /// current position.
    ///
    /// # Errors
    ///
    /// `ProjectBusy` while the loop is active, `QueueFull` when the waiting
    /// list is at capacity, `Spawn` when the subprocess fails to come up
    /// (the project lands in ERROR).
    pub async fn request_start(&self, id: Uuid) -> Result<ProjectSummary> {
        let project = self.project(id)?;
        let mut ctx = project.lock().await;

        match ctx.state() {
            LoopState::Queued => return Ok(ctx.summary()),
            state if state.occupies_slot() => {
                return Err(HerdError::ProjectBusy {
                    name: ctx.display_name.clone(),
                    state,
                });
            }
            _ => {}
        }

        if !ctx.root_path.is_dir() {
            ctx.mark_stale();
            return Err(HerdError::PathStale {
                path: ctx.root_path.clone(),
            });
        }
        ctx.path_stale = false;

        let admitted = { self.queue_guard().try_acquire_slot() };
        if admitted {
            ctx.apply(Trigger::StartAdmitted)?;
            if let Err(e) = self.launch(&project, &mut ctx).await {
                drop(ctx);
                {
                    self.queue_guard().release_slot();
                }
                self.admit_from_queue().await;
                return Err(e);
            }
        } else {
            let position = { self.queue_guard().enqueue(id)? };
            ctx.apply(Trigger::StartQueued)?;
            ctx.queue_position = Some(position);
            info!(
                project = %ctx.display_name,
                position,
                "no free slot, loop queued"
            );
        }
        Ok(ctx.summary())
    }

    /// Request a cooperative pause; the loop keeps running until it reaches
    /// a phase boundary.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the loop is RUNNING.
    pub async fn request_pause(&self, id: Uuid) -> Result<ProjectSummary> {
        let project = self.project(id)?;
        let mut ctx = project.lock().await;

        if ctx.state() != LoopState::Running {
            return Err(HerdError::invalid_transition(ctx.state(), "pause"));
        }

        ControlFlags::new(&ctx.root_path).write_pause()?;
        ctx.apply(Trigger::Pause)?;
        self.broadcaster.channel(id).publish(LoopEvent::LoopStatus {
            status: "pause_requested".into(),
            reason: None,
        });
        Ok(ctx.summary())
    }

    /// Resume a paused loop.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the loop is PAUSED.
    pub async fn request_resume(&self, id: Uuid) -> Result<ProjectSummary> {
        let project = self.project(id)?;
        let mut ctx = project.lock().await;

        if ctx.state() != LoopState::Paused {
            return Err(HerdError::invalid_transition(ctx.state(), "resume"));
        }

        ControlFlags::new(&ctx.root_path).clear_pause()?;
        ctx.apply(Trigger::Resume)?;
        self.broadcaster.channel(id).publish(LoopEvent::LoopStatus {
            status: "running".into(),
            reason: Some("resumed".into()),
        });
        Ok(ctx.summary())
    }

    /// Stop a project's loop, cancelling its queue entry if it never got a
    /// slot. Idempotent: stopping a settled project succeeds.
    pub async fn request_stop(&self, id: Uuid) -> Result<ProjectSummary> {
        let project = self.project(id)?;
        let mut ctx = project.lock().await;
        let channel = self.broadcaster.channel(id);
        let state = ctx.state();

        if state == LoopState::Queued {
            {
                self.queue_guard().remove(id);
            }
            ctx.apply(Trigger::Stop)?;
            channel.publish(LoopEvent::LoopStatus {
                status: "stopped".into(),
                reason: Some("cancelled".into()),
            });
            let summary = ctx.summary();
            drop(ctx);
            self.republish_positions().await;
            return Ok(summary);
        }

        let had_slot = state.occupies_slot();
        self.supervisor.stop(&mut ctx).await?;
        if !had_slot {
            return Ok(ctx.summary());
        }

        channel.publish(LoopEvent::LoopStatus {
            status: "stopped".into(),
            reason: Some("user_requested".into()),
        });
        let summary = ctx.summary();
        drop(ctx);
        {
            self.queue_guard().release_slot();
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist project list");
        }
        self.admit_from_queue().await;
        Ok(summary)
    }

    /// Re-check every registered root path.
    ///
    /// A vanished path stops the loop if one is active, cancels a queue
    /// entry, and marks the project ERROR with `path_stale` set. The
    /// registration itself is never deleted; a restored path clears the
    /// stale marker on the next reconcile. Returns the post-reconcile
    /// summaries of every project.
    pub async fn reconcile(&self) -> Vec<ProjectSummary> {
        let projects: Vec<SharedProject> = self
            .projects
            .read()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect();

        let mut report = Vec::with_capacity(projects.len());
        for project in projects {
            let mut ctx = project.lock().await;

            if ctx.root_path.is_dir() {
                if ctx.path_stale {
                    info!(project = %ctx.display_name, "project path restored");
                    ctx.path_stale = false;
                }
                report.push(ctx.summary());
                continue;
            }

            if ctx.path_stale {
                report.push(ctx.summary());
                continue;
            }

            let state = ctx.state();
            let was_queued = state == LoopState::Queued;
            let had_slot = state.occupies_slot();
            if had_slot {
                if let Err(e) = self.supervisor.stop(&mut ctx).await {
                    warn!(project = %ctx.display_name, error = %e, "stop during reconcile failed");
                }
            }
            if was_queued {
                self.queue_guard().remove(ctx.id);
            }
            ctx.mark_stale();
            report.push(ctx.summary());
            drop(ctx);

            if had_slot {
                {
                    self.queue_guard().release_slot();
                }
                self.admit_from_queue().await;
            }
            if was_queued {
                self.republish_positions().await;
            }
        }
        report
    }

    /// Stop every active loop, close every channel, and persist.
    pub async fn shutdown(&self) {
        info!("registry shutting down");
        let projects: Vec<SharedProject> = self
            .projects
            .read()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect();

        for project in projects {
            let mut ctx = project.lock().await;
            if ctx.state().is_terminal() {
                continue;
            }
            if ctx.state() == LoopState::Queued {
                self.queue_guard().remove(ctx.id);
                let _ = ctx.apply(Trigger::Stop);
            } else if let Err(e) = self.supervisor.stop(&mut ctx).await {
                warn!(project = %ctx.display_name, error = %e, "stop during shutdown failed");
            }
        }

        self.broadcaster.shutdown();
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist project list");
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn project(&self, id: Uuid) -> Result<SharedProject> {
        self.projects
            .read()
            .expect("registry poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| HerdError::not_found(id.to_string()))
    }

    fn queue_guard(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.queue.lock().expect("queue poisoned")
    }

    /// Spawn the subprocess for a project whose slot is already claimed and
    /// wire up readers and watchdog. On failure the project lands in ERROR;
    /// the claimed slot stays with the caller.
    async fn launch(&self, project: &SharedProject, ctx: &mut ProjectContext) -> Result<()> {
        let channel = self.broadcaster.channel(ctx.id);
        match self.supervisor.spawn(ctx).await {
            Ok(output) => {
                ctx.apply(Trigger::SpawnConfirmed)?;
                channel.publish(LoopEvent::LoopStatus {
                    status: "running".into(),
                    reason: None,
                });
                self.supervisor.spawn_output_reader(
                    Arc::clone(project),
                    channel.clone(),
                    self.exits.clone(),
                    output.stdout,
                );
                if let Some(stderr) = output.stderr {
                    self.supervisor.spawn_output_reader(
                        Arc::clone(project),
                        channel.clone(),
                        self.exits.clone(),
                        stderr,
                    );
                }
                self.supervisor
                    .spawn_watchdog(Arc::clone(project), channel, self.exits.clone());
                Ok(())
            }
            Err(e) => {
                ctx.fail(Trigger::SpawnFailed, e.to_string())?;
                channel.publish(LoopEvent::Error {
                    message: e.to_string(),
                    code: e.code().into(),
                });
                channel.publish(LoopEvent::LoopStatus {
                    status: "error".into(),
                    reason: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Admit queue heads into free slots until one starts or the queue is
    /// drained of usable candidates.
    async fn admit_from_queue(&self) {
        loop {
            let next = { self.queue_guard().admit_next() };
            self.republish_positions().await;
            let Some(id) = next else {
                return;
            };

            let Ok(project) = self.project(id) else {
                // unregistered while waiting; return the claimed slot
                self.queue_guard().release_slot();
                continue;
            };

            let mut ctx = project.lock().await;
            if ctx.state() != LoopState::Queued {
                self.queue_guard().release_slot();
                continue;
            }
            if ctx.apply(Trigger::Admit).is_err() {
                self.queue_guard().release_slot();
                continue;
            }

            info!(project = %ctx.display_name, "admitting queued loop");
            match self.launch(&project, &mut ctx).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(project = %ctx.display_name, error = %e, "queued loop failed to start");
                    drop(ctx);
                    self.queue_guard().release_slot();
                }
            }
        }
    }

    /// Push the queue's dense 1-based positions back onto the waiting
    /// contexts after a structural change.
    async fn republish_positions(&self) {
        let positions = { self.queue_guard().positions() };
        for (id, position) in positions {
            if let Ok(project) = self.project(id) {
                let mut ctx = project.lock().await;
                if ctx.state() == LoopState::Queued {
                    ctx.queue_position = Some(position);
                }
            }
        }
    }

    fn spawn_admission_pump(self: &Arc<Self>, mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(notice) = exit_rx.recv().await {
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                debug!(
                    project = %short_id(&notice.project_id),
                    "loop exited, releasing slot"
                );
                {
                    registry.queue_guard().release_slot();
                }
                if let Err(e) = registry.save() {
                    warn!(error = %e, "failed to persist project list");
                }
                registry.admit_from_queue().await;
            }
        });
    }

    /// Persist the project list atomically (write-then-rename).
    fn save(&self) -> Result<()> {
        let mut entries: Vec<PersistedProject> = self
            .projects
            .read()
            .expect("registry poisoned")
            .values()
            .map(|p| {
                let s = p.summary();
                PersistedProject {
                    id: s.id,
                    path: s.path,
                    display_name: s.display_name,
                    last_status: s.last_status,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));

        let body = toml::to_string_pretty(&ProjectsFile { projects: entries })
            .map_err(|e| HerdError::Other(e.into()))?;
        let tmp = self.config_dir.join(format!("{PROJECTS_FILE}.tmp"));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.config_dir.join(PROJECTS_FILE))?;
        Ok(())
    }
}

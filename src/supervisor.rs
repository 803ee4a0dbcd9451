//! Subprocess lifecycle: spawn, watchdog, and escalating termination.
//!
//! The supervisor owns the OS-level side of exactly one loop subprocess per
//! project. It confirms liveness after spawn, polls liveness on a fixed
//! interval (the watchdog is the *only* crash detector — output silence is
//! never interpreted as death), and tears processes down with an escalation
//! ladder: stop flag, then terminate, then kill, every step logged.
//!
//! The escalation policy is platform-independent; the platform-specific part
//! is hidden behind the [`ProcessHandle`] capability trait.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ProjectChannel;
use crate::config::RegistryConfig;
use crate::error::{HerdError, Result};
use crate::events::LoopEvent;
use crate::flags::ControlFlags;
use crate::parser::parse_line;
use crate::project::{ProjectContext, SharedProject};
use crate::state::{LoopState, Trigger};

/// Poll step used while waiting out stop/terminate grace periods.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Final wait after a force kill before giving up on the handle.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Capability interface over one live subprocess.
///
/// The supervisor's escalation logic is written against this trait; the
/// tokio-backed [`ChildHandle`] is the production implementation and tests
/// substitute scripted fakes.
pub trait ProcessHandle: Send {
    /// OS pid, while the process is running.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check. `Some(code)` once the process has exited.
    fn poll_exit(&mut self) -> Option<i32>;

    /// Ask the process to terminate (SIGTERM on Unix). Best effort.
    fn terminate(&mut self);

    /// Force-kill the process (SIGKILL). Best effort.
    fn force_kill(&mut self);
}

/// [`ProcessHandle`] over a [`tokio::process::Child`].
pub struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn poll_exit(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_code(&status)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "try_wait failed, treating process as exited");
                Some(-1)
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        // no graceful signal on this platform; go straight to kill
        let _ = self.child.start_kill();
    }

    fn force_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "force kill failed (process may have exited)");
        }
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signo` as
/// shells report them.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Notice that a project's subprocess is gone; the registry listens for
/// these to release the slot and admit the queue head.
#[derive(Debug, Clone, Copy)]
pub struct ExitNotice {
    pub project_id: Uuid,
}

/// Captured stdout/stderr pipes of a freshly spawned loop.
#[derive(Debug)]
pub struct LoopOutput {
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Spawns, monitors, and terminates loop subprocesses.
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: RegistryConfig,
}

impl ProcessSupervisor {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    /// Spawn the loop subprocess for a project and confirm it survives the
    /// spawn grace period.
    ///
    /// On success the handle is attached to the context and the output
    /// pipes are returned for the reader task. Failure reasons (missing
    /// binary, immediate non-zero exit, spawn error) are captured in the
    /// returned [`HerdError::Spawn`]; the caller decides the state effect.
    pub async fn spawn(&self, ctx: &mut ProjectContext) -> Result<LoopOutput> {
        let command_line = &self.config.loop_command;
        let program = command_line
            .first()
            .ok_or_else(|| HerdError::spawn("loop command is empty"))?;

        // fail fast with a readable message instead of a raw ENOENT
        let program_path = which::which(program)
            .map_err(|_| HerdError::spawn(format!("loop binary '{program}' not found in PATH")))?;

        let flags = ControlFlags::new(&ctx.root_path);
        std::fs::create_dir_all(flags.dir())?;
        flags.clear_pause()?;
        flags.clear_stop()?;

        info!(
            project = %ctx.display_name,
            command = %command_line.join(" "),
            cwd = %ctx.root_path.display(),
            "spawning loop subprocess"
        );

        let mut child = Command::new(program_path)
            .args(&command_line[1..])
            .current_dir(&ctx.root_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HerdError::spawn(format!("failed to spawn '{program}': {e}")))?;

        tokio::time::sleep(self.config.spawn_grace()).await;

        if let Ok(Some(status)) = child.try_wait() {
            let code = exit_code(&status);
            if code != 0 {
                return Err(HerdError::spawn(format!(
                    "loop subprocess exited immediately with code {code}"
                )));
            }
            // a zero exit inside the grace window is a legitimately tiny
            // run; the watchdog will observe it and settle to IDLE
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HerdError::spawn("loop subprocess has no stdout pipe"))?;
        let stderr = child.stderr.take();

        ctx.process = Some(Box::new(ChildHandle::new(child)));
        Ok(LoopOutput { stdout, stderr })
    }

    /// Start the watchdog task for a running project.
    ///
    /// The watchdog polls the handle on the configured interval. A death
    /// observed while the state is RUNNING / PAUSE_REQUESTED / PAUSED is a
    /// crash (non-zero) or a completion (zero); either way the slot is
    /// released via `exits`. The task ends when the handle is gone.
    pub fn spawn_watchdog(
        &self,
        project: SharedProject,
        channel: ProjectChannel,
        exits: mpsc::UnboundedSender<ExitNotice>,
    ) -> JoinHandle<()> {
        let interval = self.config.watchdog_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let mut ctx = project.lock().await;
                let Some(handle) = ctx.process.as_mut() else {
                    // stopped through the control surface; nothing to watch
                    break;
                };

                let Some(code) = handle.poll_exit() else {
                    // alive: this poll is the health check
                    ctx.last_seen = chrono::Utc::now();
                    continue;
                };

                let project_id = ctx.id;
                let flags = ControlFlags::new(&ctx.root_path);
                let _ = flags.clear_stop();
                let _ = flags.clear_pause();
                let _ = flags.clear_lock();

                if code == 0 {
                    info!(project = %ctx.display_name, "loop completed cleanly");
                    if ctx.finish(true).is_ok() {
                        channel.publish(LoopEvent::LoopStatus {
                            status: "stopped".into(),
                            reason: Some("completed".into()),
                        });
                    }
                } else {
                    let crash = HerdError::WatchdogCrash { exit_code: code };
                    error!(project = %ctx.display_name, exit_code = code, "watchdog found loop dead");
                    if ctx.fail(Trigger::Crash, crash.to_string()).is_ok() {
                        channel.publish(LoopEvent::Error {
                            message: crash.to_string(),
                            code: crash.code().into(),
                        });
                        channel.publish(LoopEvent::LoopStatus {
                            status: "error".into(),
                            reason: Some(crash.to_string()),
                        });
                    }
                }

                drop(ctx);
                let _ = exits.send(ExitNotice { project_id });
                break;
            }
        })
    }

    /// Start the output reader task for one pipe of a running project.
    ///
    /// Every line is parsed, appended to the project's log buffer, applied
    /// to the state machine where relevant (phase boundaries complete
    /// pauses, error events fail the loop), and published to the channel.
    pub fn spawn_output_reader<R>(
        &self,
        project: SharedProject,
        channel: ProjectChannel,
        exits: mpsc::UnboundedSender<ExitNotice>,
        stream: R,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "output stream read failed");
                        break;
                    }
                };

                let event = parse_line(&line);
                let mut ctx = project.lock().await;
                ctx.add_log(&line);
                let mut failed_project = None;

                match &event {
                    LoopEvent::PhaseChanged { to, story_id, .. } => {
                        ctx.update_position(None, Some(story_id.clone()), Some(to.clone()));
                    }
                    LoopEvent::StoryStarted {
                        epic_id, story_id, ..
                    } => {
                        ctx.update_position(
                            Some(epic_id.clone()),
                            Some(story_id.clone()),
                            None,
                        );
                    }
                    LoopEvent::StoryCompleted { .. } => {}
                    LoopEvent::Error { message, .. } => {
                        if ctx.state().occupies_slot() && ctx.state() != LoopState::Starting {
                            warn!(project = %ctx.display_name, %message, "loop reported fatal error");
                            if let Some(handle) = ctx.process.as_mut() {
                                handle.terminate();
                            }
                            let _ = ctx.fail(Trigger::Crash, message.clone());
                            failed_project = Some(ctx.id);
                        }
                        // later error lines from a loop already settled in
                        // ERROR still get published below
                    }
                    _ => {}
                }

                // a phase boundary while a pause is pending completes it
                if event.is_phase_boundary() && ctx.state() == LoopState::PauseRequested {
                    if ctx.apply(Trigger::PhaseBoundary).is_ok() {
                        channel.publish(LoopEvent::LoopStatus {
                            status: "paused".into(),
                            reason: None,
                        });
                    }
                }

                drop(ctx);
                channel.publish(event);
                if let Some(project_id) = failed_project {
                    let _ = exits.send(ExitNotice { project_id });
                }
            }
        })
    }

    /// Stop the subprocess with escalation: stop flag, graceful wait,
    /// terminate, short wait, force kill.
    ///
    /// Requires the caller to hold the project's critical section; on
    /// return the context is IDLE with the handle cleared and flags
    /// removed. Safe to call when no process is alive.
    pub async fn stop(&self, ctx: &mut ProjectContext) -> Result<()> {
        let flags = ControlFlags::new(&ctx.root_path);

        if ctx.state().is_terminal() {
            // stop is idempotent; a settled project only gets its flags swept
            let _ = flags.clear_pause();
            let _ = flags.clear_stop();
            return Ok(());
        }

        if ctx.process.is_none() {
            // QUEUED / STARTING without a live handle; just settle state
            ctx.finish(false)?;
            let _ = flags.clear_pause();
            let _ = flags.clear_stop();
            return Ok(());
        }

        let pid = ctx.process.as_ref().and_then(|h| h.pid());
        info!(project = %ctx.display_name, ?pid, "stopping loop subprocess");

        // step 1: cooperative stop flag
        if let Err(e) = flags.write_stop() {
            warn!(error = %e, "failed to write stop flag, escalating directly");
        }

        let mut exit = self
            .wait_for_exit(ctx, self.config.subprocess_timeout())
            .await;

        // step 2: terminate
        if exit.is_none() {
            warn!(project = %ctx.display_name, ?pid, "loop ignored stop flag, sending terminate");
            if let Some(handle) = ctx.process.as_mut() {
                handle.terminate();
            }
            exit = self.wait_for_exit(ctx, self.config.sigterm_grace()).await;
        }

        // step 3: force kill
        if exit.is_none() {
            warn!(project = %ctx.display_name, ?pid, "loop ignored terminate, force killing");
            if let Some(handle) = ctx.process.as_mut() {
                handle.force_kill();
            }
            exit = self.wait_for_exit(ctx, KILL_REAP_TIMEOUT).await;
            if exit.is_none() {
                error!(project = %ctx.display_name, ?pid, "loop survived force kill");
            }
        }

        let _ = flags.clear_stop();
        let _ = flags.clear_pause();
        let _ = flags.clear_lock();

        ctx.finish(exit == Some(0))?;
        info!(project = %ctx.display_name, exit_code = ?exit, "loop stopped");
        Ok(())
    }

    async fn wait_for_exit(&self, ctx: &mut ProjectContext, window: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if let Some(handle) = ctx.process.as_mut() {
                if let Some(code) = handle.poll_exit() {
                    return Some(code);
                }
            } else {
                return None;
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(window)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::project::ProjectShared;
    use crate::state::Trigger;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Scripted handle: stays alive for `polls_until_exit` polls, reacts to
    /// terminate/kill according to flags.
    struct FakeHandle {
        polls: Arc<AtomicU32>,
        polls_until_exit: u32,
        exit_code: i32,
        dies_on_terminate: bool,
        terminated: Arc<AtomicI32>,
        killed: Arc<AtomicI32>,
        dead: bool,
    }

    impl FakeHandle {
        fn stubborn(terminated: Arc<AtomicI32>, killed: Arc<AtomicI32>) -> Self {
            Self {
                polls: Arc::new(AtomicU32::new(0)),
                polls_until_exit: u32::MAX,
                exit_code: 137,
                dies_on_terminate: false,
                terminated,
                killed,
                dead: false,
            }
        }
    }

    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            (!self.dead).then_some(4242)
        }

        fn poll_exit(&mut self) -> Option<i32> {
            if self.dead {
                return Some(self.exit_code);
            }
            let n = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= self.polls_until_exit {
                self.dead = true;
                return Some(self.exit_code);
            }
            if self.dies_on_terminate && self.terminated.load(Ordering::Relaxed) > 0 {
                self.dead = true;
                return Some(143);
            }
            if self.killed.load(Ordering::Relaxed) > 0 {
                self.dead = true;
                return Some(137);
            }
            None
        }

        fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::Relaxed);
        }

        fn force_kill(&mut self) {
            self.killed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            subprocess_timeout_secs: 0,
            sigterm_grace_secs: 0,
            watchdog_interval_ms: 10,
            spawn_grace_ms: 10,
            ..RegistryConfig::default()
        }
    }

    fn running_ctx(dir: &TempDir, handle: Box<dyn ProcessHandle>) -> ProjectContext {
        let mut ctx = ProjectContext::create(dir.path(), None, 10).unwrap();
        ctx.apply(Trigger::StartAdmitted).unwrap();
        ctx.apply(Trigger::SpawnConfirmed).unwrap();
        ctx.process = Some(handle);
        ctx
    }

    #[tokio::test]
    async fn test_stop_escalates_to_terminate() {
        let dir = TempDir::new().unwrap();
        let terminated = Arc::new(AtomicI32::new(0));
        let killed = Arc::new(AtomicI32::new(0));
        let handle = FakeHandle {
            dies_on_terminate: true,
            ..FakeHandle::stubborn(Arc::clone(&terminated), Arc::clone(&killed))
        };
        let mut ctx = running_ctx(&dir, Box::new(handle));

        let supervisor = ProcessSupervisor::new(fast_config());
        supervisor.stop(&mut ctx).await.unwrap();

        assert_eq!(ctx.state(), LoopState::Idle);
        assert!(ctx.process.is_none());
        assert!(terminated.load(Ordering::Relaxed) >= 1);
        assert_eq!(killed.load(Ordering::Relaxed), 0, "kill must not fire when terminate works");
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill_for_stubborn_process() {
        let dir = TempDir::new().unwrap();
        let terminated = Arc::new(AtomicI32::new(0));
        let killed = Arc::new(AtomicI32::new(0));
        let handle = FakeHandle::stubborn(Arc::clone(&terminated), Arc::clone(&killed));
        let mut ctx = running_ctx(&dir, Box::new(handle));

        let supervisor = ProcessSupervisor::new(fast_config());
        supervisor.stop(&mut ctx).await.unwrap();

        assert_eq!(ctx.state(), LoopState::Idle);
        assert!(terminated.load(Ordering::Relaxed) >= 1);
        assert!(killed.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_stop_removes_flags() {
        let dir = TempDir::new().unwrap();
        let flags = ControlFlags::new(dir.path());
        flags.write_pause().unwrap();

        let terminated = Arc::new(AtomicI32::new(0));
        let killed = Arc::new(AtomicI32::new(0));
        let handle = FakeHandle {
            polls_until_exit: 1,
            exit_code: 0,
            ..FakeHandle::stubborn(terminated, killed)
        };
        let mut ctx = running_ctx(&dir, Box::new(handle));

        let supervisor = ProcessSupervisor::new(fast_config());
        supervisor.stop(&mut ctx).await.unwrap();

        assert!(!flags.stop_flag().exists());
        assert!(!flags.pause_flag().exists());
    }

    #[tokio::test]
    async fn test_stop_without_process_is_safe() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ProjectContext::create(dir.path(), None, 10).unwrap();
        ctx.apply(Trigger::StartQueued).unwrap();

        let supervisor = ProcessSupervisor::new(fast_config());
        supervisor.stop(&mut ctx).await.unwrap();
        assert_eq!(ctx.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_reader_publishes_every_error_line() {
        let dir = TempDir::new().unwrap();
        let terminated = Arc::new(AtomicI32::new(0));
        let killed = Arc::new(AtomicI32::new(0));
        let handle = FakeHandle {
            dies_on_terminate: true,
            ..FakeHandle::stubborn(Arc::clone(&terminated), Arc::clone(&killed))
        };
        let project = ProjectShared::new(running_ctx(&dir, Box::new(handle)));

        let channel = ProjectChannel::new(
            project.summary().id,
            ChannelConfig {
                subscriber_queue_size: 32,
                replay_buffer_size: 32,
                heartbeat_interval: Duration::from_secs(30),
            },
        );
        let mut sub = channel.subscribe();
        let (exits, mut exit_rx) = mpsc::unbounded_channel();

        let input = Cursor::new(
            concat!(
                r#"DASHBOARD_EVENT:{"type":"error","message":"provider timeout","code":"llm_timeout"}"#,
                "\n",
                r#"DASHBOARD_EVENT:{"type":"error","message":"retry failed","code":"llm_timeout"}"#,
                "\n",
            )
            .as_bytes()
            .to_vec(),
        );

        let supervisor = ProcessSupervisor::new(fast_config());
        supervisor
            .spawn_output_reader(Arc::clone(&project), channel.clone(), exits, input)
            .await
            .unwrap();

        let _ = sub.recv().await.unwrap(); // replay batch

        // the first error fails the loop; the second arrives after the
        // project has settled in ERROR and must still reach subscribers
        for expected in ["provider timeout", "retry failed"] {
            let env = sub.recv().await.unwrap();
            match env.event {
                LoopEvent::Error { message, .. } => assert_eq!(message, expected),
                other => panic!("wrong variant: {other:?}"),
            }
        }

        assert_eq!(project.summary().state, LoopState::Error);
        assert!(terminated.load(Ordering::Relaxed) >= 1);
        // exactly one exit notice frees the slot
        assert!(exit_rx.try_recv().is_ok());
        assert!(exit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_fails_for_missing_binary() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig {
            loop_command: vec!["definitely-not-a-real-binary-xyz".into()],
            ..fast_config()
        };
        let mut ctx = ProjectContext::create(dir.path(), None, 10).unwrap();
        ctx.apply(Trigger::StartAdmitted).unwrap();

        let supervisor = ProcessSupervisor::new(config);
        let err = supervisor.spawn(&mut ctx).await.unwrap_err();
        assert!(matches!(err, HerdError::Spawn { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_immediate_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig {
            loop_command: vec!["sh".into(), "-c".into(), "exit 3".into()],
            spawn_grace_ms: 200,
            ..fast_config()
        };
        let mut ctx = ProjectContext::create(dir.path(), None, 10).unwrap();
        ctx.apply(Trigger::StartAdmitted).unwrap();

        let supervisor = ProcessSupervisor::new(config);
        let err = supervisor.spawn(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("code 3"), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_attaches_handle_for_live_process() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig {
            loop_command: vec!["sh".into(), "-c".into(), "sleep 5".into()],
            spawn_grace_ms: 50,
            ..fast_config()
        };
        let mut ctx = ProjectContext::create(dir.path(), None, 10).unwrap();
        ctx.apply(Trigger::StartAdmitted).unwrap();

        let supervisor = ProcessSupervisor::new(config);
        let output = supervisor.spawn(&mut ctx).await.unwrap();
        assert!(ctx.process.is_some());
        drop(output);

        // cleanup
        supervisor.stop(&mut ctx).await.unwrap();
    }
}

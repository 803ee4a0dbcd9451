//! Filesystem signaling contract with the loop subprocess.
//!
//! The supervisor and the subprocess do not share a pipe for control; they
//! share a directory. Inside each project root, the control directory
//! (`.loopherd/`) carries three flag files:
//!
//! - `pause.flag` — written by the supervisor, observed by the subprocess at
//!   a safe boundary; deleted on resume or stop.
//! - `stop.flag` — written by the supervisor to request a graceful exit;
//!   deleted once the process is gone.
//! - `loop.lock` — written by the subprocess on start with its pid; lets a
//!   restarted registry detect a stale "already running" claim.
//!
//! Flag operations are best-effort against a filesystem another process owns
//! half of; removal of an already-missing flag is success, not an error.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::CONTROL_DIR;
use crate::error::Result;

const PAUSE_FLAG: &str = "pause.flag";
const STOP_FLAG: &str = "stop.flag";
const LOCK_FLAG: &str = "loop.lock";

/// Handle to one project's control directory.
#[derive(Debug, Clone)]
pub struct ControlFlags {
    dir: PathBuf,
}

impl ControlFlags {
    /// Control flags for a project root.
    pub fn new(project_root: &Path) -> Self {
        Self {
            dir: project_root.join(CONTROL_DIR),
        }
    }

    /// Path of the control directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pause_flag(&self) -> PathBuf {
        self.dir.join(PAUSE_FLAG)
    }

    pub fn stop_flag(&self) -> PathBuf {
        self.dir.join(STOP_FLAG)
    }

    pub fn lock_flag(&self) -> PathBuf {
        self.dir.join(LOCK_FLAG)
    }

    /// Create the pause flag.
    pub fn write_pause(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.pause_flag(), b"")?;
        info!(dir = %self.dir.display(), "pause flag written");
        Ok(())
    }

    /// Remove the pause flag; missing flag is fine.
    pub fn clear_pause(&self) -> Result<()> {
        remove_if_present(&self.pause_flag())
    }

    /// Create the stop flag.
    pub fn write_stop(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.stop_flag(), b"")?;
        info!(dir = %self.dir.display(), "stop flag written");
        Ok(())
    }

    /// Remove the stop flag; missing flag is fine.
    pub fn clear_stop(&self) -> Result<()> {
        remove_if_present(&self.stop_flag())
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_flag().exists()
    }

    /// Pid recorded in the subprocess's lock flag, if present and parseable.
    pub fn lock_pid(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(self.lock_flag()).ok()?;
        contents.trim().parse().ok()
    }

    /// True when the lock flag claims a running loop but no such process is
    /// alive. An unparseable lock flag also counts as stale.
    pub fn lock_is_stale(&self) -> bool {
        if !self.lock_flag().exists() {
            return false;
        }
        match self.lock_pid() {
            Some(pid) => !pid_alive(pid),
            None => true,
        }
    }

    /// Remove the lock flag; missing flag is fine.
    pub fn clear_lock(&self) -> Result<()> {
        remove_if_present(&self.lock_flag())
    }

    /// Startup cleanup: remove pause/stop flags left by a previous registry
    /// run, and a lock flag whose pid is dead.
    ///
    /// Returns true when a stale lock was found, so the caller can reset the
    /// project to IDLE.
    pub fn cleanup_stale(&self) -> bool {
        for flag in [self.pause_flag(), self.stop_flag()] {
            if flag.exists() {
                if let Err(e) = remove_if_present(&flag) {
                    warn!(flag = %flag.display(), error = %e, "failed to remove stale flag");
                } else {
                    info!(flag = %flag.display(), "removed stale flag");
                }
            }
        }

        let stale = self.lock_is_stale();
        if stale {
            info!(dir = %self.dir.display(), "stale loop lock found, clearing");
            if let Err(e) = self.clear_lock() {
                warn!(error = %e, "failed to clear stale loop lock");
            }
        }
        stale
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(flag = %path.display(), "flag removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Probe whether a pid refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // signal 0 performs the permission/existence check without delivering
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // no cheap probe on this platform; treat the lock as live and let the
    // watchdog sort it out
    true
}

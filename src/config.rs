//! Registry configuration.
//!
//! Loaded from `server.toml` in the loopherd config directory. Every field
//! has a default so a missing or partial file is fine; an unreadable or
//! malformed file falls back to defaults with a warning rather than refusing
//! to start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Name of the server configuration file inside the config directory.
pub const SERVER_CONFIG_FILE: &str = "server.toml";

/// Name of the persisted project list inside the config directory.
pub const PROJECTS_FILE: &str = "projects.toml";

/// Name of the per-project control directory.
pub const CONTROL_DIR: &str = ".loopherd";

/// Name of the single-instance lock file inside the config directory.
pub const REGISTRY_LOCK_FILE: &str = "registry.lock";

fn default_max_concurrent_loops() -> usize {
    2
}
fn default_queue_max_size() -> usize {
    10
}
fn default_subprocess_timeout_secs() -> u64 {
    30
}
fn default_sigterm_grace_secs() -> u64 {
    5
}
fn default_watchdog_interval_ms() -> u64 {
    5_000
}
fn default_spawn_grace_ms() -> u64 {
    500
}
fn default_log_buffer_size() -> usize {
    500
}
fn default_subscriber_queue_size() -> usize {
    1_000
}
fn default_replay_buffer_size() -> usize {
    500
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_loop_command() -> Vec<String> {
    vec![
        "devloop".to_string(),
        "run".to_string(),
        "--non-interactive".to_string(),
    ]
}

/// Configuration for the project registry and everything it wires together.
///
/// # Example
///
/// ```
/// use loopherd::config::RegistryConfig;
///
/// let config = RegistryConfig::default();
/// assert_eq!(config.max_concurrent_loops, 2);
/// assert_eq!(config.queue_max_size, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum simultaneously slot-occupying loops.
    #[serde(default = "default_max_concurrent_loops")]
    pub max_concurrent_loops: usize,

    /// Maximum number of projects waiting for a slot.
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    /// Seconds to wait for a graceful exit after writing the stop flag.
    #[serde(default = "default_subprocess_timeout_secs")]
    pub subprocess_timeout_secs: u64,

    /// Seconds between the terminate signal and the force kill.
    #[serde(default = "default_sigterm_grace_secs")]
    pub sigterm_grace_secs: u64,

    /// Milliseconds between watchdog liveness polls.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Milliseconds to wait after spawn before confirming liveness.
    #[serde(default = "default_spawn_grace_ms")]
    pub spawn_grace_ms: u64,

    /// Capacity of each project's raw log ring buffer.
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,

    /// Capacity of each subscriber's event queue.
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,

    /// Capacity of each channel's replay ring buffer.
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,

    /// Seconds of subscriber silence before a heartbeat is synthesized.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Command line used to launch the loop subprocess. The project root is
    /// appended as the working directory, not as an argument.
    #[serde(default = "default_loop_command")]
    pub loop_command: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loops: default_max_concurrent_loops(),
            queue_max_size: default_queue_max_size(),
            subprocess_timeout_secs: default_subprocess_timeout_secs(),
            sigterm_grace_secs: default_sigterm_grace_secs(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            spawn_grace_ms: default_spawn_grace_ms(),
            log_buffer_size: default_log_buffer_size(),
            subscriber_queue_size: default_subscriber_queue_size(),
            replay_buffer_size: default_replay_buffer_size(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            loop_command: default_loop_command(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from `server.toml` under `config_dir`.
    ///
    /// Missing file yields defaults. A malformed file also yields defaults,
    /// with a warning, so a bad edit can never make the registry unbootable.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(SERVER_CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed server config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Default config directory (`~/.config/loopherd` on Linux).
    ///
    /// Falls back to `.loopherd` in the current directory when the platform
    /// config dir cannot be determined.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("loopherd"))
            .unwrap_or_else(|| PathBuf::from(CONTROL_DIR))
    }

    /// Graceful-exit wait after the stop flag is written.
    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }

    /// Wait between terminate and kill.
    pub fn sigterm_grace(&self) -> Duration {
        Duration::from_secs(self.sigterm_grace_secs)
    }

    /// Watchdog poll interval.
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Post-spawn liveness confirmation window.
    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    /// Subscriber heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

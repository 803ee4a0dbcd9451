//! Loopherd - Multi-Project AI Loop Orchestration
//!
//! A registry and supervisor for running autonomous development loops
//! across many projects at once, with bounded concurrency, cooperative
//! pausing, and per-project event streams.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`registry`] - Project registration, admission, and control routing
//! - [`supervisor`] - Subprocess spawn, watchdog, and escalating termination
//! - [`state`] - The per-project loop state machine
//! - [`queue`] - FIFO admission queue and concurrency slot accounting
//! - [`channel`] - Per-project event broadcast with replay and heartbeats
//! - [`parser`] - Structured event extraction from subprocess output
//! - [`events`] - Event and envelope types on the wire
//! - [`flags`] - Filesystem signaling contract with the loop subprocess
//! - [`project`] - Per-project runtime state and summaries
//! - [`config`] - Configuration loading and defaults
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust,ignore
//! use loopherd::config::RegistryConfig;
//! use loopherd::registry::ProjectRegistry;
//!
//! let registry = ProjectRegistry::open(&RegistryConfig::default_config_dir())?;
//! let project = registry.register("/path/to/project".as_ref(), None)?;
//!
//! // Start the loop (or queue it when all slots are busy)
//! let summary = registry.request_start(project.id).await?;
//!
//! // Stream its events: replay first, then live
//! let mut events = registry.subscribe(project.id)?;
//! while let Some(envelope) = events.recv().await {
//!     println!("{:?}", envelope.event);
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod flags;
pub mod parser;
pub mod project;
pub mod queue;
pub mod registry;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use error::{HerdError, Result};

// Re-export registry and project types
pub use project::{ProjectContext, ProjectShared, ProjectSummary, RunOutcome, SharedProject};
pub use registry::ProjectRegistry;

// Re-export state machine types
pub use state::{LoopState, Trigger};

// Re-export event and channel types
pub use channel::{Broadcaster, ChannelConfig, ProjectChannel, Subscription};
pub use events::{EpicId, EventEnvelope, LogLevel, LoopEvent};
pub use parser::{parse_line, EVENT_PREFIX};

// Re-export configuration
pub use config::RegistryConfig;

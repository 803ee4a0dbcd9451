//! Event types flowing from the loop subprocess to subscribers.
//!
//! [`LoopEvent`] is a closed union keyed by the `type` discriminator of the
//! wire format. Anything a subprocess can print maps onto exactly one
//! variant; lines that fail structured parsing become [`LoopEvent::Output`]
//! (see [`crate::parser`]), so downstream code never deals with untyped
//! payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity attached to raw output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Epic identifier; the wire format allows both numeric and named epics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EpicId {
    Num(i64),
    Name(String),
}

impl std::fmt::Display for EpicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpicId::Num(n) => write!(f, "{n}"),
            EpicId::Name(s) => write!(f, "{s}"),
        }
    }
}

/// One event on a project's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// The loop moved from one phase to another. Phase boundaries also
    /// acknowledge pending pause requests.
    PhaseChanged {
        from: String,
        to: String,
        story_id: String,
    },
    /// Work began on a story.
    StoryStarted {
        epic_id: EpicId,
        story_id: String,
        title: String,
    },
    /// A story finished, successfully or not.
    StoryCompleted {
        epic_id: EpicId,
        story_id: String,
        result: String,
    },
    /// Overall loop status changed (running, paused, stopped, error).
    LoopStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Something went wrong; also drives the state machine to ERROR.
    Error { message: String, code: String },
    /// Liveness marker, synthesized per subscriber on receive timeout.
    Heartbeat,
    /// A raw, unstructured output line.
    Output { line: String, level: LogLevel },
    /// Replay batch sent once to each new subscriber before live streaming.
    Replay {
        events: Vec<EventEnvelope>,
        count: usize,
    },
}

impl LoopEvent {
    /// Phase-boundary events are the only signals that complete a
    /// cooperative pause (`PAUSE_REQUESTED -> PAUSED`).
    pub fn is_phase_boundary(&self) -> bool {
        matches!(
            self,
            LoopEvent::PhaseChanged { .. }
                | LoopEvent::StoryStarted { .. }
                | LoopEvent::StoryCompleted { .. }
        )
    }

    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LoopEvent::PhaseChanged { .. } => "phase_changed",
            LoopEvent::StoryStarted { .. } => "story_started",
            LoopEvent::StoryCompleted { .. } => "story_completed",
            LoopEvent::LoopStatus { .. } => "loop_status",
            LoopEvent::Error { .. } => "error",
            LoopEvent::Heartbeat => "heartbeat",
            LoopEvent::Output { .. } => "output",
            LoopEvent::Replay { .. } => "replay",
        }
    }
}

/// Delivery wrapper carrying routing and ordering metadata.
///
/// `seq` is assigned per channel and strictly increases in production order,
/// which is what lets a late subscriber verify the replay-then-live sequence
/// lines up with what earlier subscribers saw. Delivery artifacts — replay
/// batches and heartbeats — are synthesized per subscriber, not published,
/// and carry [`EventEnvelope::ARTIFACT_SEQ`] instead of a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub project_id: Uuid,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LoopEvent,
}

impl EventEnvelope {
    /// Sentinel `seq` for per-subscriber delivery artifacts (replay batches
    /// and heartbeats). Published events are numbered from 1.
    pub const ARTIFACT_SEQ: u64 = 0;

    /// Wrap an event for delivery.
    pub fn new(project_id: Uuid, seq: u64, event: LoopEvent) -> Self {
        Self {
            project_id,
            seq,
            ts: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_discriminator() {
        let event = LoopEvent::PhaseChanged {
            from: "create-story".into(),
            to: "validate".into(),
            story_id: "1-3".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase_changed");
        assert_eq!(json["from"], "create-story");
    }

    #[test]
    fn test_epic_id_accepts_number_and_string() {
        let ev: LoopEvent = serde_json::from_str(
            r#"{"type":"story_started","epic_id":2,"story_id":"2-1","title":"Auth"}"#,
        )
        .unwrap();
        match ev {
            LoopEvent::StoryStarted { epic_id, .. } => assert_eq!(epic_id, EpicId::Num(2)),
            other => panic!("wrong variant: {other:?}"),
        }

        let ev: LoopEvent = serde_json::from_str(
            r#"{"type":"story_started","epic_id":"infra","story_id":"i-1","title":"CI"}"#,
        )
        .unwrap();
        match ev {
            LoopEvent::StoryStarted { epic_id, .. } => {
                assert_eq!(epic_id, EpicId::Name("infra".into()))
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_phase_boundary_classification() {
        let boundary = LoopEvent::PhaseChanged {
            from: "a".into(),
            to: "b".into(),
            story_id: "s".into(),
        };
        assert!(boundary.is_phase_boundary());
        assert!(!LoopEvent::Heartbeat.is_phase_boundary());
        assert!(!LoopEvent::Output {
            line: "hi".into(),
            level: LogLevel::Info
        }
        .is_phase_boundary());
    }

    #[test]
    fn test_loop_status_reason_optional() {
        let ev: LoopEvent = serde_json::from_str(r#"{"type":"loop_status","status":"running"}"#)
            .unwrap();
        match ev {
            LoopEvent::LoopStatus { status, reason } => {
                assert_eq!(status, "running");
                assert!(reason.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let id = Uuid::new_v4();
        let env = EventEnvelope::new(
            id,
            42,
            LoopEvent::Output {
                line: "building...".into(),
                level: LogLevel::Info,
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project_id, id);
        assert_eq!(back.seq, 42);
        assert_eq!(back.event, env.event);
    }

    #[test]
    fn test_replay_nests_envelopes() {
        let id = Uuid::new_v4();
        let inner = EventEnvelope::new(id, 1, LoopEvent::Heartbeat);
        let env = EventEnvelope::new(
            id,
            2,
            LoopEvent::Replay {
                events: vec![inner.clone()],
                count: 1,
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        match back.event {
            LoopEvent::Replay { events, count } => {
                assert_eq!(count, 1);
                assert_eq!(events[0].seq, inner.seq);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}

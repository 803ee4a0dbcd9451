//! Structured-event parsing for subprocess output.
//!
//! The loop subprocess marks structured events by printing a line of the
//! form `DASHBOARD_EVENT:{json}`. Everything else is plain log output. This
//! parser is total: any input string, including a mangled marker line,
//! produces an event — worst case a raw [`LoopEvent::Output`] with a logged
//! warning. Parsing never errors and never panics.

use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

use crate::events::{LogLevel, LoopEvent};

/// Marker prefix for structured events on stdout.
pub const EVENT_PREFIX: &str = "DASHBOARD_EVENT:";

fn level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\[(\w+)\]").expect("valid log level regex"))
}

/// Sniff a log level from a `[LEVEL]` line prefix, defaulting to info.
pub fn parse_log_level(line: &str) -> LogLevel {
    if let Some(caps) = level_pattern().captures(line) {
        match caps[1].to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warning" | "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    } else {
        LogLevel::Info
    }
}

/// Parse one line of subprocess output into an event.
///
/// A line containing the [`EVENT_PREFIX`] marker has the JSON after the
/// marker decoded into the typed union; on any decode failure the whole line
/// degrades to a raw output event. Lines without the marker are output
/// events with a sniffed level.
pub fn parse_line(line: &str) -> LoopEvent {
    if let Some(idx) = line.find(EVENT_PREFIX) {
        let json = line[idx + EVENT_PREFIX.len()..].trim();
        match serde_json::from_str::<LoopEvent>(json) {
            Ok(event) => return event,
            Err(e) => {
                warn!(
                    %line,
                    error = %e,
                    "unparseable structured event, degrading to raw output"
                );
            }
        }
    }

    LoopEvent::Output {
        line: line.to_string(),
        level: parse_log_level(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EpicId;

    #[test]
    fn test_parse_phase_changed() {
        let line = r#"DASHBOARD_EVENT:{"type":"phase_changed","from":"implement","to":"review","story_id":"3-2"}"#;
        match parse_line(line) {
            LoopEvent::PhaseChanged { from, to, story_id } => {
                assert_eq!(from, "implement");
                assert_eq!(to, "review");
                assert_eq!(story_id, "3-2");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_story_events() {
        let line = r#"DASHBOARD_EVENT:{"type":"story_started","epic_id":1,"story_id":"1-1","title":"Login"}"#;
        match parse_line(line) {
            LoopEvent::StoryStarted { epic_id, .. } => assert_eq!(epic_id, EpicId::Num(1)),
            other => panic!("wrong variant: {other:?}"),
        }

        let line = r#"DASHBOARD_EVENT:{"type":"story_completed","epic_id":1,"story_id":"1-1","result":"success"}"#;
        assert!(matches!(
            parse_line(line),
            LoopEvent::StoryCompleted { .. }
        ));
    }

    #[test]
    fn test_parse_error_event() {
        let line = r#"DASHBOARD_EVENT:{"type":"error","message":"provider timeout","code":"llm_timeout"}"#;
        match parse_line(line) {
            LoopEvent::Error { message, code } => {
                assert_eq!(message, "provider timeout");
                assert_eq!(code, "llm_timeout");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_marker_mid_line() {
        // supervisors sometimes prepend timestamps; the marker may not be at col 0
        let line = r#"12:01:02 DASHBOARD_EVENT:{"type":"loop_status","status":"running"}"#;
        assert!(matches!(parse_line(line), LoopEvent::LoopStatus { .. }));
    }

    #[test]
    fn test_malformed_json_degrades_to_output() {
        let line = "DASHBOARD_EVENT:{not valid json";
        match parse_line(line) {
            LoopEvent::Output { line: raw, level } => {
                assert_eq!(raw, line);
                assert_eq!(level, LogLevel::Info);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_degrades_to_output() {
        let line = r#"DASHBOARD_EVENT:{"type":"telemetry","cpu":93}"#;
        assert!(matches!(parse_line(line), LoopEvent::Output { .. }));
    }

    #[test]
    fn test_plain_line_levels() {
        assert!(matches!(
            parse_line("[ERROR] compilation failed"),
            LoopEvent::Output {
                level: LogLevel::Error,
                ..
            }
        ));
        assert!(matches!(
            parse_line("[warn] deprecated API"),
            LoopEvent::Output {
                level: LogLevel::Warn,
                ..
            }
        ));
        assert!(matches!(
            parse_line("[DEBUG] entering phase"),
            LoopEvent::Output {
                level: LogLevel::Debug,
                ..
            }
        ));
        assert!(matches!(
            parse_line("plain progress line"),
            LoopEvent::Output {
                level: LogLevel::Info,
                ..
            }
        ));
    }

    #[test]
    fn test_parser_is_total() {
        // none of these may panic or error
        for line in ["", "DASHBOARD_EVENT:", "DASHBOARD_EVENT:null", "[", "\u{0}"] {
            let _ = parse_line(line);
        }
    }
}

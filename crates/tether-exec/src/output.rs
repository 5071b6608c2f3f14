// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Parsers for the Agent's output formats.
//!
//! The result-mode parser is deliberately tolerant: Agents have been seen
//! prefixing the JSON object with a UTF-8 BOM, update banners and other
//! chatter, so we strip the BOM, discard everything before the first `{`
//! and, if the whole-body parse still fails, retry line by line looking
//! for an object that carries a `result` field.

use serde::{Deserialize, Serialize};

/// The single JSON object emitted in `--output-format json` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub num_turns: i64,
}

/// Parse result-mode stdout. Returns `None` when no JSON object with a
/// `result` field can be found anywhere in the output.
pub fn parse_result_output(raw: &str) -> Option<TaskOutput> {
    let cleaned = raw.trim_start_matches('\u{feff}');
    let from_brace = match cleaned.find('{') {
        Some(idx) => &cleaned[idx..],
        None => return None,
    };

    if let Ok(output) = serde_json::from_str::<TaskOutput>(from_brace.trim()) {
        return Some(output);
    }

    // Whole-body parse failed; the object may share the stream with other
    // lines. Look for the line that carries `result`.
    for line in cleaned.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if value.get("result").is_some() {
                if let Ok(output) = serde_json::from_value::<TaskOutput>(value) {
                    return Some(output);
                }
            }
        }
    }
    None
}

/// The terminator object of `--output-format stream-json` mode.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, rename = "finalText")]
    pub final_text: String,
    #[serde(default, rename = "durationMs")]
    pub duration_ms: i64,
    #[serde(default, rename = "numTurns")]
    pub num_turns: i64,
}

/// Classify one stream-mode line: a JSON object (with its `completion`
/// terminator detected) or a raw passthrough.
pub enum StreamLine {
    Event(serde_json::Value),
    Completion(CompletionEvent),
    Raw(String),
}

pub fn parse_stream_line(line: &str) -> Option<StreamLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => {
            if value.get("type").and_then(|t| t.as_str()) == Some("completion") {
                if let Ok(done) = serde_json::from_value::<CompletionEvent>(value.clone()) {
                    return Some(StreamLine::Completion(done));
                }
            }
            Some(StreamLine::Event(value))
        }
        Err(_) => Some(StreamLine::Raw(line.to_string())),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_json_parses() {
        let raw = r#"{"result": "done", "session_id": "abc", "is_error": false, "duration_ms": 12, "num_turns": 3}"#;
        let out = parse_result_output(raw).unwrap();
        assert_eq!(out.result, "done");
        assert_eq!(out.session_id.as_deref(), Some("abc"));
        assert_eq!(out.num_turns, 3);
    }

    #[test]
    fn bom_and_chatter_before_first_brace_are_discarded() {
        let raw = "\u{feff}Checking for updates...\nA new version is available!\n{\"result\": \"ok\", \"duration_ms\": 5}";
        let out = parse_result_output(raw).unwrap();
        assert_eq!(out.result, "ok");
        assert_eq!(out.duration_ms, 5);
    }

    #[test]
    fn line_retry_finds_the_result_object() {
        let raw = "{\"type\": \"noise\"}\n{\"result\": \"found\", \"num_turns\": 1}\ntrailing garbage";
        let out = parse_result_output(raw).unwrap();
        assert_eq!(out.result, "found");
    }

    #[test]
    fn missing_result_everywhere_is_none() {
        assert!(parse_result_output("no json here").is_none());
        assert!(parse_result_output("{\"type\": \"noise\"}").is_none());
    }

    #[test]
    fn result_round_trips_through_serialization() {
        let out = TaskOutput {
            result: "all good".into(),
            session_id: Some("abc123".into()),
            is_error: false,
            duration_ms: 777,
            num_turns: 4,
        };
        let json = serde_json::to_string(&out).unwrap();
        assert_eq!(parse_result_output(&json).unwrap(), out);
    }

    #[test]
    fn stream_completion_line_is_detected() {
        let line = r#"{"type": "completion", "session_id": "abc", "finalText": "done", "durationMs": 9, "numTurns": 2}"#;
        match parse_stream_line(line) {
            Some(StreamLine::Completion(done)) => {
                assert_eq!(done.final_text, "done");
                assert_eq!(done.duration_ms, 9);
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn stream_non_json_line_is_raw() {
        match parse_stream_line("plain text") {
            Some(StreamLine::Raw(s)) => assert_eq!(s, "plain text"),
            _ => panic!("expected raw"),
        }
        assert!(parse_stream_line("   ").is_none());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Text-mode activity classification.
//!
//! Without structured output the Agent narrates its work as plain lines
//! (`[READ] (src/main.rs, offset: 0, limit: 100)`, `Read 100 lines.`,
//! `Succeeded. File edited. (src/main.rs)`). An ordered pattern set turns
//! those into typed activity events for the UI; anything non-empty that is
//! not a JSON brace line passes through as `{type:"raw"}`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

struct Pattern {
    regex: Regex,
    kind: &'static str,
    has_tool: bool,
}

fn patterns() -> &'static Vec<Pattern> {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let def: &[(&str, &str, bool)] = &[
            // Tool invocations with detail: `[READ] (file, offset: 0)`
            (r"(?i)\[(\w+)\]\s*\(([^)]+)\)", "tool_start", true),
            // Tool line without parens: `[EXECUTE] cargo test`
            (r"(?i)\[(\w+)\]\s*(.+)", "tool_info", true),
            // Status updates
            (r"(?i)Read (\d+) lines?\.?", "read_complete", false),
            (r"(?i)Succeeded\. File edited\. \(([^)]+)\)", "edit_complete", false),
            (r"(?i)Error:\s*(.+)", "error", false),
            (r"(?i)Executing\.\.\.", "executing", false),
            (r"(?i)Completed", "completed", false),
        ];
        def.iter()
            .map(|(re, kind, has_tool)| Pattern {
                // The literals above are fixed; a bad one is a programming
                // error caught by the tests below.
                regex: Regex::new(re).unwrap(),
                kind,
                has_tool: *has_tool,
            })
            .collect()
    })
}

/// Classify one output line. `None` for blank lines and JSON braces (those
/// belong to the structured parsers).
pub fn classify_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    for pattern in patterns() {
        if let Some(caps) = pattern.regex.captures(trimmed) {
            let details = caps
                .get(2)
                .or_else(|| caps.get(1))
                .map(|m| m.as_str().to_string());
            let tool = if pattern.has_tool {
                caps.get(1).map(|m| m.as_str().to_string())
            } else {
                None
            };
            return Some(json!({
                "type": pattern.kind,
                "tool": tool,
                "details": details,
                "raw": trimmed,
            }));
        }
    }

    if trimmed.starts_with('{') {
        return None;
    }
    Some(json!({ "type": "raw", "raw": trimmed }))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_start_with_parenthesised_detail() {
        let v = classify_line("[READ] (src/main.rs, offset: 0, limit: 100)").unwrap();
        assert_eq!(v["type"], "tool_start");
        assert_eq!(v["tool"], "READ");
        assert_eq!(v["details"], "src/main.rs, offset: 0, limit: 100");
    }

    #[test]
    fn tool_info_without_parens() {
        let v = classify_line("[EXECUTE] cargo test --all").unwrap();
        assert_eq!(v["type"], "tool_info");
        assert_eq!(v["tool"], "EXECUTE");
    }

    #[test]
    fn status_lines() {
        assert_eq!(classify_line("Read 120 lines.").unwrap()["type"], "read_complete");
        assert_eq!(
            classify_line("Succeeded. File edited. (src/lib.rs)").unwrap()["type"],
            "edit_complete"
        );
        assert_eq!(
            classify_line("Error: no such file").unwrap()["type"],
            "error"
        );
        assert_eq!(classify_line("Executing...").unwrap()["type"], "executing");
    }

    #[test]
    fn unmatched_non_brace_lines_pass_through_as_raw() {
        let v = classify_line("thinking about the problem").unwrap();
        assert_eq!(v["type"], "raw");
        assert_eq!(v["raw"], "thinking about the problem");
    }

    #[test]
    fn blank_and_json_lines_are_skipped() {
        assert!(classify_line("").is_none());
        assert!(classify_line("   ").is_none());
        assert!(classify_line("{\"result\": \"x\"}").is_none());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tolerant extraction from the Agent's hook payloads.
//!
//! Field spellings have drifted across Agent releases (`session_id`,
//! `sessionId`, bare `id`; `tool_name` vs `toolName`), so every accessor
//! tries the known spellings before falling back to the environment.

use serde_json::Value;

use tether_config::HookConfig;

pub struct HookPayload {
    pub raw: Value,
}

impl HookPayload {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    fn first_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.raw.get(k).and_then(|v| v.as_str()))
            .map(str::to_string)
    }

    pub fn session_id(&self, config: &HookConfig) -> String {
        self.first_str(&["session_id", "sessionId", "id"])
            .or_else(|| config.session_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn project_dir(&self, config: &HookConfig) -> String {
        self.first_str(&["project_dir", "projectDir", "cwd"])
            .or_else(|| config.project_dir.clone())
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn tool_name(&self) -> String {
        self.first_str(&["tool_name", "toolName"])
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn tool_input(&self) -> Value {
        self.raw
            .get("tool_input")
            .or_else(|| self.raw.get("toolInput"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn stop_hook_active(&self) -> bool {
        ["stop_hook_active", "stopHookActive"]
            .iter()
            .any(|k| self.raw.get(k).and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub fn summary(&self) -> Option<String> {
        self.first_str(&["summary", "lastAssistantMessage", "last_assistant_message"])
    }

    pub fn prompt(&self) -> Option<String> {
        self.first_str(&["prompt", "user_prompt", "userPrompt"])
    }

    pub fn message(&self) -> Option<String> {
        self.first_str(&["message", "title"])
    }
}

/// Display name for a session: the project directory's basename.
pub fn session_name(project_dir: &str) -> String {
    std::path::Path::new(project_dir)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Human-readable one-liner describing a tool call, shown on the surfaces.
pub fn describe_tool(tool_name: &str, tool_input: &Value) -> String {
    match tool_name {
        "Execute" => {
            let command = tool_input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            format!("Run command:\n`{command}`")
        }
        "Read" | "Edit" | "Create" | "MultiEdit" => {
            let path = tool_input
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            format!("{tool_name} file:\n`{path}`")
        }
        other => {
            let compact = serde_json::to_string(tool_input).unwrap_or_default();
            let preview: String = compact.chars().take(200).collect();
            format!("Use tool {other}:\n`{preview}`")
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> HookConfig {
        HookConfig::from_lookup(|_| None)
    }

    #[test]
    fn session_id_accepts_both_spellings() {
        let p = HookPayload::new(json!({"sessionId": "cam"}));
        assert_eq!(p.session_id(&config()), "cam");
        let p = HookPayload::new(json!({"session_id": "snake"}));
        assert_eq!(p.session_id(&config()), "snake");
        let p = HookPayload::new(json!({}));
        assert_eq!(p.session_id(&config()), "unknown");
    }

    #[test]
    fn env_session_id_beats_the_unknown_fallback() {
        let config = HookConfig::from_lookup(|k| {
            (k == "AGENT_SESSION_ID").then(|| "env-sess".to_string())
        });
        let p = HookPayload::new(json!({}));
        assert_eq!(p.session_id(&config), "env-sess");
    }

    #[test]
    fn stop_hook_flag_either_spelling() {
        assert!(HookPayload::new(json!({"stopHookActive": true})).stop_hook_active());
        assert!(HookPayload::new(json!({"stop_hook_active": true})).stop_hook_active());
        assert!(!HookPayload::new(json!({})).stop_hook_active());
    }

    #[test]
    fn describe_execute_shows_the_command() {
        let text = describe_tool("Execute", &json!({"command": "rm -rf build"}));
        assert!(text.contains("rm -rf build"));
    }

    #[test]
    fn session_name_is_the_basename() {
        assert_eq!(session_name("/proj/foo"), "foo");
        assert_eq!(session_name("/"), "unknown");
    }
}

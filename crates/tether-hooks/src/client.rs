// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP client used by the hook binary to reach the bridge.
//!
//! Retry policy: up to 3 attempts with exponential backoff (0.5 s, 1.0 s).
//! 4xx responses are never retried — the request is wrong, not the network.
//! All failures collapse into `None`/`false` returns; the hook decides what
//! failing open or closed means for its lifecycle point.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use tether_config::HookConfig;

pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

/// Outcome of a blocking wait call.
pub enum WaitReply {
    Response(String),
    Timeout,
    Cancelled,
    Unreachable,
}

impl BridgeClient {
    pub fn new(config: &HookConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.bridge_url.trim_end_matches('/').to_string(),
            secret: config.bridge_secret.clone(),
        }
    }

    /// Quick probe so hooks can fail open fast when the bridge is down.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(
            self.http
                .get(&url)
                .timeout(Duration::from_millis(800))
                .send()
                .await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Option<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut last_error = String::new();

        for attempt in 0u32..3 {
            if attempt > 0 {
                // 0.5 s, then 1.0 s.
                tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
            }
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("X-Bridge-Secret", &self.secret)
                .timeout(timeout);
            if let Some(ref body) = body {
                req = req.json(body);
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Value>().await.ok();
                    }
                    last_error = format!("HTTP {status}");
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        warn!(%url, "bridge request failed: {last_error}");
        None
    }

    pub async fn register_session(
        &self,
        session_id: &str,
        project_dir: &str,
        session_name: &str,
    ) -> bool {
        self.request(
            reqwest::Method::POST,
            "/hooks/sessions/register",
            Some(json!({
                "session_id": session_id,
                "project_dir": project_dir,
                "session_name": session_name,
            })),
            Duration::from_secs(10),
        )
        .await
        .is_some()
    }

    pub async fn update_status(&self, session_id: &str, status: &str) -> bool {
        self.request(
            reqwest::Method::PATCH,
            &format!("/hooks/sessions/{session_id}"),
            Some(json!({ "status": status })),
            Duration::from_secs(10),
        )
        .await
        .is_some()
    }

    /// Send a notification; returns the request id to wait on.
    #[allow(clippy::too_many_arguments)]
    pub async fn notify(
        &self,
        session_id: &str,
        session_name: &str,
        message: &str,
        kind: &str,
        buttons: Value,
        tool_name: Option<&str>,
        tool_input: Option<&Value>,
        timeout_secs: u64,
    ) -> Option<String> {
        let mut body = json!({
            "session_name": session_name,
            "message": message,
            "type": kind,
            "buttons": buttons,
        });
        if let Some(tool_name) = tool_name {
            body["tool_name"] = json!(tool_name);
        }
        if let Some(tool_input) = tool_input {
            body["tool_input"] = tool_input.clone();
        }
        self.request(
            reqwest::Method::POST,
            &format!("/hooks/sessions/{session_id}/notify"),
            Some(body),
            Duration::from_secs(timeout_secs),
        )
        .await
        .and_then(|v| v.get("request_id").and_then(|r| r.as_str()).map(str::to_string))
    }

    /// Block until the human answers or the bridge-side timeout fires.
    pub async fn wait_for_response(
        &self,
        session_id: &str,
        request_id: &str,
        timeout_secs: u64,
    ) -> WaitReply {
        let reply = self
            .request(
                reqwest::Method::POST,
                &format!("/hooks/sessions/{session_id}/wait"),
                Some(json!({ "request_id": request_id, "timeout": timeout_secs })),
                // Network buffer on top of the server-side wait.
                Duration::from_secs(timeout_secs + 15),
            )
            .await;

        let Some(reply) = reply else {
            return WaitReply::Unreachable;
        };
        debug!(?reply, "wait reply");
        if reply.get("has_response").and_then(|v| v.as_bool()) == Some(true) {
            if let Some(response) = reply.get("response").and_then(|v| v.as_str()) {
                return WaitReply::Response(response.to_string());
            }
        }
        if reply.get("timeout").and_then(|v| v.as_bool()) == Some(true) {
            return WaitReply::Timeout;
        }
        WaitReply::Cancelled
    }

    pub async fn cli_thinking(&self, session_id: &str, prompt: &str) -> bool {
        self.request(
            reqwest::Method::POST,
            &format!("/hooks/sessions/{session_id}/cli-thinking"),
            Some(json!({ "prompt": prompt })),
            Duration::from_secs(5),
        )
        .await
        .is_some()
    }

    pub async fn add_chat_message(
        &self,
        session_id: &str,
        msg_type: &str,
        content: &str,
    ) -> bool {
        self.request(
            reqwest::Method::POST,
            &format!("/sessions/{session_id}/chat"),
            Some(json!({ "type": msg_type, "content": content, "source": "cli" })),
            Duration::from_secs(10),
        )
        .await
        .is_some()
    }

    /// Pre-flight allowlist check: `allow`, `deny` or `ask`.
    pub async fn allowlist_check(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &Value,
    ) -> Option<String> {
        let input = serde_json::to_string(tool_input).ok()?;
        let path = format!(
            "/hooks/allowlist/check?session_id={}&tool_name={}&tool_input={}",
            urlencode(session_id),
            urlencode(tool_name),
            urlencode(&input),
        );
        self.request(reqwest::Method::GET, &path, None, Duration::from_secs(5))
            .await
            .and_then(|v| v.get("decision").and_then(|d| d.as_str()).map(str::to_string))
    }
}

/// Percent-encode a query value. Everything non-unreserved is escaped.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Permission engine — consulted before every tool use.
//!
//! Resolution order (first match wins):
//! 1. session-scoped deny rule
//! 2. session-scoped allow rule
//! 3. global deny rule
//! 4. global allow rule
//! 5. otherwise: ask the human
//!
//! Two rules of the same scope and type both matching: the most recently
//! added wins (the rule lists come back newest-first from the store).
//!
//! Matching targets: `Execute` patterns match the command string, file-tool
//! patterns (`Read`, `Edit`, `Create`, `MultiEdit`) match the file path,
//! and for any other tool only the catch-all pattern `*` matches.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use tether_store::{PermissionRequestRow, PermissionRuleRow, Result, Store};

use crate::events::{BridgeEvent, Notifier};
use crate::models::{DecidedBy, Decision, RuleScope, RuleType, SessionStatus};
use crate::registry::SessionRegistry;
use crate::rendezvous::RendezvousQueue;

/// Glob match: `*` is any run of characters, `?` exactly one, everything
/// else literal. Iterative with single-star backtracking.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

const FILE_TOOLS: &[&str] = &["Read", "Edit", "Create", "MultiEdit"];

/// What a rule pattern is matched against for a given tool call.
fn match_target(tool_name: &str, tool_input: &serde_json::Value) -> Option<String> {
    if tool_name == "Execute" {
        return tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    if FILE_TOOLS.contains(&tool_name) {
        return tool_input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    None
}

/// The pattern a "this session / always" decision materialises into.
pub fn pattern_for_rule(tool_name: &str, tool_input: &serde_json::Value) -> String {
    match_target(tool_name, tool_input).unwrap_or_else(|| "*".to_string())
}

fn rule_matches(rule: &PermissionRuleRow, tool_name: &str, target: Option<&str>) -> bool {
    if rule.tool_name != tool_name {
        return false;
    }
    match target {
        Some(text) => glob_match(&rule.pattern, text),
        // Unknown tools carry no matchable input; only `*` applies.
        None => rule.pattern == "*",
    }
}

pub struct PermissionEngine {
    store: Store,
    registry: Arc<SessionRegistry>,
    rendezvous: Arc<RendezvousQueue>,
    notifier: Notifier,
}

impl PermissionEngine {
    pub fn new(
        store: Store,
        registry: Arc<SessionRegistry>,
        rendezvous: Arc<RendezvousQueue>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            registry,
            rendezvous,
            notifier,
        }
    }

    /// Consult the rule table for one tool call. A rule hit writes an audit
    /// row (`decided_by = auto`); no rule means `Ask` and the caller runs
    /// the notify/wait flow.
    pub async fn check(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> Result<Decision> {
        let rules = self.store.rules_for_session(session_id).await?;
        let target = match_target(tool_name, tool_input);

        let passes: [(RuleScope, RuleType); 4] = [
            (RuleScope::Session, RuleType::Deny),
            (RuleScope::Session, RuleType::Allow),
            (RuleScope::Global, RuleType::Deny),
            (RuleScope::Global, RuleType::Allow),
        ];

        for (scope, rule_type) in passes {
            let hit = rules.iter().find(|r| {
                r.scope == scope.as_str()
                    && r.rule_type == rule_type.as_str()
                    && rule_matches(r, tool_name, target.as_deref())
            });
            if let Some(rule) = hit {
                let decision = match rule_type {
                    RuleType::Allow => Decision::Allow,
                    RuleType::Deny => Decision::Deny,
                };
                info!(
                    session_id,
                    tool = tool_name,
                    pattern = %rule.pattern,
                    %decision,
                    "rule matched"
                );
                self.record_auto_decision(session_id, tool_name, tool_input, decision)
                    .await?;
                return Ok(decision);
            }
        }
        Ok(Decision::Ask)
    }

    async fn record_auto_decision(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
        decision: Decision,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        self.store
            .create_permission_request(
                id.clone(),
                session_id.to_string(),
                Some(tool_name.to_string()),
                Some(tool_input.clone()),
                None,
                None,
            )
            .await?;
        let verdict = if decision == Decision::Allow {
            "approved"
        } else {
            "denied"
        };
        self.store
            .resolve_permission(&id, verdict.to_string(), DecidedBy::Auto.as_str().to_string())
            .await?;
        Ok(())
    }

    /// Record a human decision: audit row, optional rule materialisation,
    /// response delivery to the blocked hook, pending-request cleanup and
    /// the `permission_resolved` event.
    pub async fn resolve(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
        scope: Option<RuleScope>,
        decided_by: DecidedBy,
    ) -> Result<Option<PermissionRequestRow>> {
        let request = self.store.get_permission_request(request_id).await?;

        // Materialise the reusable rule before the Agent is unblocked, so
        // the very next tool call already sees it.
        if let Some(scope) = scope {
            if let Some(ref req) = request {
                let tool_name = req.tool_name.clone().unwrap_or_default();
                let input = req.tool_input.clone().unwrap_or(serde_json::Value::Null);
                let pattern = pattern_for_rule(&tool_name, &input);
                let rule_type = if approved { RuleType::Allow } else { RuleType::Deny };
                let rule_session = match scope {
                    RuleScope::Session => Some(session_id.to_string()),
                    RuleScope::Global => None,
                };
                self.store
                    .add_rule(
                        tool_name,
                        pattern,
                        rule_type.as_str().to_string(),
                        scope.as_str().to_string(),
                        rule_session,
                    )
                    .await?;
            }
        }

        let decision = match (approved, scope) {
            (true, None) => "approved",
            (false, None) => "denied",
            (true, Some(RuleScope::Session)) => "approved_session",
            (false, Some(RuleScope::Session)) => "denied_session",
            (true, Some(RuleScope::Global)) => "approved_global",
            (false, Some(RuleScope::Global)) => "denied_global",
        };

        let resolved = self
            .store
            .resolve_permission(request_id, decision.to_string(), decided_by.as_str().to_string())
            .await?;

        self.rendezvous.deliver_response(
            session_id,
            Some(request_id),
            if approved { "approve" } else { "deny" },
        );

        self.registry.set_pending_request(session_id, None).await?;
        self.registry
            .update_status(session_id, SessionStatus::Running)
            .await?;

        self.notifier.emit(BridgeEvent::PermissionResolved {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            decision: decision.to_string(),
        });

        Ok(resolved)
    }

    /// Audit a timed-out wait: the hook denies on its side; the bridge
    /// records why.
    pub async fn record_timeout(&self, request_id: &str) -> Result<()> {
        self.store
            .resolve_permission(
                request_id,
                "denied".to_string(),
                DecidedBy::Auto.as_str().to_string(),
            )
            .await?;
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;
    use crate::models::PendingRequest;
    use serde_json::json;

    #[test]
    fn glob_star_spans_everything_including_slashes() {
        assert!(glob_match("npm *", "npm test"));
        assert!(!glob_match("npm *", "npmx test"));
        assert!(glob_match("rm *", "rm -rf /"));
        assert!(glob_match("*", "anything at all"));
        assert!(glob_match("/src/*.rs", "/src/main.rs"));
    }

    #[test]
    fn glob_question_mark_is_exactly_one_char() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(!glob_match("a?c", "abbc"));
    }

    #[test]
    fn glob_literal_match_requires_equality() {
        assert!(glob_match("ls", "ls"));
        assert!(!glob_match("ls", "ls -la"));
        assert!(!glob_match("npm *", "npm"));
    }

    #[test]
    fn pattern_for_rule_picks_command_or_path() {
        assert_eq!(
            pattern_for_rule("Execute", &json!({"command": "npm test"})),
            "npm test"
        );
        assert_eq!(
            pattern_for_rule("Edit", &json!({"file_path": "/src/x.rs"})),
            "/src/x.rs"
        );
        assert_eq!(pattern_for_rule("WebSearch", &json!({"query": "?"})), "*");
    }

    async fn engine() -> (PermissionEngine, Arc<SessionRegistry>, Arc<RendezvousQueue>, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let rendezvous = Arc::new(RendezvousQueue::new());
        let notifier = Notifier::new();
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            rendezvous.clone(),
            notifier.clone(),
        ));
        registry.register("s1", "/proj/one", None, None).await.unwrap();
        registry.register("s2", "/proj/two", None, None).await.unwrap();
        let engine = PermissionEngine::new(store.clone(), registry.clone(), rendezvous.clone(), notifier);
        (engine, registry, rendezvous, store)
    }

    #[tokio::test]
    async fn resolution_order_session_deny_beats_global_allow() {
        let (engine, _reg, _rdv, store) = engine().await;
        store
            .add_rule("Execute".into(), "*".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();
        store
            .add_rule("Execute".into(), "rm *".into(), "deny".into(), "session".into(), Some("s1".into()))
            .await
            .unwrap();

        let deny = engine
            .check("s1", "Execute", &json!({"command": "rm -rf /"}))
            .await
            .unwrap();
        assert_eq!(deny, Decision::Deny);

        let allow = engine
            .check("s1", "Execute", &json!({"command": "ls"}))
            .await
            .unwrap();
        assert_eq!(allow, Decision::Allow);

        // The session rule does not leak into other sessions.
        let other = engine
            .check("s2", "Execute", &json!({"command": "rm -rf /"}))
            .await
            .unwrap();
        assert_eq!(other, Decision::Allow);
    }

    #[tokio::test]
    async fn no_rule_means_ask_and_no_audit_row() {
        let (engine, _reg, _rdv, store) = engine().await;
        let out = engine
            .check("s1", "Execute", &json!({"command": "cargo build"}))
            .await
            .unwrap();
        assert_eq!(out, Decision::Ask);
        assert!(store.permission_history(Some("s1".into()), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_hit_writes_auto_audit_row() {
        let (engine, _reg, _rdv, store) = engine().await;
        store
            .add_rule("Execute".into(), "npm *".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();
        engine
            .check("s1", "Execute", &json!({"command": "npm test"}))
            .await
            .unwrap();

        let history = store.permission_history(Some("s1".into()), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, "approved");
        assert_eq!(history[0].decided_by.as_deref(), Some("auto"));
    }

    #[tokio::test]
    async fn unknown_tool_only_matches_catch_all() {
        let (engine, _reg, _rdv, store) = engine().await;
        store
            .add_rule("WebSearch".into(), "rust*".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();
        let out = engine
            .check("s1", "WebSearch", &json!({"query": "rust glob"}))
            .await
            .unwrap();
        assert_eq!(out, Decision::Ask, "non-* pattern never matches unknown tools");

        store
            .add_rule("WebSearch".into(), "*".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();
        let out = engine
            .check("s1", "WebSearch", &json!({"query": "rust glob"}))
            .await
            .unwrap();
        assert_eq!(out, Decision::Allow);
    }

    #[tokio::test]
    async fn same_specificity_recency_wins() {
        let (engine, _reg, _rdv, store) = engine().await;
        store
            .add_rule("Execute".into(), "npm *".into(), "allow".into(), "global".into(), None)
            .await
            .unwrap();
        store
            .add_rule("Execute".into(), "npm *".into(), "deny".into(), "global".into(), None)
            .await
            .unwrap();
        let out = engine
            .check("s1", "Execute", &json!({"command": "npm test"}))
            .await
            .unwrap();
        assert_eq!(out, Decision::Deny);
    }

    #[tokio::test]
    async fn resolve_materialises_rule_and_unblocks_waiter() {
        let (engine, registry, rendezvous, store) = engine().await;

        let mut req = PendingRequest::new(NotificationType::Permission, "allow rm?");
        req.tool_name = Some("Execute".into());
        req.tool_input = Some(json!({"command": "rm -rf build"}));
        let req_id = req.id.clone();
        registry.set_pending_request("s1", Some(req)).await.unwrap();

        let rdv = rendezvous.clone();
        let rid = req_id.clone();
        let wait = tokio::spawn(async move {
            rdv.wait_for_response("s1", &rid, std::time::Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let row = engine
            .resolve("s1", &req_id, true, Some(RuleScope::Global), DecidedBy::Bot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.decision, "approved_global");
        assert_eq!(
            wait.await.unwrap(),
            crate::rendezvous::WaitResult::Response("approve".into())
        );

        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "rm -rf build");
        assert_eq!(rules[0].scope, "global");

        // Pending request is cleared.
        let s = registry.get("s1").await.unwrap().unwrap();
        assert!(s.pending_request.is_none());
    }
}

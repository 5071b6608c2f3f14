// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The task executor: spawn the headless Agent, stream its activity,
//! deliver a final result, remember the Agent-assigned session id.
//!
//! # Spawn
//!
//! ```text
//! <agent_bin> exec [--model M] [--reasoning-effort E] [--auto LEVEL]
//!             [--session-id ID] --cwd DIR --output-format json|stream-json
//!             PROMPT
//! ```
//!
//! The child runs with the project directory as CWD and `AGENT_EXEC_MODE=1`
//! in its environment so the Agent's own hooks exit immediately instead of
//! re-entering the rendezvous path.
//!
//! # Cancellation
//!
//! Unconditional kill. A graceful TERM regularly took 30+ seconds when the
//! child was blocked inside a model call, so nobody waits for it anymore.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_core::events::{BridgeEvent, Notifier};
use tether_store::{NewTaskSession, Store};

use crate::activity::classify_line;
use crate::output::{parse_result_output, parse_stream_line, CompletionEvent, StreamLine};

/// Persisted results are capped; full output still reaches the caller.
const RESULT_PERSIST_LIMIT: usize = 5000;

/// One task to run against the headless Agent.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Caller-supplied id (for cancellation tracking); generated if absent.
    pub task_id: Option<String>,
    pub prompt: String,
    pub project_dir: String,
    /// Explicit session to continue. When absent, the continuation map for
    /// the project directory is consulted.
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub autonomy_level: Option<String>,
    pub source: String,
    /// `stream-json` line events instead of a single result object.
    pub streaming: bool,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>, project_dir: impl Into<String>) -> Self {
        Self {
            task_id: None,
            prompt: prompt.into(),
            project_dir: project_dir.into(),
            session_id: None,
            model: None,
            reasoning_effort: None,
            autonomy_level: None,
            source: "api".to_string(),
            streaming: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub result: String,
    pub session_id: Option<String>,
    pub duration_ms: i64,
    pub num_turns: i64,
    pub error: Option<String>,
    pub cancelled: bool,
}

pub struct TaskExecutor {
    store: Store,
    notifier: Notifier,
    agent_bin: String,
    /// project_dir → last Agent-assigned session id. Write-on-completion.
    session_map: Mutex<HashMap<String, String>>,
    /// task_id → kill switch for the supervisor.
    running: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl TaskExecutor {
    pub fn new(store: Store, notifier: Notifier, agent_bin: String) -> Self {
        Self {
            store,
            notifier,
            agent_bin,
            session_map: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    // ── Session continuation map ──────────────────────────────────────────────

    pub fn get_session_id(&self, project_dir: &str) -> Option<String> {
        self.session_map
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(project_dir)
            .cloned()
    }

    /// Drop the continuation mapping — the next task starts fresh.
    pub fn clear_session(&self, project_dir: &str) -> bool {
        let removed = self
            .session_map
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(project_dir);
        if let Some(old) = &removed {
            info!(project_dir, session_id = %old, "cleared continuation mapping");
        }
        removed.is_some()
    }

    fn remember_session(&self, project_dir: &str, session_id: &str) {
        self.session_map
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(project_dir.to_string(), session_id.to_string());
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Fire-and-forget: returns the task id immediately; progress and the
    /// result arrive as events.
    pub fn spawn(self: &Arc<Self>, request: TaskRequest) -> String {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = TaskRequest {
            task_id: Some(task_id.clone()),
            ..request
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.run(request).await;
        });
        task_id
    }

    /// Run a task to completion. Never panics; failures surface in the
    /// outcome and the `tasks` row.
    pub async fn run(&self, request: TaskRequest) -> TaskOutcome {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Continue the project's last session unless the caller pinned one.
        let session_id = request.session_id.clone().or_else(|| {
            let mapped = self.get_session_id(&request.project_dir);
            if let Some(ref id) = mapped {
                info!(project_dir = %request.project_dir, session_id = %id, "continuing session");
            }
            mapped
        });

        if let Err(e) = self
            .store
            .create_task(
                task_id.clone(),
                session_id.clone(),
                request.prompt.clone(),
                request.project_dir.clone(),
                request.model.clone(),
                request.source.clone(),
            )
            .await
        {
            // The run is still worth attempting; only the audit suffers.
            error!(task_id, "failed to log task: {e}");
        }

        self.notifier.emit(BridgeEvent::TaskStarted {
            task_id: task_id.clone(),
            session_id: session_id.clone(),
            project_dir: request.project_dir.clone(),
            prompt: request.prompt.clone(),
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id.clone(), kill_tx);

        let started = Instant::now();
        let outcome = self
            .drive_child(&task_id, &request, session_id.as_deref(), kill_rx, started)
            .await;

        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_id);

        if let Some(ref sid) = outcome.session_id {
            self.remember_session(&request.project_dir, sid);
        }

        self.persist_outcome(&request, &outcome).await;

        if outcome.cancelled {
            self.notifier.emit(BridgeEvent::TaskCancelled {
                task_id: task_id.clone(),
            });
        } else {
            self.notifier.emit(BridgeEvent::TaskCompleted {
                task_id: task_id.clone(),
                success: outcome.success,
                result: outcome.result.chars().take(500).collect(),
                session_id: outcome.session_id.clone(),
                duration_ms: outcome.duration_ms,
                num_turns: outcome.num_turns,
                error: outcome.error.clone(),
            });
        }
        if let Some(ref sid) = outcome.session_id {
            self.notifier.emit(BridgeEvent::ChatUpdated {
                session_id: sid.clone(),
            });
        }

        outcome
    }

    /// Immediate kill. Returns false when the task is unknown or already
    /// terminal (no-op).
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let kill = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(task_id);
        match kill {
            Some(tx) => {
                info!(task_id, "cancelling task (hard kill)");
                tx.send(()).is_ok()
            }
            None => false,
        }
    }

    async fn drive_child(
        &self,
        task_id: &str,
        request: &TaskRequest,
        session_id: Option<&str>,
        mut kill_rx: oneshot::Receiver<()>,
        started: Instant,
    ) -> TaskOutcome {
        let mut cmd = Command::new(&self.agent_bin);
        cmd.arg("exec");
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(effort) = &request.reasoning_effort {
            cmd.arg("--reasoning-effort").arg(effort);
        }
        if let Some(level) = &request.autonomy_level {
            cmd.arg("--auto").arg(level);
        }
        if let Some(sid) = session_id {
            cmd.arg("--session-id").arg(sid);
        }
        cmd.arg("--cwd").arg(&request.project_dir);
        cmd.arg("--output-format")
            .arg(if request.streaming { "stream-json" } else { "json" });
        cmd.arg(&request.prompt);

        cmd.current_dir(&request.project_dir);
        cmd.env("AGENT_EXEC_MODE", "1");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // SIGKILL the child if this future is dropped mid-flight.
        cmd.kill_on_drop(true);
        // Detach from any controlling terminal.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        info!(task_id, agent = %self.agent_bin, project_dir = %request.project_dir, "spawning agent");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(task_id, "failed to spawn agent: {e}");
                return TaskOutcome {
                    task_id: task_id.to_string(),
                    success: false,
                    result: String::new(),
                    session_id: None,
                    duration_ms: started.elapsed().as_millis() as i64,
                    num_turns: 0,
                    error: Some(format!("failed to spawn agent: {e}")),
                    cancelled: false,
                };
            }
        };

        // Two concurrent readers, joined below.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(Self::read_stderr(
            stderr,
            self.notifier.clone(),
            task_id.to_string(),
        ));

        let stdout = child.stdout.take();
        let stdout_task = if request.streaming {
            tokio::spawn(Self::read_stream_stdout(
                stdout,
                self.notifier.clone(),
                task_id.to_string(),
            ))
        } else {
            tokio::spawn(Self::read_json_stdout(stdout))
        };

        let status = tokio::select! {
            _ = &mut kill_rx => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
            status = child.wait() => Some(status),
        };

        let collected = stdout_task.await.unwrap_or(Collected::Json(String::new()));
        let stderr_text = stderr_task.await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as i64;

        let status = match status {
            None => {
                return TaskOutcome {
                    task_id: task_id.to_string(),
                    success: false,
                    result: String::new(),
                    session_id: None,
                    duration_ms,
                    num_turns: 0,
                    error: Some("Task cancelled".to_string()),
                    cancelled: true,
                };
            }
            Some(Err(e)) => {
                return TaskOutcome {
                    task_id: task_id.to_string(),
                    success: false,
                    result: String::new(),
                    session_id: None,
                    duration_ms,
                    num_turns: 0,
                    error: Some(format!("failed to reap agent: {e}")),
                    cancelled: false,
                };
            }
            Some(Ok(status)) => status,
        };

        let exit_ok = status.success();
        debug!(task_id, code = status.code(), "agent exited");
        if !stderr_text.is_empty() {
            warn!(task_id, "agent stderr: {}", truncate(&stderr_text, 500));
        }

        match collected {
            Collected::Json(raw) => match parse_result_output(&raw) {
                Some(out) => TaskOutcome {
                    task_id: task_id.to_string(),
                    success: exit_ok && !out.is_error,
                    result: out.result,
                    session_id: out.session_id,
                    duration_ms: if out.duration_ms > 0 { out.duration_ms } else { duration_ms },
                    num_turns: out.num_turns,
                    error: if exit_ok && !out.is_error {
                        None
                    } else {
                        Some(non_empty(&stderr_text).unwrap_or("agent reported error").to_string())
                    },
                    cancelled: false,
                },
                None if raw.trim().is_empty() => TaskOutcome {
                    task_id: task_id.to_string(),
                    success: false,
                    result: String::new(),
                    session_id: None,
                    duration_ms,
                    num_turns: 0,
                    error: Some(
                        non_empty(&stderr_text)
                            .unwrap_or("no output from agent")
                            .to_string(),
                    ),
                    cancelled: false,
                },
                None => {
                    // Text fallback: the Agent ran without structured output.
                    let (result, session_id) = extract_text_result(&raw);
                    TaskOutcome {
                        task_id: task_id.to_string(),
                        success: exit_ok,
                        result,
                        session_id,
                        duration_ms,
                        num_turns: 0,
                        error: if exit_ok {
                            None
                        } else {
                            non_empty(&stderr_text).map(str::to_string)
                        },
                        cancelled: false,
                    }
                }
            },
            Collected::Stream(completion) => match completion {
                Some(done) => TaskOutcome {
                    task_id: task_id.to_string(),
                    success: exit_ok,
                    result: done.final_text,
                    session_id: done.session_id,
                    duration_ms: if done.duration_ms > 0 { done.duration_ms } else { duration_ms },
                    num_turns: done.num_turns,
                    error: if exit_ok { None } else { non_empty(&stderr_text).map(str::to_string) },
                    cancelled: false,
                },
                None => TaskOutcome {
                    task_id: task_id.to_string(),
                    success: exit_ok,
                    result: String::new(),
                    session_id: None,
                    duration_ms,
                    num_turns: 0,
                    error: if exit_ok {
                        None
                    } else {
                        Some(
                            non_empty(&stderr_text)
                                .unwrap_or("stream ended without completion event")
                                .to_string(),
                        )
                    },
                    cancelled: false,
                },
            },
        }
    }

    async fn read_stderr(
        stderr: Option<tokio::process::ChildStderr>,
        notifier: Notifier,
        task_id: String,
    ) -> String {
        let Some(stderr) = stderr else {
            return String::new();
        };
        let mut lines = BufReader::new(stderr).lines();
        let mut all = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if !all.is_empty() {
                all.push('\n');
            }
            all.push_str(&line);
            if let Some(activity) = classify_line(&line) {
                notifier.emit(BridgeEvent::TaskActivity {
                    task_id: task_id.clone(),
                    activity,
                });
            }
        }
        all
    }

    async fn read_json_stdout(stdout: Option<tokio::process::ChildStdout>) -> Collected {
        let Some(mut stdout) = stdout else {
            return Collected::Json(String::new());
        };
        let mut raw = String::new();
        let _ = stdout.read_to_string(&mut raw).await;
        Collected::Json(raw)
    }

    async fn read_stream_stdout(
        stdout: Option<tokio::process::ChildStdout>,
        notifier: Notifier,
        task_id: String,
    ) -> Collected {
        let Some(stdout) = stdout else {
            return Collected::Stream(None);
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut completion = None;
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_stream_line(&line) {
                Some(StreamLine::Completion(done)) => {
                    notifier.emit(BridgeEvent::TaskActivity {
                        task_id: task_id.clone(),
                        activity: serde_json::json!({"type": "completion"}),
                    });
                    completion = Some(done);
                }
                Some(StreamLine::Event(event)) => {
                    notifier.emit(BridgeEvent::TaskActivity {
                        task_id: task_id.clone(),
                        activity: event,
                    });
                }
                Some(StreamLine::Raw(text)) => {
                    notifier.emit(BridgeEvent::TaskActivity {
                        task_id: task_id.clone(),
                        activity: serde_json::json!({"type": "raw", "content": text}),
                    });
                }
                None => {}
            }
        }
        Collected::Stream(completion)
    }

    async fn persist_outcome(&self, request: &TaskRequest, outcome: &TaskOutcome) {
        let new_session = outcome.session_id.as_ref().map(|sid| NewTaskSession {
            session_id: sid.clone(),
            name: Path::new(&request.project_dir)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "task".to_string()),
            project_dir: request.project_dir.clone(),
            prompt: request.prompt.clone(),
            result: truncate(&outcome.result, RESULT_PERSIST_LIMIT).to_string(),
            source: request.source.clone(),
        });

        if let Err(e) = self
            .store
            .complete_task(
                outcome.task_id.clone(),
                outcome.success,
                Some(truncate(&outcome.result, RESULT_PERSIST_LIMIT).to_string()),
                outcome.duration_ms,
                outcome.num_turns,
                outcome.error.clone(),
                outcome.session_id.clone(),
                new_session,
            )
            .await
        {
            error!(task_id = %outcome.task_id, "failed to persist task outcome: {e}");
        }
    }
}

enum Collected {
    Json(String),
    Stream(Option<CompletionEvent>),
}

fn truncate(s: &str, limit: usize) -> &str {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let t = s.trim();
    (!t.is_empty()).then_some(t)
}

/// Salvage a result from unstructured text output: prefer the `# Answer`
/// section, otherwise the trailing non-activity block. The session id, when
/// present, is narrated as `Session: <uuid>`.
fn extract_text_result(raw: &str) -> (String, Option<String>) {
    static SESSION_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let session_re = SESSION_RE
        .get_or_init(|| Regex::new(r"[Ss]ession[:\s]+([0-9a-fA-F-]{36})").unwrap());
    let session_id = session_re
        .captures(raw)
        .map(|caps| caps[1].to_string());

    let mut answer: Vec<&str> = Vec::new();
    let mut in_answer = false;
    for line in raw.lines() {
        if line.contains("# Answer") || line.trim_start().starts_with("Answer:") {
            in_answer = true;
            continue;
        }
        if in_answer {
            answer.push(line);
        }
    }
    if !answer.is_empty() {
        return (answer.join("\n").trim().to_string(), session_id);
    }

    // No answer marker: take trailing lines up to the last tool-activity line.
    let mut tail: Vec<&str> = Vec::new();
    for line in raw.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('[') && trimmed[..trimmed.len().min(20)].contains(']') {
            break;
        }
        tail.insert(0, trimmed);
    }
    let result = if tail.is_empty() {
        raw.trim().to_string()
    } else {
        tail.join("\n")
    };
    (result, session_id)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

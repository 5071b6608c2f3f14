// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The response rendezvous — where a blocked Agent hook meets a human
//! answer that may arrive minutes later, from either surface.
//!
//! A hook's `wait` suspends on a oneshot channel keyed by
//! `(session_id, request_id)`. A `deliver` completes the matching waiter,
//! or — when nobody is waiting yet — parks the response so the next
//! matching wait returns immediately (early answers are not lost).
//!
//! Contract highlights:
//! - at most one result per key, to at most one waiter
//! - within a session, an unkeyed deliver goes to the **oldest** waiter
//! - a second wait on the same key supersedes the first (which resolves
//!   [`WaitResult::Cancelled`])
//! - timeout and cancellation are distinct outcomes: permission callers
//!   fail closed on timeout but fail open on shutdown-cancel
//! - `deliver` never fails; an unmatched response is parked
//! - session deletion purges both waiters and parks

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Park-map key for responses delivered without a request id.
const LATEST: &str = "_latest";

/// Outcome of a [`RendezvousQueue::wait_for_response`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Response(String),
    Timeout,
    Cancelled,
}

impl WaitResult {
    pub fn response(self) -> Option<String> {
        match self {
            Self::Response(text) => Some(text),
            _ => None,
        }
    }
}

enum WaitSignal {
    Response(String),
    Cancelled,
}

struct Waiter {
    request_id: String,
    tx: oneshot::Sender<WaitSignal>,
}

#[derive(Default)]
struct Inner {
    /// session_id → waiters in arrival order (oldest first).
    waits: HashMap<String, Vec<Waiter>>,
    /// session_id → request_id (or `_latest`) → parked response.
    parked: HashMap<String, HashMap<String, String>>,
}

/// See module docs.
#[derive(Default)]
pub struct RendezvousQueue {
    inner: Mutex<Inner>,
}

impl RendezvousQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until a response for `(session_id, request_id)` arrives or
    /// `timeout` elapses. A parked response returns immediately. A timeout
    /// of zero only ever consumes a park.
    pub async fn wait_for_response(
        &self,
        session_id: &str,
        request_id: &str,
        timeout: Duration,
    ) -> WaitResult {
        let rx = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

            // Early answers first: exact key, then the unkeyed slot.
            if let Some(parks) = inner.parked.get_mut(session_id) {
                let hit = parks
                    .remove(request_id)
                    .or_else(|| parks.remove(LATEST));
                if parks.is_empty() {
                    inner.parked.remove(session_id);
                }
                if let Some(text) = hit {
                    debug!(session_id, request_id, "returning parked response");
                    return WaitResult::Response(text);
                }
            }

            let waiters = inner.waits.entry(session_id.to_string()).or_default();

            // Two waiters on one key are disallowed; the newcomer wins.
            if let Some(pos) = waiters.iter().position(|w| w.request_id == request_id) {
                let old = waiters.remove(pos);
                warn!(session_id, request_id, "superseding existing waiter");
                let _ = old.tx.send(WaitSignal::Cancelled);
            }

            let (tx, rx) = oneshot::channel();
            waiters.push(Waiter {
                request_id: request_id.to_string(),
                tx,
            });
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaitSignal::Response(text))) => {
                info!(session_id, request_id, "response received");
                WaitResult::Response(text)
            }
            Ok(Ok(WaitSignal::Cancelled)) | Ok(Err(_)) => WaitResult::Cancelled,
            Err(_) => {
                // Cooperative timeout: free the slot. A deliver racing this
                // removal already consumed the waiter and the response is
                // dropped with the receiver — same as a response that
                // arrives a millisecond later.
                self.remove_waiter(session_id, request_id);
                warn!(session_id, request_id, "wait timed out");
                WaitResult::Timeout
            }
        }
    }

    /// Complete a waiter, or park the response for later pickup. Returns
    /// true when a live waiter was completed.
    pub fn deliver_response(
        &self,
        session_id: &str,
        request_id: Option<&str>,
        response: impl Into<String>,
    ) -> bool {
        let response = response.into();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(waiters) = inner.waits.get_mut(session_id) {
            let pos = match request_id {
                Some(rid) => waiters.iter().position(|w| w.request_id == rid),
                // Oldest pending waiter for the session.
                None if !waiters.is_empty() => Some(0),
                None => None,
            };
            if let Some(pos) = pos {
                let waiter = waiters.remove(pos);
                if waiters.is_empty() {
                    inner.waits.remove(session_id);
                }
                info!(session_id, request_id = %waiter.request_id, "delivering response");
                return waiter.tx.send(WaitSignal::Response(response)).is_ok();
            }
        }

        let key = request_id.unwrap_or(LATEST).to_string();
        debug!(session_id, key = %key, "no waiter; parking response");
        inner
            .parked
            .entry(session_id.to_string())
            .or_default()
            .insert(key, response);
        false
    }

    /// Non-blocking park lookup (the `GET .../response/{request_id}` path).
    pub fn take_parked(&self, session_id: &str, request_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let parks = inner.parked.get_mut(session_id)?;
        let hit = parks.remove(request_id);
        if parks.is_empty() {
            inner.parked.remove(session_id);
        }
        hit
    }

    pub fn has_pending_waits(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.waits.get(session_id).is_some_and(|w| !w.is_empty())
    }

    /// Cancel one specific waiter (a superseded pending request).
    pub fn cancel_request(&self, session_id: &str, request_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(waiters) = inner.waits.get_mut(session_id) {
            if let Some(pos) = waiters.iter().position(|w| w.request_id == request_id) {
                let old = waiters.remove(pos);
                let _ = old.tx.send(WaitSignal::Cancelled);
            }
            if waiters.is_empty() {
                inner.waits.remove(session_id);
            }
        }
    }

    /// Cancel every waiter for a session. Parks are left in place — use
    /// [`RendezvousQueue::purge_session`] when the session goes away.
    pub fn cancel_all_waits(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(waiters) = inner.waits.remove(session_id) {
            info!(session_id, count = waiters.len(), "cancelling all waits");
            for waiter in waiters {
                let _ = waiter.tx.send(WaitSignal::Cancelled);
            }
        }
    }

    /// Session deletion: cancel waiters and drop parked responses so a
    /// removed session cannot pin memory forever.
    pub fn purge_session(&self, session_id: &str) {
        self.cancel_all_waits(session_id);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.parked.remove(session_id);
    }

    fn remove_waiter(&self, session_id: &str, request_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(waiters) = inner.waits.get_mut(session_id) {
            waiters.retain(|w| w.request_id != request_id);
            if waiters.is_empty() {
                inner.waits.remove(session_id);
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn deliver_completes_a_blocked_waiter() {
        let q = Arc::new(RendezvousQueue::new());
        let q2 = q.clone();
        let wait = tokio::spawn(async move {
            q2.wait_for_response("s1", "r1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(q.deliver_response("s1", Some("r1"), "approve"));
        assert_eq!(wait.await.unwrap(), WaitResult::Response("approve".into()));
    }

    #[tokio::test]
    async fn early_delivery_is_parked_and_returned_without_suspension() {
        let q = RendezvousQueue::new();
        assert!(!q.deliver_response("s1", Some("r1"), "yes"));
        let out = q.wait_for_response("s1", "r1", Duration::from_secs(5)).await;
        assert_eq!(out, WaitResult::Response("yes".into()));
    }

    #[tokio::test]
    async fn unkeyed_park_satisfies_next_wait() {
        let q = RendezvousQueue::new();
        q.deliver_response("s1", None, "go ahead");
        let out = q.wait_for_response("s1", "some-request", Duration::ZERO).await;
        assert_eq!(out, WaitResult::Response("go ahead".into()));
    }

    #[tokio::test]
    async fn zero_timeout_returns_timeout_without_park() {
        let q = RendezvousQueue::new();
        let out = q.wait_for_response("s1", "r1", Duration::ZERO).await;
        assert_eq!(out, WaitResult::Timeout);
        assert!(!q.has_pending_waits("s1"));
    }

    #[tokio::test]
    async fn unkeyed_deliver_goes_to_the_oldest_waiter() {
        let q = Arc::new(RendezvousQueue::new());
        let q1 = q.clone();
        let first = tokio::spawn(async move {
            q1.wait_for_response("s1", "old", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let q2 = q.clone();
        let second = tokio::spawn(async move {
            q2.wait_for_response("s1", "new", Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.deliver_response("s1", None, "answer");
        assert_eq!(first.await.unwrap(), WaitResult::Response("answer".into()));
        // The newer waiter is untouched and times out on its own.
        assert_eq!(second.await.unwrap(), WaitResult::Timeout);
    }

    #[tokio::test]
    async fn second_wait_on_same_key_supersedes_first() {
        let q = Arc::new(RendezvousQueue::new());
        let q1 = q.clone();
        let first = tokio::spawn(async move {
            q1.wait_for_response("s1", "r1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let q2 = q.clone();
        let second = tokio::spawn(async move {
            q2.wait_for_response("s1", "r1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(first.await.unwrap(), WaitResult::Cancelled);
        q.deliver_response("s1", Some("r1"), "ok");
        assert_eq!(second.await.unwrap(), WaitResult::Response("ok".into()));
    }

    #[tokio::test]
    async fn cancel_is_distinct_from_timeout() {
        let q = Arc::new(RendezvousQueue::new());
        let q1 = q.clone();
        let wait = tokio::spawn(async move {
            q1.wait_for_response("s1", "r1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.cancel_all_waits("s1");
        assert_eq!(wait.await.unwrap(), WaitResult::Cancelled);
    }

    #[tokio::test]
    async fn late_delivery_after_timeout_parks() {
        let q = RendezvousQueue::new();
        let out = q
            .wait_for_response("s1", "r1", Duration::from_millis(10))
            .await;
        assert_eq!(out, WaitResult::Timeout);

        q.deliver_response("s1", Some("r1"), "too late");
        assert_eq!(q.take_parked("s1", "r1"), Some("too late".into()));
        assert_eq!(q.take_parked("s1", "r1"), None);
    }

    #[tokio::test]
    async fn purge_drops_parks_and_cancels_waits() {
        let q = Arc::new(RendezvousQueue::new());
        q.deliver_response("s1", Some("r0"), "stale");
        let q1 = q.clone();
        let wait = tokio::spawn(async move {
            q1.wait_for_response("s1", "r1", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.purge_session("s1");
        assert_eq!(wait.await.unwrap(), WaitResult::Cancelled);
        assert_eq!(q.take_parked("s1", "r0"), None);
    }

    #[tokio::test]
    async fn sessions_do_not_interfere() {
        let q = RendezvousQueue::new();
        q.deliver_response("s1", Some("r1"), "for-s1");
        let out = q.wait_for_response("s2", "r1", Duration::ZERO).await;
        assert_eq!(out, WaitResult::Timeout);
    }
}

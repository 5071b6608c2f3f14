// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scenarios over the bridge core: registry, rendezvous queue
/// and permission engine wired together the way the server wires them.
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tether_core::{
    BridgeEvent, ControlState, DecidedBy, Notifier, NotificationType, PendingRequest,
    PermissionEngine, RendezvousQueue, SessionRegistry, WaitResult,
};
use tether_store::Store;

struct Bridge {
    registry: Arc<SessionRegistry>,
    rendezvous: Arc<RendezvousQueue>,
    engine: Arc<PermissionEngine>,
    notifier: Notifier,
    store: Store,
}

async fn bridge() -> Bridge {
    let store = Store::open_in_memory().await.unwrap();
    let notifier = Notifier::new();
    let rendezvous = Arc::new(RendezvousQueue::new());
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        rendezvous.clone(),
        notifier.clone(),
    ));
    let engine = Arc::new(PermissionEngine::new(
        store.clone(),
        registry.clone(),
        rendezvous.clone(),
        notifier.clone(),
    ));
    Bridge {
        registry,
        rendezvous,
        engine,
        notifier,
        store,
    }
}

/// A hook asks for permission, the operator approves from the bot surface:
/// the blocked wait resolves to "approve", the audit row names the bot, and
/// `permission_resolved` goes out to the surfaces.
#[tokio::test]
async fn permission_approved_via_bot() {
    let b = bridge().await;
    b.registry.register("S1", "/proj/app", None, None).await.unwrap();

    let mut req = PendingRequest::new(NotificationType::Permission, "Run `rm -rf build`?");
    req.tool_name = Some("Execute".into());
    req.tool_input = Some(json!({"command": "rm -rf build"}));
    let request_id = req.id.clone();
    b.registry.set_pending_request("S1", Some(req)).await.unwrap();

    let mut events = b.notifier.subscribe();

    let rendezvous = b.rendezvous.clone();
    let rid = request_id.clone();
    let wait = tokio::spawn(async move {
        rendezvous
            .wait_for_response("S1", &rid, Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    b.engine
        .resolve("S1", &request_id, true, None, DecidedBy::Bot)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(wait.await.unwrap(), WaitResult::Response("approve".into()));

    let audit = b.store.get_permission_request(&request_id).await.unwrap().unwrap();
    assert_eq!(audit.decision, "approved");
    assert_eq!(audit.decided_by.as_deref(), Some("bot"));

    let mut saw_resolved = false;
    while let Ok(event) = events.try_recv() {
        if let BridgeEvent::PermissionResolved { decision, .. } = event {
            assert_eq!(decision, "approved");
            saw_resolved = true;
        }
    }
    assert!(saw_resolved, "permission_resolved must be broadcast");
}

/// Nobody answers: the wait times out, the hook denies on its side, and the
/// audit trail records a denial.
#[tokio::test]
async fn permission_denied_by_timeout() {
    let b = bridge().await;
    b.registry.register("S1", "/proj/app", None, None).await.unwrap();

    let mut req = PendingRequest::new(NotificationType::Permission, "allow?");
    req.tool_name = Some("Execute".into());
    req.tool_input = Some(json!({"command": "rm -rf /"}));
    let request_id = req.id.clone();
    b.registry.set_pending_request("S1", Some(req)).await.unwrap();

    let outcome = b
        .rendezvous
        .wait_for_response("S1", &request_id, Duration::from_millis(50))
        .await;
    assert_eq!(outcome, WaitResult::Timeout);

    b.engine.record_timeout(&request_id).await.unwrap();
    let audit = b.store.get_permission_request(&request_id).await.unwrap().unwrap();
    assert_eq!(audit.decision, "denied");
    assert_eq!(audit.decided_by.as_deref(), Some("auto"));
}

/// Messages queue while the CLI holds control, and the full handoff walk
/// (stop point → handoff → process → release) follows the transition table.
#[tokio::test]
async fn queueing_and_handoff_walk() {
    let b = bridge().await;
    b.registry.register("S1", "/proj/app", None, None).await.unwrap();

    // CLI holds the session: incoming work queues.
    assert!(b.registry.should_queue_message("S1").await.unwrap());
    b.registry
        .queue_message("S1", "fix the tests".into(), "web".into())
        .await
        .unwrap();
    assert_eq!(b.registry.get_queue_count("S1").await.unwrap(), 1);
    assert!(!b.registry.can_execute_remote_task("S1").await.unwrap());

    // Stop hook fires → cli_waiting; operator takes over → remote_active.
    b.registry.set_cli_waiting("S1").await.unwrap().unwrap();
    let s = b.registry.handoff_to_remote("S1").await.unwrap().unwrap();
    assert_eq!(s.control_state, ControlState::RemoteActive);
    assert!(b.registry.can_execute_remote_task("S1").await.unwrap());

    // The queued message is popped FIFO and marked sent.
    let next = b.registry.get_next_queued_message("S1").await.unwrap().unwrap();
    assert_eq!(next.content, "fix the tests");
    assert!(b.registry.mark_message_sent("S1", next.id).await.unwrap());
    assert_eq!(b.registry.get_queue_count("S1").await.unwrap(), 0);

    // Release hands the session back; remote execution is refused again.
    b.registry.release_to_cli("S1").await.unwrap().unwrap();
    assert!(!b.registry.can_execute_remote_task("S1").await.unwrap());
}

/// Scenario 6 from the acceptance list: rule resolution order.
#[tokio::test]
async fn rule_resolution_order() {
    let b = bridge().await;
    b.registry.register("S1", "/proj/one", None, None).await.unwrap();
    b.registry.register("S2", "/proj/two", None, None).await.unwrap();

    b.store
        .add_rule("Execute".into(), "*".into(), "allow".into(), "global".into(), None)
        .await
        .unwrap();
    b.store
        .add_rule(
            "Execute".into(),
            "rm *".into(),
            "deny".into(),
            "session".into(),
            Some("S1".into()),
        )
        .await
        .unwrap();

    let check = |sid: &'static str, cmd: &'static str| {
        let engine = b.engine.clone();
        async move {
            engine
                .check(sid, "Execute", &json!({ "command": cmd }))
                .await
                .unwrap()
        }
    };

    assert_eq!(check("S1", "rm -rf /").await, tether_core::Decision::Deny);
    assert_eq!(check("S1", "ls").await, tether_core::Decision::Allow);
    assert_eq!(check("S2", "rm -rf /").await, tether_core::Decision::Allow);
}

/// Determinism: the same rule set and input always produce the same answer.
#[tokio::test]
async fn rule_resolution_is_deterministic() {
    let b = bridge().await;
    b.registry.register("S1", "/proj/one", None, None).await.unwrap();
    b.store
        .add_rule("Execute".into(), "npm *".into(), "allow".into(), "global".into(), None)
        .await
        .unwrap();

    for _ in 0..5 {
        let out = b
            .engine
            .check("S1", "Execute", &json!({"command": "npm test"}))
            .await
            .unwrap();
        assert_eq!(out, tether_core::Decision::Allow);
    }
    let out = b
        .engine
        .check("S1", "Execute", &json!({"command": "npmx test"}))
        .await
        .unwrap();
    assert_eq!(out, tether_core::Decision::Ask, "npm * must not match npmx");
}

/// Three sessions with the same basename get numbered names, and deleting
/// one cascades its dependents while preserving the others.
#[tokio::test]
async fn naming_and_cascade() {
    let b = bridge().await;
    assert_eq!(b.registry.register("a1", "/a/x", None, None).await.unwrap().name, "x");
    assert_eq!(b.registry.register("a2", "/a/x", None, None).await.unwrap().name, "x #2");
    assert_eq!(b.registry.register("a3", "/a/x", None, None).await.unwrap().name, "x #3");

    b.registry
        .queue_message("a2", "queued".into(), "web".into())
        .await
        .unwrap();
    b.rendezvous.deliver_response("a2", Some("r1"), "parked");

    assert!(b.registry.remove("a2").await.unwrap());
    assert!(b.registry.get("a2").await.unwrap().is_none());
    assert_eq!(b.rendezvous.take_parked("a2", "r1"), None);

    // Survivors unaffected; a fresh registration continues the numbering.
    assert!(b.registry.get("a1").await.unwrap().is_some());
    assert_eq!(b.registry.register("a4", "/a/x", None, None).await.unwrap().name, "x #4");
}

/// A waiter notified while a *different* request is pending: the unkeyed
/// delivery goes to the oldest waiter; a keyed one is exact.
#[tokio::test]
async fn delivery_matching_is_exact_then_oldest() {
    let b = bridge().await;
    b.registry.register("S1", "/p", None, None).await.unwrap();

    let rdv = b.rendezvous.clone();
    let w1 = tokio::spawn(async move {
        rdv.wait_for_response("S1", "r-old", Duration::from_secs(5)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let rdv = b.rendezvous.clone();
    let w2 = tokio::spawn(async move {
        rdv.wait_for_response("S1", "r-new", Duration::from_secs(5)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Keyed delivery hits the newer waiter; unkeyed then hits the oldest.
    b.rendezvous.deliver_response("S1", Some("r-new"), "keyed");
    b.rendezvous.deliver_response("S1", None, "oldest");

    assert_eq!(w2.await.unwrap(), WaitResult::Response("keyed".into()));
    assert_eq!(w1.await.unwrap(), WaitResult::Response("oldest".into()));
}

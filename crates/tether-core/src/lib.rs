// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The session-multiplexing core of the bridge.
//!
//! Four pieces, wired together by the server crate:
//!
//! - [`registry::SessionRegistry`] — who exists, who drives each session
//!   (CLI vs. remote), what is queued, what question is outstanding.
//! - [`rendezvous::RendezvousQueue`] — the blocking `notify → wait →
//!   respond` exchange that suspends an Agent hook until a human (or an
//!   auto-policy) answers.
//! - [`permissions::PermissionEngine`] — pattern-matched allow/deny rules
//!   consulted before every tool use, plus the audit trail.
//! - [`events::Notifier`] — the broadcast fan-out every surface subscribes
//!   to. Delivery is best-effort; the database is the source of truth and
//!   surfaces catch up on reconnect.

pub mod events;
pub mod models;
pub mod permissions;
pub mod registry;
pub mod rendezvous;

pub use events::{BridgeEvent, Notifier, SessionView};
pub use models::{
    Button, ControlState, DecidedBy, Decision, MessageSource, NotificationType, PendingRequest,
    RuleScope, RuleType, Session, SessionStatus, TaskStatus,
};
pub use permissions::PermissionEngine;
pub use registry::SessionRegistry;
pub use rendezvous::{RendezvousQueue, WaitResult};

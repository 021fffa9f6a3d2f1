/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Broadcast hub: fan-out of pipeline events to SSE subscribers. Publishing
//! never blocks — a subscriber whose buffer is full is dropped and must
//! reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::TenantId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything dashboards can observe live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageIncoming,
    MessageOutgoing,
    MessageManual,
    MessageStatusChanged,
    ActionCreated,
    ActionResolved,
    ContactPaused,
    ContactResumed,
    QueueFull,
    QuotaExceeded,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageIncoming => "message.incoming",
            Self::MessageOutgoing => "message.outgoing",
            Self::MessageManual => "message.manual",
            Self::MessageStatusChanged => "message.status_changed",
            Self::ActionCreated => "action.created",
            Self::ActionResolved => "action.resolved",
            Self::ContactPaused => "contact.paused",
            Self::ContactResumed => "contact.resumed",
            Self::QueueFull => "queue_full",
            Self::QuotaExceeded => "quota_exceeded",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message.incoming" => Some(Self::MessageIncoming),
            "message.outgoing" => Some(Self::MessageOutgoing),
            "message.manual" => Some(Self::MessageManual),
            "message.status_changed" => Some(Self::MessageStatusChanged),
            "action.created" => Some(Self::ActionCreated),
            "action.resolved" => Some(Self::ActionResolved),
            "contact.paused" => Some(Self::ContactPaused),
            "contact.resumed" => Some(Self::ContactResumed),
            "queue_full" => Some(Self::QueueFull),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            _ => None,
        }
    }
}

/// One published event. `tenant_id` is always present and always matches the
/// entity the payload describes.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    #[serde(skip)]
    pub kind: EventKind,
    pub tenant_id: TenantId,
    pub event: String,
    pub payload: serde_json::Value,
}

impl BroadcastEvent {
    #[must_use]
    pub fn new(kind: EventKind, tenant_id: TenantId, payload: serde_json::Value) -> Self {
        Self {
            kind,
            tenant_id,
            event: kind.as_str().to_string(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Topic filter for one subscriber: a tenant scope (enforced — authorization
/// is supplied out-of-band by the dashboard layer) and an optional event-kind
/// allowlist.
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub tenant_id: Option<TenantId>,
    pub kinds: Option<Vec<EventKind>>,
}

impl SubscriberFilter {
    fn matches(&self, event: &BroadcastEvent) -> bool {
        if let Some(tenant) = self.tenant_id {
            if tenant != event.tenant_id {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    tx: mpsc::Sender<BroadcastEvent>,
    filter: SubscriberFilter,
}

/// Fan-out bus. Bounded per-subscriber buffers; `try_send` only, so slow
/// consumers are shed rather than back-pressuring workers.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    pub connections: AtomicI64,
}

impl BroadcastHub {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            connections: AtomicI64::new(0),
        }
    }

    /// Register a subscriber; returns its id and the event receiver.
    pub fn subscribe(&self, filter: SubscriberFilter) -> (u64, mpsc::Receiver<BroadcastEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, Subscriber { tx, filter });
        }
        self.connections.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, "sse subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber (client disconnected or dropped for overflow).
    pub fn unsubscribe(&self, id: u64) {
        let removed = match self.subscribers.lock() {
            Ok(mut subs) => subs.remove(&id).is_some(),
            Err(_) => false,
        };
        if removed {
            self.connections.fetch_sub(1, Ordering::Relaxed);
            debug!(subscriber = id, "sse subscriber removed");
        }
    }

    /// Publish without blocking. Subscribers whose buffer is full or whose
    /// receiver is gone are dropped on the spot.
    pub fn publish(&self, event: &BroadcastEvent) {
        let mut dead = Vec::new();
        {
            let Ok(subs) = self.subscribers.lock() else {
                return;
            };
            for (id, sub) in subs.iter() {
                if !sub.filter.matches(event) {
                    continue;
                }
                if let Err(e) = sub.tx.try_send(event.clone()) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            warn!(subscriber = id, "sse subscriber overflowed, dropping");
                        }
                        mpsc::error::TrySendError::Closed(_) => {}
                    }
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Per-conversation coalescing. Customers send bursts of short messages; the
//! agent should see one coherent turn, not three racing invocations. State is
//! a sharded map `conversation_key → PendingTurn`; a sweeper loop flushes
//! turns whose (extendable) deadline has passed and hands them to the
//! dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, SubmitOutcome};
use crate::types::{ChatbotId, ContactId, ConversationKey, TenantId, Turn, TurnPiece};

const SHARD_COUNT: usize = 16;
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Seeds and pending state
// ---------------------------------------------------------------------------

/// Routing/identity context for a conversation, resolved at ingress and
/// carried unchanged into the built [`Turn`].
#[derive(Debug, Clone)]
pub struct TurnSeed {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub thread_id: String,
    pub agent_id: String,
    pub from_number: String,
    pub sender_msisdn: String,
    pub language_hint: Option<String>,
}

impl TurnSeed {
    #[must_use]
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.tenant_id, self.contact_id)
    }
}

struct PendingTurn {
    seed: TurnSeed,
    pieces: Vec<TurnPiece>,
    first_instant: Instant,
    deadline: Instant,
}

/// Deadline rule: each message pushes the deadline to `now + window`, but
/// never past `first_arrival + max_span`, and never into the past.
fn next_deadline(now: Instant, first: Instant, window: Duration, max_span: Duration) -> Instant {
    let ceiling = first + max_span;
    let extended = now + window;
    extended.min(ceiling).max(now)
}

/// Newline-join of the agent-visible texts, in receipt order. Associative
/// under receipt order by construction.
fn merged_text(pieces: &[TurnPiece]) -> String {
    pieces
        .iter()
        .filter_map(|p| p.agent_text.as_deref())
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_turn(seed: TurnSeed, pieces: Vec<TurnPiece>) -> Turn {
    let first_arrival = pieces
        .first()
        .map_or_else(chrono::Utc::now, |p| p.received_at);
    let last_arrival = pieces
        .last()
        .map_or_else(chrono::Utc::now, |p| p.received_at);
    Turn {
        tenant_id: seed.tenant_id,
        chatbot_id: seed.chatbot_id,
        contact_id: seed.contact_id,
        thread_id: seed.thread_id,
        agent_id: seed.agent_id,
        from_number: seed.from_number,
        sender_msisdn: seed.sender_msisdn,
        merged_text: merged_text(&pieces),
        pieces,
        first_arrival,
        last_arrival,
        language_hint: seed.language_hint,
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

pub struct Debouncer {
    shards: Vec<Mutex<HashMap<ConversationKey, PendingTurn>>>,
    window: Duration,
    max_span: Duration,
    dispatcher: Arc<Dispatcher>,
}

impl Debouncer {
    #[must_use]
    pub fn new(
        window: Duration,
        floor: Duration,
        max_span: Duration,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            window: window.max(floor),
            max_span,
            dispatcher,
        }
    }

    fn shard(&self, key: &ConversationKey) -> &Mutex<HashMap<ConversationKey, PendingTurn>> {
        &self.shards[key.shard(SHARD_COUNT)]
    }

    /// Number of conversations currently buffering (for /metrics).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().map(|m| m.len()).unwrap_or(0))
            .sum()
    }

    /// Buffer one inbound piece. Coalescing never crosses tenants: the key
    /// embeds the tenant id.
    pub fn ingest(&self, seed: TurnSeed, piece: TurnPiece) {
        let key = seed.conversation_key();
        let now = Instant::now();
        let Ok(mut shard) = self.shard(&key).lock() else {
            warn!(conversation = %key, "debounce shard poisoned, dropping piece");
            return;
        };
        match shard.get_mut(&key) {
            Some(pending) => {
                pending.pieces.push(piece);
                pending.deadline =
                    next_deadline(now, pending.first_instant, self.window, self.max_span);
                debug!(
                    conversation = %key,
                    buffered = pending.pieces.len(),
                    "extended debounce window"
                );
            }
            None => {
                shard.insert(
                    key,
                    PendingTurn {
                        seed,
                        pieces: vec![piece],
                        first_instant: now,
                        deadline: now + self.window,
                    },
                );
            }
        }
    }

    /// Sweeper: flush every pending turn whose deadline has passed. Runs
    /// until shutdown. Turns deferred by single-flight are re-armed as if
    /// fresh messages were still arriving.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            window_ms = self.window.as_millis() as u64,
            max_span_ms = self.max_span.as_millis() as u64,
            "debouncer running"
        );
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep().await,
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal, debouncer stopping");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut due: Vec<PendingTurn> = Vec::new();
        for shard in &self.shards {
            let Ok(mut map) = shard.lock() else { continue };
            let expired: Vec<ConversationKey> = map
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(pending) = map.remove(&key) {
                    due.push(pending);
                }
            }
        }

        for pending in due {
            let key = pending.seed.conversation_key();
            let seed = pending.seed.clone();
            let turn = build_turn(pending.seed, pending.pieces);
            match self.dispatcher.submit(turn).await {
                SubmitOutcome::Queued | SubmitOutcome::Rejected => {}
                SubmitOutcome::Deferred(turn) => {
                    debug!(conversation = %key, "conversation in flight, re-arming turn");
                    self.rearm(key, seed, turn.pieces);
                }
            }
        }
    }

    /// Put pieces back as a fresh pending turn. If newer messages opened a
    /// new pending turn while we were submitting, prepend ours to preserve
    /// receipt order.
    fn rearm(&self, key: ConversationKey, seed: TurnSeed, mut pieces: Vec<TurnPiece>) {
        let now = Instant::now();
        let Ok(mut shard) = self.shard(&key).lock() else {
            return;
        };
        match shard.get_mut(&key) {
            Some(existing) => {
                pieces.append(&mut existing.pieces);
                existing.pieces = pieces;
            }
            None => {
                shard.insert(
                    key,
                    PendingTurn {
                        seed,
                        pieces,
                        first_instant: now,
                        deadline: now + self.window,
                    },
                );
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::dispatch::PipelineGauges;
    use crate::types::MessageKind;
    use tokio::sync::mpsc;

    fn seed(tenant: i64, contact: i64) -> TurnSeed {
        TurnSeed {
            tenant_id: TenantId(tenant),
            chatbot_id: ChatbotId(2),
            contact_id: ContactId(contact),
            thread_id: format!("thread-{tenant}-{contact}"),
            agent_id: "ecla".to_string(),
            from_number: "9613451652".to_string(),
            sender_msisdn: "96179374241".to_string(),
            language_hint: None,
        }
    }

    fn piece(id: &str, text: &str) -> TurnPiece {
        TurnPiece {
            provider_message_id: id.to_string(),
            kind: MessageKind::Text,
            text: Some(text.to_string()),
            agent_text: Some(text.to_string()),
            content_url: None,
            metadata: None,
            received_at: chrono::Utc::now(),
        }
    }

    struct Rig {
        debouncer: Arc<Debouncer>,
        dispatcher: Arc<Dispatcher>,
        rx: mpsc::Receiver<Turn>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn rig(window: Duration, floor: Duration, max_span: Duration) -> Rig {
        let (tx, rx) = mpsc::channel(8);
        let hub = Arc::new(BroadcastHub::new(16));
        let gauges = Arc::new(PipelineGauges::default());
        let dispatcher = Arc::new(Dispatcher::new(
            tx,
            gauges,
            hub,
            Duration::from_millis(50),
        ));
        let debouncer = Arc::new(Debouncer::new(
            window,
            floor,
            max_span,
            Arc::clone(&dispatcher),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&debouncer).run(shutdown_rx));
        Rig {
            debouncer,
            dispatcher,
            rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[test]
    fn test_next_deadline_extends_within_ceiling() {
        let first = Instant::now();
        let window = Duration::from_secs(3);
        let span = Duration::from_secs(10);

        let at_1s = first + Duration::from_secs(1);
        assert_eq!(next_deadline(at_1s, first, window, span), at_1s + window);
    }

    #[test]
    fn test_next_deadline_respects_max_span() {
        let first = Instant::now();
        let window = Duration::from_secs(3);
        let span = Duration::from_secs(10);

        // 9s in: now + 3s would pass the 10s ceiling; clamp to first + 10s.
        let at_9s = first + Duration::from_secs(9);
        assert_eq!(next_deadline(at_9s, first, window, span), first + span);

        // Past the ceiling entirely: never schedule into the past.
        let at_12s = first + Duration::from_secs(12);
        assert_eq!(next_deadline(at_12s, first, window, span), at_12s);
    }

    #[test]
    fn test_merged_text_order_and_blanks() {
        let pieces = vec![piece("1", "hi"), piece("2", "  "), piece("3", "refund please")];
        assert_eq!(merged_text(&pieces), "hi\nrefund please");
    }

    #[test]
    fn test_merge_is_associative_under_receipt_order() {
        let all = vec![piece("1", "m1"), piece("2", "m2"), piece("3", "m3")];
        let tail = merged_text(&all[1..]);
        let head_then_tail = format!("{}\n{tail}", merged_text(&all[..1]));
        assert_eq!(merged_text(&all), head_then_tail);
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_turn() {
        let mut r = rig(
            Duration::from_millis(60),
            Duration::from_millis(10),
            Duration::from_millis(600),
        );

        r.debouncer.ingest(seed(1, 1), piece("a", "hi"));
        tokio::time::sleep(Duration::from_millis(15)).await;
        r.debouncer.ingest(seed(1, 1), piece("b", "are you there"));
        tokio::time::sleep(Duration::from_millis(15)).await;
        r.debouncer
            .ingest(seed(1, 1), piece("c", "actually i want a refund"));

        let turn = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.merged_text, "hi\nare you there\nactually i want a refund");
        assert_eq!(turn.pieces.len(), 3, "one piece per originating record");
        assert!(
            r.rx.try_recv().is_err(),
            "the burst must produce exactly one turn"
        );
        assert_eq!(r.debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_media_coalesces_with_adjacent_text() {
        let mut r = rig(
            Duration::from_millis(30),
            Duration::from_millis(10),
            Duration::from_millis(300),
        );

        r.debouncer.ingest(seed(1, 1), piece("a", "look at this"));
        let mut image = piece("b", "[Customer sent an image]");
        image.kind = MessageKind::Image;
        image.content_url = Some("https://media.example/abc".to_string());
        r.debouncer.ingest(seed(1, 1), image);

        let turn = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.pieces.len(), 2);
        assert_eq!(turn.attachments().len(), 1, "media collected separately");
        assert_eq!(
            turn.merged_text,
            "look at this\n[Customer sent an image]"
        );
    }

    #[tokio::test]
    async fn test_messages_one_ms_apart_merge() {
        let mut r = rig(
            Duration::ZERO, // configured below the floor
            Duration::from_millis(20),
            Duration::from_millis(200),
        );

        r.debouncer.ingest(seed(1, 1), piece("a", "one"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        r.debouncer.ingest(seed(1, 1), piece("b", "two"));

        let turn = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.merged_text, "one\ntwo", "floor must still coalesce");
    }

    #[tokio::test]
    async fn test_coalescing_never_crosses_tenants() {
        let mut r = rig(
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_millis(200),
        );

        r.debouncer.ingest(seed(1, 1), piece("a", "price?"));
        r.debouncer.ingest(seed(7, 2), piece("b", "shipping?"));

        let first = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        let mut tenants = [first.tenant_id.0, second.tenant_id.0];
        tenants.sort_unstable();
        assert_eq!(tenants, [1, 7], "two tenants, two independent turns");
    }

    #[tokio::test]
    async fn test_deferred_turn_waits_for_in_flight_release() {
        let mut r = rig(
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let key = ConversationKey::new(TenantId(1), ContactId(1));
        assert!(r.dispatcher.in_flight().claim(key), "simulate a busy worker");

        r.debouncer.ingest(seed(1, 1), piece("a", "second thought"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(
            r.rx.try_recv().is_err(),
            "turn must not dispatch while the key is in flight"
        );

        r.dispatcher.in_flight().release(key);
        let turn = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(turn.merged_text, "second thought");
    }

    #[tokio::test]
    async fn test_messages_during_deferral_join_the_rearmed_turn() {
        let mut r = rig(
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let key = ConversationKey::new(TenantId(1), ContactId(1));
        assert!(r.dispatcher.in_flight().claim(key));

        r.debouncer.ingest(seed(1, 1), piece("a", "first"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Arrives while the first turn is deferred.
        r.debouncer.ingest(seed(1, 1), piece("b", "second"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        r.dispatcher.in_flight().release(key);
        let turn = tokio::time::timeout(Duration::from_secs(2), r.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            turn.merged_text, "first\nsecond",
            "deferred pieces keep receipt order ahead of newer ones"
        );
    }
}

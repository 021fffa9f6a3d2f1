/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Dispatcher and worker pool. Turns flow through a bounded FIFO queue into a
//! fixed-size pool; the single-flight invariant is enforced by claiming the
//! conversation key at submit time and releasing it when the worker finishes,
//! so a key can never be queued or processed twice concurrently.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::{AgentEvent, AgentRegistry, ToolResult, TurnContext};
use crate::broadcast::{BroadcastEvent, BroadcastHub, EventKind};
use crate::store::{NewMessage, Store};
use crate::tools::{ToolCall, ToolExecutor};
use crate::transport::TransportSet;
use crate::types::{ConversationKey, Direction, MessageKind, Turn};
use crate::usage::UsageGuard;

// ---------------------------------------------------------------------------
// Gauges
// ---------------------------------------------------------------------------

/// Health gauges exposed by /health and /metrics.
#[derive(Default)]
pub struct PipelineGauges {
    pub queue_depth: AtomicI64,
    pub busy_workers: AtomicUsize,
    pub rejected_count: AtomicU64,
    pub processing_failures: AtomicU64,
}

// ---------------------------------------------------------------------------
// In-flight set
// ---------------------------------------------------------------------------

const IN_FLIGHT_SHARDS: usize = 16;

/// Sharded set of conversation keys currently queued or being processed.
pub struct InFlightSet {
    shards: Vec<Mutex<HashSet<ConversationKey>>>,
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self {
            shards: (0..IN_FLIGHT_SHARDS)
                .map(|_| Mutex::new(HashSet::new()))
                .collect(),
        }
    }
}

impl InFlightSet {
    /// Claim a key. Returns `false` when the conversation already has a turn
    /// queued or in flight.
    #[must_use]
    pub fn claim(&self, key: ConversationKey) -> bool {
        self.shards[key.shard(IN_FLIGHT_SHARDS)]
            .lock()
            .map(|mut s| s.insert(key))
            .unwrap_or(false)
    }

    pub fn release(&self, key: ConversationKey) {
        if let Ok(mut s) = self.shards[key.shard(IN_FLIGHT_SHARDS)].lock() {
            s.remove(&key);
        }
    }

    #[must_use]
    pub fn contains(&self, key: ConversationKey) -> bool {
        self.shards[key.shard(IN_FLIGHT_SHARDS)]
            .lock()
            .map(|s| s.contains(&key))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().map(|set| set.len()).unwrap_or(0))
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SubmitOutcome {
    Queued,
    /// The conversation already has a turn queued or in flight; the turn is
    /// handed back so the debouncer can re-arm it.
    Deferred(Turn),
    /// Queue stayed full past the send timeout; the turn was dropped with a
    /// `queue_full` broadcast and no customer reply.
    Rejected,
}

pub struct Dispatcher {
    tx: mpsc::Sender<Turn>,
    in_flight: Arc<InFlightSet>,
    gauges: Arc<PipelineGauges>,
    hub: Arc<BroadcastHub>,
    send_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        tx: mpsc::Sender<Turn>,
        gauges: Arc<PipelineGauges>,
        hub: Arc<BroadcastHub>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            in_flight: Arc::new(InFlightSet::default()),
            gauges,
            hub,
            send_timeout,
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> &Arc<InFlightSet> {
        &self.in_flight
    }

    /// Enqueue a coalesced turn, enforcing single-flight per conversation.
    pub async fn submit(&self, turn: Turn) -> SubmitOutcome {
        let key = turn.conversation_key();
        if !self.in_flight.claim(key) {
            return SubmitOutcome::Deferred(turn);
        }

        match self.tx.send_timeout(turn, self.send_timeout).await {
            Ok(()) => {
                self.gauges.queue_depth.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Queued
            }
            Err(e) => {
                let turn = match e {
                    mpsc::error::SendTimeoutError::Timeout(t)
                    | mpsc::error::SendTimeoutError::Closed(t) => t,
                };
                self.in_flight.release(key);
                self.gauges.rejected_count.fetch_add(1, Ordering::Relaxed);
                warn!(conversation = %key, "queue full, rejecting turn");
                self.hub.publish(&BroadcastEvent::new(
                    EventKind::QueueFull,
                    turn.tenant_id,
                    json!({
                        "contact_id": turn.contact_id,
                        "chatbot_id": turn.chatbot_id,
                        "dropped_messages": turn.pieces.len(),
                    }),
                ));
                SubmitOutcome::Rejected
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Everything a worker needs to process a turn.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub agents: Arc<AgentRegistry>,
    pub transports: Arc<TransportSet>,
    pub tools: Arc<ToolExecutor>,
    pub usage: Arc<UsageGuard>,
    pub hub: Arc<BroadcastHub>,
    pub agent_deadline: Duration,
}

/// How a turn ended. Used for logging and gauge accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied,
    SkippedPaused,
    SkippedQuota,
    AgentSilent,
    AgentFailed,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers draining the shared queue.
    #[must_use]
    pub fn spawn(
        count: usize,
        rx: mpsc::Receiver<Turn>,
        in_flight: Arc<InFlightSet>,
        gauges: Arc<PipelineGauges>,
        ctx: Arc<WorkerContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..count)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let in_flight = Arc::clone(&in_flight);
                let gauges = Arc::clone(&gauges);
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, rx, in_flight, gauges, ctx, shutdown).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to drain and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Turn>>>,
    in_flight: Arc<InFlightSet>,
    gauges: Arc<PipelineGauges>,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "worker started");
    loop {
        let turn = {
            let mut guard = rx.lock().await;
            tokio::select! {
                turn = guard.recv() => turn,
                _ = shutdown.changed() => {
                    info!(worker_id, "shutdown signal, worker stopping");
                    None
                }
            }
        };
        let Some(turn) = turn else { break };

        gauges.queue_depth.fetch_sub(1, Ordering::Relaxed);
        gauges.busy_workers.fetch_add(1, Ordering::Relaxed);
        let key = turn.conversation_key();

        match process_turn(&ctx, turn).await {
            Ok(outcome) => {
                if outcome == TurnOutcome::AgentFailed {
                    gauges.processing_failures.fetch_add(1, Ordering::Relaxed);
                }
                info!(worker_id, conversation = %key, ?outcome, "turn processed");
            }
            Err(e) => {
                gauges.processing_failures.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, conversation = %key, error = %e, "turn failed");
            }
        }

        // Success or failure, the conversation becomes schedulable again.
        in_flight.release(key);
        gauges.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }
    info!(worker_id, "worker stopped");
}

/// The worker algorithm for one coalesced turn.
async fn process_turn(
    ctx: &WorkerContext,
    turn: Turn,
) -> Result<TurnOutcome, crate::error::BrokerError> {
    let started = std::time::Instant::now();

    // 1. Contact is created/refreshed; keep last_interaction current.
    let contact = ctx
        .store
        .upsert_contact(turn.tenant_id, turn.chatbot_id, &turn.from_number, None)
        .await?;
    ctx.store
        .touch_contact(turn.tenant_id, contact.contact_id)
        .await?;

    // 2. One incoming row per originating BSP record, idempotent under
    //    provider redelivery. Store failures here must not block the agent:
    //    the BSP already got its 200.
    for piece in &turn.pieces {
        let inserted = ctx
            .store
            .insert_message(&NewMessage {
                tenant_id: turn.tenant_id,
                chatbot_id: turn.chatbot_id,
                contact_id: contact.contact_id,
                provider_message_id: Some(piece.provider_message_id.clone()),
                direction: Direction::Incoming,
                kind: piece.kind,
                content_text: piece.text.clone(),
                content_url: piece.content_url.clone(),
                status: "received".to_string(),
                metadata: piece.metadata.clone(),
                user_sent: false,
                ai_processed: false,
                processing_duration_ms: None,
            })
            .await;
        match inserted {
            Ok(Some(message_id)) => {
                ctx.hub.publish(&BroadcastEvent::new(
                    EventKind::MessageIncoming,
                    turn.tenant_id,
                    json!({
                        "message_id": message_id,
                        "contact_id": contact.contact_id,
                        "message_type": piece.kind.as_str(),
                        "content_text": piece.text,
                    }),
                ));
            }
            Ok(None) => {
                // Redelivered record; row already exists.
            }
            Err(e) => {
                warn!(error = %e, provider_message_id = %piece.provider_message_id,
                      "failed to persist incoming message, continuing");
            }
        }
    }

    // 3. Pause gate: persisted but not processed.
    if ctx.store.is_paused(turn.tenant_id, contact.contact_id).await? {
        ctx.hub.publish(&BroadcastEvent::new(
            EventKind::ContactPaused,
            turn.tenant_id,
            json!({
                "contact_id": contact.contact_id,
                "skipped_turn": true,
                "buffered_messages": turn.pieces.len(),
            }),
        ));
        return Ok(TurnOutcome::SkippedPaused);
    }

    // 4. Quota pre-check: broadcast-only, no outbound, no transcript clutter.
    let verdict = ctx.usage.check(turn.tenant_id).await?;
    if verdict.is_over() {
        ctx.hub.publish(&BroadcastEvent::new(
            EventKind::QuotaExceeded,
            turn.tenant_id,
            json!({
                "contact_id": contact.contact_id,
                "verdict": verdict.as_str(),
            }),
        ));
        return Ok(TurnOutcome::SkippedQuota);
    }

    if turn.merged_text.trim().is_empty() {
        return Ok(TurnOutcome::AgentSilent);
    }

    // 5–6. Invoke the agent and drive its event stream, executing tool calls
    // as they arrive. Only the final text is transmitted to the customer.
    let Some(agent) = ctx.agents.get(&turn.agent_id) else {
        write_internal_diagnostic(
            ctx,
            &turn,
            contact.contact_id,
            &format!("no agent registered for '{}'", turn.agent_id),
        )
        .await;
        return Ok(TurnOutcome::AgentFailed);
    };
    let Some(transport) = ctx.transports.for_tenant(turn.tenant_id) else {
        write_internal_diagnostic(
            ctx,
            &turn,
            contact.contact_id,
            &format!("no transport configured for tenant {}", turn.tenant_id),
        )
        .await;
        return Ok(TurnOutcome::AgentFailed);
    };

    let turn_ctx = TurnContext {
        tenant_id: turn.tenant_id,
        chatbot_id: turn.chatbot_id,
        contact_id: contact.contact_id,
        from_number: turn.from_number.clone(),
        language_hint: turn.language_hint.clone(),
    };

    let drive = async {
        let mut run = agent
            .run(&contact.thread_id, &turn_ctx, &turn.merged_text)
            .await
            .map_err(|e| e.to_string())?;

        let mut final_text: Option<String> = None;
        while let Some(event) = run.events.recv().await {
            match event {
                AgentEvent::TextChunk { .. } => {
                    // Intermediate narration; never transmitted.
                }
                AgentEvent::ToolCall {
                    name,
                    arguments,
                    correlation_id,
                } => {
                    let result = match ToolCall::parse(&name, &arguments) {
                        Ok(call) => ctx
                            .tools
                            .execute(&turn_ctx, transport.as_ref(), call)
                            .await
                            .unwrap_or_else(|e| json!({ "error": e.to_string() })),
                        Err(e) => json!({ "error": e.to_string() }),
                    };
                    if run
                        .tool_results
                        .send(ToolResult {
                            correlation_id,
                            result,
                        })
                        .await
                        .is_err()
                    {
                        return Err("agent closed tool result channel".to_string());
                    }
                }
                AgentEvent::Final { text } => {
                    final_text = Some(text);
                    break;
                }
                AgentEvent::Error { kind, detail } => {
                    return Err(format!("{kind}: {detail}"));
                }
            }
        }
        Ok::<Option<String>, String>(final_text)
    };

    let final_text = match tokio::time::timeout(ctx.agent_deadline, drive).await {
        Ok(Ok(text)) => text,
        Ok(Err(agent_error)) => {
            write_internal_diagnostic(ctx, &turn, contact.contact_id, &agent_error).await;
            return Ok(TurnOutcome::AgentFailed);
        }
        Err(_) => {
            // Deadline: partial text is discarded, nothing reaches the customer.
            write_internal_diagnostic(
                ctx,
                &turn,
                contact.contact_id,
                &format!("agent deadline of {:?} exceeded", ctx.agent_deadline),
            )
            .await;
            return Ok(TurnOutcome::AgentFailed);
        }
    };

    let Some(final_text) = final_text.filter(|t| !t.trim().is_empty()) else {
        return Ok(TurnOutcome::AgentSilent);
    };

    // 7. Transmit, persist, account, broadcast.
    let duration_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);
    match transport.send_text(&turn.from_number, &final_text).await {
        Ok(response) => {
            let message_id = ctx
                .store
                .insert_message(&NewMessage {
                    tenant_id: turn.tenant_id,
                    chatbot_id: turn.chatbot_id,
                    contact_id: contact.contact_id,
                    provider_message_id: response.provider_message_id.clone(),
                    direction: Direction::Outgoing,
                    kind: MessageKind::Text,
                    content_text: Some(final_text.clone()),
                    content_url: None,
                    status: response.status.clone(),
                    metadata: None,
                    user_sent: false,
                    ai_processed: true,
                    processing_duration_ms: Some(duration_ms),
                })
                .await?;
            ctx.usage.record_outbound(turn.tenant_id).await?;
            ctx.hub.publish(&BroadcastEvent::new(
                EventKind::MessageOutgoing,
                turn.tenant_id,
                json!({
                    "message_id": message_id,
                    "contact_id": contact.contact_id,
                    "message_type": "text",
                    "content_text": final_text,
                }),
            ));
            Ok(TurnOutcome::Replied)
        }
        Err(transport_error) => {
            // Retries already happened inside the transport; record the
            // failure where the operator dashboard can see it.
            let message_id = ctx
                .store
                .insert_message(&NewMessage {
                    tenant_id: turn.tenant_id,
                    chatbot_id: turn.chatbot_id,
                    contact_id: contact.contact_id,
                    provider_message_id: None,
                    direction: Direction::Outgoing,
                    kind: MessageKind::Text,
                    content_text: Some(final_text.clone()),
                    content_url: None,
                    status: "failed".to_string(),
                    metadata: Some(json!({ "transport_error": transport_error.to_string() })),
                    user_sent: false,
                    ai_processed: true,
                    processing_duration_ms: Some(duration_ms),
                })
                .await?;
            ctx.hub.publish(&BroadcastEvent::new(
                EventKind::MessageStatusChanged,
                turn.tenant_id,
                json!({
                    "message_id": message_id,
                    "contact_id": contact.contact_id,
                    "status": "failed",
                }),
            ));
            Err(crate::error::BrokerError::Transport(
                transport_error.to_string(),
            ))
        }
    }
}

/// Agent failures leave a diagnostic on the transcript (internal direction,
/// never transmitted) instead of a customer-visible apology.
async fn write_internal_diagnostic(
    ctx: &WorkerContext,
    turn: &Turn,
    contact_id: crate::types::ContactId,
    detail: &str,
) {
    warn!(tenant_id = %turn.tenant_id, contact_id = %contact_id, detail, "agent failure");
    let _ = ctx
        .store
        .insert_message(&NewMessage {
            tenant_id: turn.tenant_id,
            chatbot_id: turn.chatbot_id,
            contact_id,
            provider_message_id: None,
            direction: Direction::Internal,
            kind: MessageKind::Text,
            content_text: Some(format!("agent processing failed: {detail}")),
            content_url: None,
            status: "diagnostic".to_string(),
            metadata: Some(json!({ "agent_id": turn.agent_id })),
            user_sent: false,
            ai_processed: false,
            processing_duration_ms: None,
        })
        .await;
}

// ===========================================================================
// Tests
// ===========================================================================

/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Ingress HTTP server: BSP webhook, operator side-channels (manual message,
//! action feedback), the Shopify catalog webhook, the SSE stream for
//! dashboards, and health/metrics. Handlers never block on agent work — they
//! enqueue-and-return or perform one short transport call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use waspline_config::Config;

use crate::broadcast::{BroadcastEvent, BroadcastHub, EventKind, SubscriberFilter};
use crate::bsp::{parse_envelope, WebhookEnvelope, WebhookRecord};
use crate::debounce::{Debouncer, TurnSeed};
use crate::dispatch::PipelineGauges;
use crate::error::BrokerError;
use crate::router::SenderMap;
use crate::store::Store;
use crate::transport::TransportSet;
use crate::types::{ActionStatus, ChatbotId, ContactId, Direction, MessageId, MessageKind, TenantId, TurnPiece};
use crate::usage::UsageGuard;

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// Per-tenant Shopify webhook binding resolved at startup.
#[derive(Clone)]
pub struct ShopifyBinding {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub secret: String,
}

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub transports: Arc<TransportSet>,
    pub hub: Arc<BroadcastHub>,
    pub debouncer: Arc<Debouncer>,
    pub sender_map: tokio::sync::RwLock<Arc<SenderMap>>,
    pub gauges: Arc<PipelineGauges>,
    pub usage: Arc<UsageGuard>,
    /// `X-Shopify-Shop-Domain → binding`.
    pub shopify: HashMap<String, ShopifyBinding>,
    /// Updated by the background transport probe loop.
    pub transport_ok: AtomicBool,
    pub started_at: std::time::Instant,
}

/// Build the axum router over the shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.broker.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        let parsed: Vec<header::HeaderValue> = state
            .config
            .broker
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    Router::new()
        .route("/webhook", post(bsp_webhook_handler))
        .route("/manual-message", post(manual_message_handler))
        .route("/action-feedback", post(action_feedback_handler))
        .route("/webhook/shopify", post(shopify_webhook_handler))
        .route("/stream", get(stream_handler))
        .route("/stream/:topic", get(stream_topic_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(state.config.broker.body_limit_bytes))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /webhook — BSP inbound + delivery reports
// ---------------------------------------------------------------------------

async fn bsp_webhook_handler(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<serde_json::Value>, BrokerError> {
    let envelope: WebhookEnvelope = serde_json::from_str(&body)
        .map_err(|e| BrokerError::Validation(format!("unparseable webhook body: {e}")))?;

    let records = parse_envelope(&envelope);
    let mut processed = 0usize;

    for record in records {
        match record {
            WebhookRecord::Report(report) => {
                let error_detail = if report.status == crate::bsp::DeliveryStatus::Failed {
                    report.description.as_deref()
                } else {
                    None
                };
                match state
                    .store
                    .update_status_by_provider_id(
                        &report.provider_message_id,
                        report.status.as_str(),
                        error_detail,
                    )
                    .await
                {
                    Ok(Some(row)) => {
                        state.hub.publish(&BroadcastEvent::new(
                            EventKind::MessageStatusChanged,
                            row.tenant_id,
                            json!({
                                "message_id": row.message_id,
                                "contact_id": row.contact_id,
                                "provider_message_id": report.provider_message_id,
                                "status": report.status.as_str(),
                            }),
                        ));
                        processed += 1;
                    }
                    Ok(None) => {
                        warn!(
                            provider_message_id = %report.provider_message_id,
                            "delivery report for unknown message, dropping"
                        );
                    }
                    Err(e) => warn!(error = %e, "delivery report update failed"),
                }
            }
            WebhookRecord::Inbound(record) => {
                let route = {
                    let map = state.sender_map.read().await;
                    map.resolve(&record.to_number).cloned()
                };
                let Some(route) = route else {
                    // Dead-letter: no valid sender to reply from.
                    warn!(
                        destination = %record.to_number,
                        provider_message_id = %record.provider_message_id,
                        "unroutable inbound message, dead-lettered"
                    );
                    continue;
                };

                // Contact upsert is the only store write on the hot path.
                let contact = match state
                    .store
                    .upsert_contact(
                        route.tenant_id,
                        route.chatbot_id,
                        &record.from_number,
                        record.contact_name.as_deref(),
                    )
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "contact upsert failed, skipping record");
                        continue;
                    }
                };

                let seed = TurnSeed {
                    tenant_id: route.tenant_id,
                    chatbot_id: route.chatbot_id,
                    contact_id: contact.contact_id,
                    thread_id: contact.thread_id.clone(),
                    agent_id: route.agent_id.clone(),
                    from_number: record.from_number.clone(),
                    sender_msisdn: route.sender_msisdn.clone(),
                    language_hint: route.language_hint.clone(),
                };
                let piece = TurnPiece {
                    provider_message_id: record.provider_message_id.clone(),
                    kind: record.kind,
                    text: record.text.clone(),
                    agent_text: record.agent_text(),
                    content_url: record.content_url.clone(),
                    metadata: record.row_metadata(),
                    received_at: record.received_at,
                };
                state.debouncer.ingest(seed, piece);
                processed += 1;
            }
        }
    }

    Ok(Json(json!({
        "status": "success",
        "processed_messages": processed,
    })))
}

// ---------------------------------------------------------------------------
// POST /manual-message — operator → customer, bypassing the agent
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct ManualMessageRequest {
    message_id: i64,
    contact_id: i64,
    content_text: String,
    /// The operator's tenant; must match the message row.
    user_id: i64,
}

async fn manual_message_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualMessageRequest>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    let tenant_id = TenantId(req.user_id);
    let message_id = MessageId(req.message_id);

    let row = state
        .store
        .fetch_message(message_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("message {message_id}")))?;

    if row.tenant_id != tenant_id || row.contact_id != ContactId(req.contact_id) {
        return Err(BrokerError::Forbidden(
            "message does not belong to this tenant/contact".to_string(),
        ));
    }
    if row.direction != Direction::Manual {
        return Err(BrokerError::Validation(
            "message is not a manual row".to_string(),
        ));
    }
    // Idempotency: re-delivery of an already-sent message is a no-op that
    // reports the first outcome.
    if row.status == "sent" {
        return Ok(Json(json!({
            "status": "success",
            "message": "already sent",
        })));
    }

    let contact = state
        .store
        .fetch_contact(tenant_id, ContactId(req.contact_id))
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("contact {}", req.contact_id)))?;

    let transport = state
        .transports
        .for_tenant(tenant_id)
        .ok_or_else(|| BrokerError::Config(format!("no transport for tenant {tenant_id}")))?;

    let text = if req.content_text.trim().is_empty() {
        row.content_text.clone().unwrap_or_default()
    } else {
        req.content_text.clone()
    };

    match transport.send_text(&contact.phone_number, &text).await {
        Ok(response) => {
            state
                .store
                .update_message_status(
                    tenant_id,
                    message_id,
                    "sent",
                    response.provider_message_id.as_deref(),
                    None,
                )
                .await?;
            let _ = state.usage.record_outbound(tenant_id).await;
            state.hub.publish(&BroadcastEvent::new(
                EventKind::MessageManual,
                tenant_id,
                json!({
                    "message_id": message_id,
                    "contact_id": contact.contact_id,
                    "status": "sent",
                }),
            ));
            info!(tenant_id = %tenant_id, message_id = %message_id, "manual message sent");
            Ok(Json(json!({ "status": "success", "message": "sent" })))
        }
        Err(e) => {
            state
                .store
                .update_message_status(tenant_id, message_id, "failed", None, Some(&e.to_string()))
                .await?;
            state.hub.publish(&BroadcastEvent::new(
                EventKind::MessageStatusChanged,
                tenant_id,
                json!({
                    "message_id": message_id,
                    "contact_id": contact.contact_id,
                    "status": "failed",
                }),
            ));
            Ok(Json(json!({
                "status": "error",
                "message": format!("transport send failed: {e}"),
            })))
        }
    }
}

// ---------------------------------------------------------------------------
// POST /action-feedback — operator resolves a human-in-the-loop action
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct ActionFeedbackRequest {
    action_id: i64,
    status: String,
    #[serde(default)]
    user_response: Option<String>,
}

/// Response templates keyed by request type and outcome. The operator's note
/// is woven into the customer-facing text.
#[must_use]
pub fn compose_action_response(request_type: &str, approved: bool, user_response: &str) -> String {
    let note = user_response.trim();
    let with_note = |lead: &str, tail: &str| {
        if note.is_empty() {
            format!("{lead}{tail}")
        } else {
            format!("{lead} {note}{tail}")
        }
    };
    match (request_type, approved) {
        ("refund_request", true) => with_note("Great news! Your refund request has been approved.", ""),
        ("refund_request", false) => {
            with_note("I understand your refund concerns.", " Please let me know if you have any questions.")
        }
        ("policy_clarification", true) => with_note("I've got the clarification you needed:", ""),
        ("policy_clarification", false) => {
            with_note("Let me help clarify our policy.", " Feel free to ask if you need more details.")
        }
        ("custom_quote", true) => with_note("Perfect! I've prepared a custom quote for you.", ""),
        ("custom_quote", false) => {
            with_note("I understand you're looking for a custom quote.", " Let's explore other options.")
        }
        ("manual_followup", true) => with_note("Thanks for your patience!", ""),
        ("manual_followup", false) => {
            with_note("I appreciate your inquiry.", " Is there anything else I can help with?")
        }
        ("approval_request", true) => with_note("Approved!", ""),
        ("approval_request", false) => {
            with_note("I've reviewed your request.", " Let me know if you'd like to discuss alternatives.")
        }
        ("help_needed", true) => with_note("I'm here to help!", ""),
        ("help_needed", false) => {
            with_note("I understand you need assistance.", " Let's find the best solution for you.")
        }
        (_, true) => with_note("Your request has been processed.", ""),
        (_, false) => with_note("I've reviewed your request.", ""),
    }
}

async fn action_feedback_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActionFeedbackRequest>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    let status = match req.status.as_str() {
        "approved" => ActionStatus::Approved,
        "denied" => ActionStatus::Denied,
        other => {
            return Err(BrokerError::Validation(format!(
                "status must be approved|denied, got '{other}'"
            )))
        }
    };

    let action_id = crate::types::ActionId(req.action_id);
    let action = state
        .store
        .fetch_action(action_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("action {action_id}")))?;

    // Idempotent by (action_id, status): a resolved action is not re-resolved
    // nor re-broadcast.
    let transitioned = state
        .store
        .resolve_action(
            action.tenant_id,
            action_id,
            status,
            req.user_response.as_deref(),
        )
        .await?;
    if !transitioned {
        return Ok(Json(json!({ "status": "ok", "message": "already resolved" })));
    }

    let contact = state
        .store
        .fetch_contact(action.tenant_id, action.contact_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("contact {}", action.contact_id)))?;

    let transport = state.transports.for_tenant(action.tenant_id).ok_or_else(|| {
        BrokerError::Config(format!("no transport for tenant {}", action.tenant_id))
    })?;

    let text = compose_action_response(
        &action.request_type,
        status == ActionStatus::Approved,
        req.user_response.as_deref().unwrap_or(""),
    );

    let send_result = transport.send_text(&contact.phone_number, &text).await;
    let (row_status, provider_id, error_detail) = match &send_result {
        Ok(response) => (
            response.status.clone(),
            response.provider_message_id.clone(),
            None,
        ),
        Err(e) => ("failed".to_string(), None, Some(e.to_string())),
    };

    let _ = state
        .store
        .insert_message(&crate::store::NewMessage {
            tenant_id: action.tenant_id,
            chatbot_id: action.chatbot_id,
            contact_id: action.contact_id,
            provider_message_id: provider_id,
            direction: Direction::Outgoing,
            kind: MessageKind::Text,
            content_text: Some(text.clone()),
            content_url: None,
            status: row_status,
            metadata: Some(json!({
                "action_id": action_id,
                "action_status": status.as_str(),
                "transport_error": error_detail,
            })),
            user_sent: true,
            ai_processed: false,
            processing_duration_ms: None,
        })
        .await;
    if send_result.is_ok() {
        let _ = state.usage.record_outbound(action.tenant_id).await;
    }

    // The transcript indicator flips to the terminal status.
    let _ = state
        .store
        .update_action_indicator(action.tenant_id, action.contact_id, action_id, status)
        .await;

    state.hub.publish(&BroadcastEvent::new(
        EventKind::ActionResolved,
        action.tenant_id,
        json!({
            "action_id": action_id,
            "contact_id": action.contact_id,
            "request_type": action.request_type,
            "status": status.as_str(),
        }),
    ));

    info!(
        tenant_id = %action.tenant_id,
        action_id = %action_id,
        status = status.as_str(),
        "action resolved"
    );
    Ok(Json(json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// POST /webhook/shopify — catalog events, HMAC-signed
// ---------------------------------------------------------------------------

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// HMAC-SHA256 over the raw body, base64-encoded, compared in constant time.
#[must_use]
pub fn verify_shopify_signature(secret: &str, body: &[u8], signature_b64: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    };
    constant_time_eq(computed.as_bytes(), signature_b64.as_bytes())
}

/// Strip tags from Shopify `body_html` for knowledge answers.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn shopify_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, BrokerError> {
    let topic = headers
        .get("x-shopify-topic")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BrokerError::Validation("missing X-Shopify-Topic".to_string()))?
        .to_string();
    let signature = headers
        .get("x-shopify-hmac-sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BrokerError::Unauthorized("missing signature header".to_string()))?;
    let shop_domain = headers
        .get("x-shopify-shop-domain")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let binding = state
        .shopify
        .get(shop_domain)
        .ok_or_else(|| BrokerError::Unauthorized(format!("unknown shop '{shop_domain}'")))?
        .clone();

    if !verify_shopify_signature(&binding.secret, body.as_bytes(), signature) {
        return Err(BrokerError::Unauthorized(
            "signature verification failed".to_string(),
        ));
    }

    let payload: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| BrokerError::Validation(format!("bad product payload: {e}")))?;

    // Upsert runs in the background; the provider gets its 200 immediately.
    let store = Arc::clone(&state.store);
    tokio::spawn(async move {
        if let Err(e) = apply_catalog_event(store.as_ref(), &binding, &topic, &payload).await {
            warn!(error = %e, topic = %topic, "catalog upsert failed");
        }
    });

    Ok(StatusCode::OK)
}

/// Map a Shopify product payload onto knowledge rows keyed
/// `(chatbot_id, category, question)`.
async fn apply_catalog_event(
    store: &dyn Store,
    binding: &ShopifyBinding,
    topic: &str,
    payload: &serde_json::Value,
) -> Result<(), BrokerError> {
    let Some(title) = payload.get("title").and_then(|v| v.as_str()) else {
        warn!(topic, "product payload without title, skipping");
        return Ok(());
    };

    let deactivate = topic == "products/delete";
    let mut answer = payload
        .get("body_html")
        .and_then(|v| v.as_str())
        .map(strip_html)
        .unwrap_or_default();
    if let Some(price) = payload
        .get("variants")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("price"))
        .and_then(|v| v.as_str())
    {
        if !answer.is_empty() {
            answer.push(' ');
        }
        answer.push_str(&format!("Price: {price}."));
    }
    if answer.is_empty() {
        answer = format!("{title} is available in our catalog.");
    }

    store
        .upsert_knowledge(
            binding.tenant_id,
            binding.chatbot_id,
            "products",
            title,
            &answer,
            !deactivate,
        )
        .await?;
    info!(
        tenant_id = %binding.tenant_id,
        product = title,
        active = !deactivate,
        "knowledge entry updated from catalog event"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// GET /stream — SSE for dashboards
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Default)]
struct StreamQuery {
    tenant_id: Option<i64>,
    topics: Option<String>,
}

/// Unsubscribes when the SSE stream is dropped (client disconnect).
struct SubscriptionGuard {
    hub: Arc<BroadcastHub>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

fn sse_response(
    state: &Arc<AppState>,
    filter: SubscriberFilter,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (id, rx) = state.hub.subscribe(filter);
    let guard = SubscriptionGuard {
        hub: Arc::clone(&state.hub),
        id,
    };

    // The guard rides inside the closure; dropping the stream (client
    // disconnect) unsubscribes.
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(move |event| {
        let _keep = &guard;
        let data = serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.event).data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.broker.sse_keepalive_seconds))
            .text(""),
    )
}

fn parse_topics(raw: Option<&str>) -> Option<Vec<EventKind>> {
    let raw = raw?;
    let kinds: Vec<EventKind> = raw
        .split(',')
        .filter_map(|t| EventKind::parse(t.trim()))
        .collect();
    if kinds.is_empty() {
        None
    } else {
        Some(kinds)
    }
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let filter = SubscriberFilter {
        tenant_id: query.tenant_id.map(TenantId),
        kinds: parse_topics(query.topics.as_deref()),
    };
    sse_response(&state, filter)
}

async fn stream_topic_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, BrokerError> {
    let kind = EventKind::parse(&topic)
        .ok_or_else(|| BrokerError::NotFound(format!("unknown topic '{topic}'")))?;
    let filter = SubscriberFilter {
        tenant_id: query.tenant_id.map(TenantId),
        kinds: Some(vec![kind]),
    };
    Ok(sse_response(&state, filter))
}

// ---------------------------------------------------------------------------
// GET /health and GET /metrics
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let transport_ok = state.transport_ok.load(Ordering::Relaxed);
    let queue_depth = state.gauges.queue_depth.load(Ordering::Relaxed);
    let busy = state.gauges.busy_workers.load(Ordering::Relaxed);

    Json(json!({
        "status": if transport_ok { "healthy" } else { "degraded" },
        "queue_depth": queue_depth,
        "busy_workers": busy,
        "transport_reachable": transport_ok,
        "sse_subscribers": state.hub.subscriber_count(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": state.config.waspline.version,
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "pipeline": {
            "queue_depth": state.gauges.queue_depth.load(Ordering::Relaxed),
            "busy_workers": state.gauges.busy_workers.load(Ordering::Relaxed),
            "rejected_count": state.gauges.rejected_count.load(Ordering::Relaxed),
            "processing_failures": state.gauges.processing_failures.load(Ordering::Relaxed),
            "max_workers": state.config.pipeline.max_workers,
            "queue_capacity": state.config.pipeline.queue_capacity,
        },
        "debounce": {
            "window_seconds": state.config.pipeline.debounce_seconds,
            "max_coalesce_span_seconds": state.config.pipeline.max_coalesce_span_seconds,
            "pending_conversations": state.debouncer.pending_count(),
        },
        "broadcast": {
            "subscribers": state.hub.subscriber_count(),
        },
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::store::testing::MemStore;
    use crate::store::NewMessage;
    use crate::transport::testing::{RecordingTransport, SentCall};
    use crate::types::{ActionId, ActionPriority};
    use tokio::sync::mpsc;

    struct Rig {
        state: Arc<AppState>,
        store: Arc<MemStore>,
        transport: Arc<RecordingTransport>,
        _turn_rx: mpsc::Receiver<crate::types::Turn>,
    }

    fn rig() -> Rig {
        let config = Arc::new(crate::testutil::test_config(&[(1, "96179374241", 2, "ecla")]));
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
        let hub = Arc::new(BroadcastHub::new(32));
        let gauges = Arc::new(PipelineGauges::default());

        let transport = Arc::new(RecordingTransport::new("96179374241"));
        let mut transports = TransportSet::empty();
        let as_transport: Arc<dyn crate::transport::MessagingTransport> = Arc::clone(&transport) as Arc<dyn crate::transport::MessagingTransport>;
        transports.insert(TenantId(1), as_transport);

        let (turn_tx, turn_rx) = mpsc::channel(8);
        let dispatcher = Arc::new(Dispatcher::new(
            turn_tx,
            Arc::clone(&gauges),
            Arc::clone(&hub),
            Duration::from_millis(50),
        ));
        let debouncer = Arc::new(Debouncer::new(
            Duration::from_millis(20),
            Duration::from_millis(10),
            Duration::from_millis(200),
            dispatcher,
        ));
        let sender_map =
            Arc::new(SenderMap::from_config(&config).unwrap());
        let usage = Arc::new(UsageGuard::from_config(&config, Arc::clone(&store_dyn)));

        let state = Arc::new(AppState {
            config,
            store: store_dyn,
            transports: Arc::new(transports),
            hub,
            debouncer,
            sender_map: tokio::sync::RwLock::new(sender_map),
            gauges,
            usage,
            shopify: HashMap::new(),
            transport_ok: AtomicBool::new(true),
            started_at: std::time::Instant::now(),
        });
        Rig {
            state,
            store,
            transport,
            _turn_rx: turn_rx,
        }
    }

    async fn seed_manual_row(rig: &Rig) -> (crate::store::ContactRef, MessageId) {
        let contact = rig
            .state
            .store
            .upsert_contact(TenantId(1), ChatbotId(2), "9613451652", Some("Rana"))
            .await
            .unwrap();
        // The dashboard inserts the manual row; the webhook only transmits it.
        let message_id = rig
            .state
            .store
            .insert_message(&NewMessage {
                tenant_id: TenantId(1),
                chatbot_id: ChatbotId(2),
                contact_id: contact.contact_id,
                provider_message_id: None,
                direction: Direction::Manual,
                kind: MessageKind::Text,
                content_text: Some("we'll reply shortly".to_string()),
                content_url: None,
                status: "pending".to_string(),
                metadata: None,
                user_sent: true,
                ai_processed: false,
                processing_duration_ms: None,
            })
            .await
            .unwrap()
            .unwrap();
        (contact, message_id)
    }

    #[tokio::test]
    async fn test_manual_message_sends_and_is_idempotent() {
        let r = rig();
        let (contact, message_id) = seed_manual_row(&r).await;

        let request = || ManualMessageRequest {
            message_id: message_id.0,
            contact_id: contact.contact_id.0,
            content_text: "we'll reply shortly".to_string(),
            user_id: 1,
        };

        let first = manual_message_handler(State(Arc::clone(&r.state)), Json(request()))
            .await
            .unwrap();
        assert_eq!(first.0["status"], json!("success"));
        let row = r.store.fetch_message(message_id).await.unwrap().unwrap();
        assert_eq!(row.status, "sent", "row transitions pending → sent");

        // Redelivery: no second transport call, first outcome reported.
        let second = manual_message_handler(State(Arc::clone(&r.state)), Json(request()))
            .await
            .unwrap();
        assert_eq!(second.0["message"], json!("already sent"));
        assert_eq!(
            r.transport.sent().len(),
            1,
            "idempotent redelivery must not resend"
        );
        assert_eq!(
            r.transport.sent()[0],
            SentCall::Text {
                to: "9613451652".to_string(),
                text: "we'll reply shortly".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_manual_message_tenant_mismatch_forbidden() {
        let r = rig();
        let (contact, message_id) = seed_manual_row(&r).await;

        let result = manual_message_handler(
            State(Arc::clone(&r.state)),
            Json(ManualMessageRequest {
                message_id: message_id.0,
                contact_id: contact.contact_id.0,
                content_text: "hi".to_string(),
                user_id: 99, // wrong tenant
            }),
        )
        .await;
        assert!(matches!(result, Err(BrokerError::Forbidden(_))));
        assert!(r.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_action_feedback_round_trip_and_idempotency() {
        let r = rig();
        let contact = r
            .state
            .store
            .upsert_contact(TenantId(1), ChatbotId(2), "9613451652", None)
            .await
            .unwrap();
        let action_id = r
            .state
            .store
            .create_action(&crate::store::NewAction {
                tenant_id: TenantId(1),
                chatbot_id: ChatbotId(2),
                contact_id: contact.contact_id,
                request_type: "refund_request".to_string(),
                request_details: "Customer X requests refund on order #1001".to_string(),
                request_data: None,
                priority: ActionPriority::High,
            })
            .await
            .unwrap();

        let (_, mut events) = r.state.hub.subscribe(SubscriberFilter {
            tenant_id: None,
            kinds: Some(vec![EventKind::ActionResolved]),
        });

        let request = || ActionFeedbackRequest {
            action_id: action_id.0,
            status: "approved".to_string(),
            user_response: Some("Refund processed.".to_string()),
        };

        let first = action_feedback_handler(State(Arc::clone(&r.state)), Json(request()))
            .await
            .unwrap();
        assert_eq!(first.0["status"], json!("ok"));

        let action = r
            .state
            .store
            .fetch_action(ActionId(action_id.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.status, ActionStatus::Approved);

        let sent = r.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            SentCall::Text {
                to: "9613451652".to_string(),
                text: "Great news! Your refund request has been approved. Refund processed."
                    .to_string(),
            }
        );
        let event = events.try_recv().unwrap();
        assert_eq!(event.event, "action.resolved");

        // Re-post: no re-resolution, no re-send, no re-broadcast.
        let second = action_feedback_handler(State(Arc::clone(&r.state)), Json(request()))
            .await
            .unwrap();
        assert_eq!(second.0["message"], json!("already resolved"));
        assert_eq!(r.transport.sent().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_shopify_signature_round_trip() {
        let secret = "shpss_test_secret";
        let body = br#"{"id":1,"title":"Teeth Whitening Kit"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let good = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
        };

        assert!(verify_shopify_signature(secret, body, &good));
        assert!(!verify_shopify_signature(secret, body, "AAAA"));
        assert!(!verify_shopify_signature("wrong_secret", body, &good));
    }

    #[test]
    fn test_constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html("<p>LED kit with <b>three</b> modes</p>"),
            "LED kit with three modes"
        );
        assert_eq!(strip_html("no tags"), "no tags");
    }

    #[test]
    fn test_compose_action_response_templates() {
        let approved = compose_action_response("refund_request", true, "Refund processed.");
        assert_eq!(
            approved,
            "Great news! Your refund request has been approved. Refund processed."
        );

        let denied = compose_action_response("refund_request", false, "");
        assert_eq!(
            denied,
            "I understand your refund concerns. Please let me know if you have any questions."
        );

        let fallback = compose_action_response("something_else", true, "");
        assert_eq!(fallback, "Your request has been processed.");
    }

    #[test]
    fn test_parse_topics() {
        let kinds = parse_topics(Some("message.incoming, action.created")).unwrap();
        assert_eq!(kinds.len(), 2);
        assert!(parse_topics(Some("garbage")).is_none());
        assert!(parse_topics(None).is_none());
    }
}

/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Persistence layer. Tables: `contacts`, `messages`, `actions`,
//! `usage_tracking`, `knowledge_base`. Every call is tenant-scoped: the
//! tenant id comes from the routed pipeline context, never from payloads, and
//! every WHERE clause carries it so a mismatched write affects zero rows.
//!
//! Dashboards write to the same tables from other processes; their changes
//! reach the broadcast hub through Postgres `LISTEN/NOTIFY` on the
//! `waspline_events` channel (see [`run_notification_bridge`]).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcast::{BroadcastEvent, BroadcastHub, EventKind};
use crate::error::BrokerError;
use crate::types::{
    ActionId, ActionPriority, ActionStatus, ChatbotId, ContactId, Direction, MessageId,
    MessageKind, TenantId,
};

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

/// Minimal contact handle resolved on the ingress hot path. The pause flag
/// is deliberately not here: workers read it per turn via [`Store::is_paused`].
#[derive(Debug, Clone)]
pub struct ContactRef {
    pub contact_id: ContactId,
    pub thread_id: String,
}

#[derive(Debug, Clone)]
pub struct ContactRow {
    pub contact_id: ContactId,
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub phone_number: String,
    pub name: Option<String>,
    pub thread_id: String,
    pub paused: bool,
}

/// A message row to persist. `provider_message_id` drives idempotency for
/// incoming rows (redelivery of the same BSP record inserts nothing).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub provider_message_id: Option<String>,
    pub direction: Direction,
    pub kind: MessageKind,
    pub content_text: Option<String>,
    pub content_url: Option<String>,
    pub status: String,
    pub metadata: Option<serde_json::Value>,
    pub user_sent: bool,
    pub ai_processed: bool,
    pub processing_duration_ms: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub direction: Direction,
    pub content_text: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub request_type: String,
    pub request_details: String,
    pub request_data: Option<serde_json::Value>,
    pub priority: ActionPriority,
}

#[derive(Debug, Clone)]
pub struct ActionRow {
    pub action_id: ActionId,
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub request_type: String,
    pub request_details: String,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
}

/// Counters for the quota pre-check. Daily comes from today's row; monthly is
/// an aggregate over the calendar month.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub daily_outbound: i64,
    pub monthly_outbound: i64,
}

/// Identity of a message row touched by a delivery report, for broadcasting.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdateRef {
    pub tenant_id: TenantId,
    pub message_id: MessageId,
    pub contact_id: ContactId,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Store: Send + Sync {
    /// Find or create the contact for `(tenant, phone)`. Backfills the display
    /// name when the existing row has none. Runs inline on ingress, so it must
    /// stay a single round-trip-ish operation.
    async fn upsert_contact(
        &self,
        tenant_id: TenantId,
        chatbot_id: ChatbotId,
        phone_number: &str,
        name: Option<&str>,
    ) -> Result<ContactRef, BrokerError>;

    async fn fetch_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Option<ContactRow>, BrokerError>;

    async fn touch_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<(), BrokerError>;

    async fn is_paused(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<bool, BrokerError>;

    /// Insert one message row. Returns `None` when an identical
    /// `provider_message_id` already exists (idempotent redelivery).
    async fn insert_message(&self, message: &NewMessage)
        -> Result<Option<MessageId>, BrokerError>;

    /// Update a message's delivery status by provider id. Returns the row's
    /// identity, or `None` when the id is unknown.
    async fn update_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: &str,
        error_detail: Option<&str>,
    ) -> Result<Option<StatusUpdateRef>, BrokerError>;

    async fn fetch_message(&self, message_id: MessageId)
        -> Result<Option<MessageRow>, BrokerError>;

    async fn update_message_status(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        status: &str,
        provider_message_id: Option<&str>,
        error_detail: Option<&str>,
    ) -> Result<(), BrokerError>;

    async fn create_action(&self, action: &NewAction) -> Result<ActionId, BrokerError>;

    async fn fetch_action(&self, action_id: ActionId) -> Result<Option<ActionRow>, BrokerError>;

    /// Transition a pending action to a terminal status. Returns `false` when
    /// the action was already resolved (idempotent re-post).
    async fn resolve_action(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        status: ActionStatus,
        user_response: Option<&str>,
    ) -> Result<bool, BrokerError>;

    /// Rewrite the embedded status of the `action_indicator` transcript row
    /// referencing this action.
    async fn update_action_indicator(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        action_id: ActionId,
        status: ActionStatus,
    ) -> Result<bool, BrokerError>;

    /// Post-increment of the authoritative outbound counter.
    async fn record_outbound(&self, tenant_id: TenantId, messages: i64)
        -> Result<(), BrokerError>;

    async fn usage_snapshot(&self, tenant_id: TenantId) -> Result<UsageSnapshot, BrokerError>;

    async fn upsert_knowledge(
        &self,
        tenant_id: TenantId,
        chatbot_id: ChatbotId,
        category: &str,
        question: &str,
        answer: &str,
        is_active: bool,
    ) -> Result<(), BrokerError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Connection-level hiccups worth one inline retry; constraint violations and
/// friends are permanent and bubble immediately.
fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_contact(
        &self,
        tenant_id: TenantId,
        chatbot_id: ChatbotId,
        phone_number: &str,
        name: Option<&str>,
    ) -> Result<ContactRef, BrokerError> {
        // Existing contact: backfill the name if we just learned it.
        let existing = sqlx::query(
            "SELECT id, thread_id FROM contacts
             WHERE tenant_id = $1 AND phone_number = $2",
        )
        .bind(tenant_id)
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let contact_id: ContactId = ContactId(row.get("id"));
            if let Some(name) = name {
                let _ = sqlx::query(
                    "UPDATE contacts
                     SET name = COALESCE(NULLIF(name, ''), $1), updated_at = NOW()
                     WHERE id = $2 AND tenant_id = $3 AND (name IS NULL OR name = '')",
                )
                .bind(name.trim())
                .bind(contact_id)
                .bind(tenant_id)
                .execute(&self.pool)
                .await;
            }
            return Ok(ContactRef {
                contact_id,
                thread_id: row.get("thread_id"),
            });
        }

        let thread_id = uuid::Uuid::new_v4().to_string();
        let row = sqlx::query(
            "INSERT INTO contacts
                 (tenant_id, chatbot_id, phone_number, name, thread_id, paused, last_interaction)
             VALUES ($1, $2, $3, $4, $5, FALSE, NOW())
             ON CONFLICT (tenant_id, phone_number) DO UPDATE SET updated_at = NOW()
             RETURNING id, thread_id",
        )
        .bind(tenant_id)
        .bind(chatbot_id)
        .bind(phone_number)
        .bind(name.map(str::trim))
        .bind(&thread_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ContactRef {
            contact_id: ContactId(row.get("id")),
            thread_id: row.get("thread_id"),
        })
    }

    async fn fetch_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<Option<ContactRow>, BrokerError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, chatbot_id, phone_number, name, thread_id, paused
             FROM contacts WHERE id = $1 AND tenant_id = $2",
        )
        .bind(contact_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ContactRow {
            contact_id: ContactId(r.get("id")),
            tenant_id: TenantId(r.get("tenant_id")),
            chatbot_id: ChatbotId(r.get("chatbot_id")),
            phone_number: r.get("phone_number"),
            name: r.get("name"),
            thread_id: r.get("thread_id"),
            paused: r.get("paused"),
        }))
    }

    async fn touch_contact(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            "UPDATE contacts SET last_interaction = NOW(), updated_at = NOW()
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind(contact_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_paused(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
    ) -> Result<bool, BrokerError> {
        let row = sqlx::query(
            "SELECT paused FROM contacts WHERE id = $1 AND tenant_id = $2",
        )
        .bind(contact_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map_or(false, |r| r.get("paused")))
    }

    async fn insert_message(
        &self,
        message: &NewMessage,
    ) -> Result<Option<MessageId>, BrokerError> {
        let mut last_err: Option<sqlx::Error> = None;
        for attempt in 0..2u8 {
            let result = sqlx::query(
                "INSERT INTO messages
                     (tenant_id, chatbot_id, contact_id, provider_message_id, direction,
                      message_type, content_text, content_url, status, sent_at, metadata,
                      user_sent, ai_processed, processing_duration_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), $10, $11, $12, $13)
                 ON CONFLICT (provider_message_id) DO NOTHING
                 RETURNING id",
            )
            .bind(message.tenant_id)
            .bind(message.chatbot_id)
            .bind(message.contact_id)
            .bind(message.provider_message_id.as_deref())
            .bind(message.direction.as_str())
            .bind(message.kind.as_str())
            .bind(message.content_text.as_deref())
            .bind(message.content_url.as_deref())
            .bind(&message.status)
            .bind(message.metadata.as_ref())
            .bind(message.user_sent)
            .bind(message.ai_processed)
            .bind(message.processing_duration_ms)
            .fetch_optional(&self.pool)
            .await;

            match result {
                Ok(row) => return Ok(row.map(|r| MessageId(r.get("id")))),
                Err(e) if attempt == 0 && is_transient(&e) => {
                    warn!(error = %e, "transient store error on insert_message, retrying once");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| BrokerError::Internal("insert_message retry exhausted".into())))
    }

    async fn update_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: &str,
        error_detail: Option<&str>,
    ) -> Result<Option<StatusUpdateRef>, BrokerError> {
        let row = sqlx::query(
            "UPDATE messages
             SET status = $1,
                 metadata = CASE WHEN $2::text IS NULL THEN metadata
                                 ELSE COALESCE(metadata, '{}'::jsonb)
                                      || jsonb_build_object('transport_error', $2::text) END,
                 updated_at = NOW()
             WHERE provider_message_id = $3
             RETURNING tenant_id, id, contact_id",
        )
        .bind(status)
        .bind(error_detail)
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StatusUpdateRef {
            tenant_id: TenantId(r.get("tenant_id")),
            message_id: MessageId(r.get("id")),
            contact_id: ContactId(r.get("contact_id")),
        }))
    }

    async fn fetch_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<MessageRow>, BrokerError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, chatbot_id, contact_id, direction, content_text, status
             FROM messages WHERE id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let direction: String = r.get("direction");
            Direction::parse(&direction).map(|direction| MessageRow {
                message_id: MessageId(r.get("id")),
                tenant_id: TenantId(r.get("tenant_id")),
                chatbot_id: ChatbotId(r.get("chatbot_id")),
                contact_id: ContactId(r.get("contact_id")),
                direction,
                content_text: r.get("content_text"),
                status: r.get("status"),
            })
        }))
    }

    async fn update_message_status(
        &self,
        tenant_id: TenantId,
        message_id: MessageId,
        status: &str,
        provider_message_id: Option<&str>,
        error_detail: Option<&str>,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            "UPDATE messages
             SET status = $1,
                 provider_message_id = COALESCE($2, provider_message_id),
                 metadata = CASE WHEN $3::text IS NULL THEN metadata
                                 ELSE COALESCE(metadata, '{}'::jsonb)
                                      || jsonb_build_object('transport_error', $3::text) END,
                 updated_at = NOW()
             WHERE id = $4 AND tenant_id = $5",
        )
        .bind(status)
        .bind(provider_message_id)
        .bind(error_detail)
        .bind(message_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_action(&self, action: &NewAction) -> Result<ActionId, BrokerError> {
        let row = sqlx::query(
            "INSERT INTO actions
                 (tenant_id, chatbot_id, contact_id, request_type, request_details,
                  request_data, status, priority, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, NOW())
             RETURNING id",
        )
        .bind(action.tenant_id)
        .bind(action.chatbot_id)
        .bind(action.contact_id)
        .bind(&action.request_type)
        .bind(&action.request_details)
        .bind(action.request_data.as_ref())
        .bind(action.priority.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(ActionId(row.get("id")))
    }

    async fn fetch_action(&self, action_id: ActionId) -> Result<Option<ActionRow>, BrokerError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, chatbot_id, contact_id, request_type, request_details,
                    status, created_at
             FROM actions WHERE id = $1",
        )
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let status: String = r.get("status");
            ActionStatus::parse(&status).map(|status| ActionRow {
                action_id: ActionId(r.get("id")),
                tenant_id: TenantId(r.get("tenant_id")),
                chatbot_id: ChatbotId(r.get("chatbot_id")),
                contact_id: ContactId(r.get("contact_id")),
                request_type: r.get("request_type"),
                request_details: r.get("request_details"),
                status,
                created_at: r.get("created_at"),
            })
        }))
    }

    async fn resolve_action(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
        status: ActionStatus,
        user_response: Option<&str>,
    ) -> Result<bool, BrokerError> {
        // The status guard makes re-posting a resolved action a no-op; the
        // claim either moves pending → terminal or touches zero rows.
        let result = sqlx::query(
            "UPDATE actions
             SET status = $1, user_response = $2, resolved_at = NOW(), updated_at = NOW()
             WHERE id = $3 AND tenant_id = $4 AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(user_response)
        .bind(action_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_action_indicator(
        &self,
        tenant_id: TenantId,
        contact_id: ContactId,
        action_id: ActionId,
        status: ActionStatus,
    ) -> Result<bool, BrokerError> {
        let result = sqlx::query(
            "UPDATE messages
             SET content_text = jsonb_set(content_text::jsonb, '{status}', to_jsonb($1::text))::text,
                 updated_at = NOW()
             WHERE direction = 'internal'
               AND message_type = 'action_indicator'
               AND tenant_id = $2
               AND contact_id = $3
               AND content_text::jsonb ->> 'action_id' = $4",
        )
        .bind(status.as_str())
        .bind(tenant_id)
        .bind(contact_id)
        .bind(action_id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() >= 1)
    }

    async fn record_outbound(
        &self,
        tenant_id: TenantId,
        messages: i64,
    ) -> Result<(), BrokerError> {
        let mut last_err: Option<sqlx::Error> = None;
        for attempt in 0..2u8 {
            let result = sqlx::query(
                "INSERT INTO usage_tracking (tenant_id, tracking_date, messages_sent, campaigns_sent)
                 VALUES ($1, CURRENT_DATE, $2, 0)
                 ON CONFLICT (tenant_id, tracking_date)
                 DO UPDATE SET messages_sent = usage_tracking.messages_sent + EXCLUDED.messages_sent,
                               updated_at = NOW()",
            )
            .bind(tenant_id)
            .bind(messages)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt == 0 && is_transient(&e) => {
                    warn!(error = %e, "transient store error on record_outbound, retrying once");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| BrokerError::Internal("record_outbound retry exhausted".into())))
    }

    async fn usage_snapshot(&self, tenant_id: TenantId) -> Result<UsageSnapshot, BrokerError> {
        let row = sqlx::query(
            "SELECT
                 COALESCE(SUM(messages_sent) FILTER (WHERE tracking_date = CURRENT_DATE), 0)::bigint
                     AS daily,
                 COALESCE(SUM(messages_sent), 0)::bigint AS monthly
             FROM usage_tracking
             WHERE tenant_id = $1
               AND tracking_date >= date_trunc('month', CURRENT_DATE)::date",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageSnapshot {
            daily_outbound: row.get("daily"),
            monthly_outbound: row.get("monthly"),
        })
    }

    async fn upsert_knowledge(
        &self,
        tenant_id: TenantId,
        chatbot_id: ChatbotId,
        category: &str,
        question: &str,
        answer: &str,
        is_active: bool,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO knowledge_base (tenant_id, chatbot_id, category, question, answer, is_active)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (chatbot_id, category, question)
             DO UPDATE SET answer = EXCLUDED.answer,
                           is_active = EXCLUDED.is_active,
                           updated_at = NOW()",
        )
        .bind(tenant_id)
        .bind(chatbot_id)
        .bind(category)
        .bind(question)
        .bind(answer)
        .bind(is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LISTEN/NOTIFY → broadcast bridge
// ---------------------------------------------------------------------------

/// Forward `NOTIFY waspline_events, '<json>'` payloads from any writer
/// (dashboards included) into the broadcast hub. Payloads carry at least
/// `{"event": "...", "tenant_id": N}`.
pub async fn run_notification_bridge(
    pool: PgPool,
    hub: Arc<BroadcastHub>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen("waspline_events").await?;
    info!("notification bridge listening on waspline_events");

    loop {
        tokio::select! {
            notification = listener.recv() => {
                let notification = notification?;
                let Ok(payload) =
                    serde_json::from_str::<serde_json::Value>(notification.payload())
                else {
                    warn!("dropping non-JSON notification payload");
                    continue;
                };
                let Some(kind) = payload
                    .get("event")
                    .and_then(|v| v.as_str())
                    .and_then(EventKind::parse)
                else {
                    warn!(payload = %notification.payload(), "dropping notification with unknown event");
                    continue;
                };
                let Some(tenant_id) = payload.get("tenant_id").and_then(serde_json::Value::as_i64)
                else {
                    warn!("dropping notification without tenant_id");
                    continue;
                };
                hub.publish(&BroadcastEvent::new(kind, TenantId(tenant_id), payload));
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal, stopping notification bridge");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store for pipeline tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testing::MemStore;
    use super::*;

    fn incoming(tenant: i64, contact: i64, provider_id: &str) -> NewMessage {
        NewMessage {
            tenant_id: TenantId(tenant),
            chatbot_id: ChatbotId(2),
            contact_id: ContactId(contact),
            provider_message_id: Some(provider_id.to_string()),
            direction: Direction::Incoming,
            kind: MessageKind::Text,
            content_text: Some("hi".to_string()),
            content_url: None,
            status: "received".to_string(),
            metadata: None,
            user_sent: false,
            ai_processed: false,
            processing_duration_ms: None,
        }
    }

    #[tokio::test]
    async fn test_insert_message_idempotent_by_provider_id() {
        let store = MemStore::new();
        let first = store.insert_message(&incoming(1, 1, "wamid-1")).await.unwrap();
        let second = store.insert_message(&incoming(1, 1, "wamid-1")).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none(), "redelivery must not create a second row");
        assert_eq!(store.messages_with_direction(Direction::Incoming), 1);
    }

    #[tokio::test]
    async fn test_upsert_contact_is_tenant_scoped() {
        let store = MemStore::new();
        let a = store
            .upsert_contact(TenantId(1), ChatbotId(2), "9999", None)
            .await
            .unwrap();
        let b = store
            .upsert_contact(TenantId(7), ChatbotId(3), "9999", None)
            .await
            .unwrap();
        assert_ne!(
            a.contact_id, b.contact_id,
            "the same MSISDN under two tenants is two contacts"
        );
    }

    #[tokio::test]
    async fn test_resolve_action_is_idempotent() {
        let store = MemStore::new();
        let id = store
            .create_action(&NewAction {
                tenant_id: TenantId(1),
                chatbot_id: ChatbotId(2),
                contact_id: ContactId(1),
                request_type: "refund_request".to_string(),
                request_details: "refund order #1001".to_string(),
                request_data: None,
                priority: ActionPriority::High,
            })
            .await
            .unwrap();

        let first = store
            .resolve_action(TenantId(1), id, ActionStatus::Approved, None)
            .await
            .unwrap();
        let second = store
            .resolve_action(TenantId(1), id, ActionStatus::Approved, None)
            .await
            .unwrap();
        assert!(first, "first resolution moves pending → approved");
        assert!(!second, "second resolution is a no-op");
    }

    #[tokio::test]
    async fn test_resolve_action_wrong_tenant_is_noop() {
        let store = MemStore::new();
        let id = store
            .create_action(&NewAction {
                tenant_id: TenantId(1),
                chatbot_id: ChatbotId(2),
                contact_id: ContactId(1),
                request_type: "help_needed".to_string(),
                request_details: "x".to_string(),
                request_data: None,
                priority: ActionPriority::Low,
            })
            .await
            .unwrap();

        let resolved = store
            .resolve_action(TenantId(99), id, ActionStatus::Denied, None)
            .await
            .unwrap();
        assert!(!resolved, "a mismatched tenant must touch zero rows");
    }

    #[tokio::test]
    async fn test_delivery_report_updates_known_row_only() {
        let store = MemStore::new();
        let unknown = store
            .update_status_by_provider_id("nope", "delivered", None)
            .await
            .unwrap();
        assert!(unknown.is_none());

        store.insert_message(&incoming(1, 1, "wamid-9")).await.unwrap();
        let updated = store
            .update_status_by_provider_id("wamid-9", "read", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.tenant_id, TenantId(1));
    }

    #[tokio::test]
    async fn test_usage_accumulates() {
        let store = MemStore::new();
        store.record_outbound(TenantId(1), 1).await.unwrap();
        store.record_outbound(TenantId(1), 1).await.unwrap();
        let snap = store.usage_snapshot(TenantId(1)).await.unwrap();
        assert_eq!(snap.daily_outbound, 2);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}

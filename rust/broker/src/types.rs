/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Core vocabulary shared across the pipeline. Tenant, chatbot and contact
//! ids are newtypes so that a store or transport call missing its tenant is a
//! compile error, not a runtime surprise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

// ---------------------------------------------------------------------------
// Typed identifiers
// ---------------------------------------------------------------------------

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_newtype!(TenantId);
id_newtype!(ChatbotId);
id_newtype!(ContactId);
id_newtype!(MessageId);
id_newtype!(ActionId);

// ---------------------------------------------------------------------------
// Message vocabulary
// ---------------------------------------------------------------------------

/// Direction of a message row on the transcript. `Internal` rows are never
/// transmitted to the BSP; `Manual` rows bypass the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    Manual,
    Internal,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Manual => "manual",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            "manual" => Some(Self::Manual),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Persisted message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Location,
    Template,
    ActionIndicator,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
            Self::Location => "location",
            Self::Template => "template",
            Self::ActionIndicator => "action_indicator",
        }
    }

    /// Whether this kind carries a downloadable media payload.
    #[must_use]
    pub fn is_media(self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Video | Self::Document)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Approved,
    Denied,
    Cancelled,
}

impl ActionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states cannot be resolved again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

impl ActionPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Whitelist parse; anything outside low|medium|high is rejected.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation key and turns
// ---------------------------------------------------------------------------

/// The unit coalescing and single-flight are keyed on. The same customer
/// MSISDN under two tenants is two independent conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub tenant_id: TenantId,
    pub contact_id: ContactId,
}

impl ConversationKey {
    #[must_use]
    pub fn new(tenant_id: TenantId, contact_id: ContactId) -> Self {
        Self {
            tenant_id,
            contact_id,
        }
    }

    /// Stable shard index for lock striping.
    #[must_use]
    pub fn shard(&self, shard_count: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() as usize) % shard_count.max(1)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.contact_id)
    }
}

/// One normalized inbound BSP record, carried through the debouncer so the
/// worker can persist one row per originating record.
#[derive(Debug, Clone)]
pub struct TurnPiece {
    pub provider_message_id: String,
    pub kind: MessageKind,
    /// Raw text as persisted on the transcript.
    pub text: Option<String>,
    /// What the agent should read for this piece (captions, placeholders,
    /// location summaries). `None` contributes nothing to the merged turn.
    pub agent_text: Option<String>,
    pub content_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

/// A coalesced unit of conversation scheduled through the worker pool.
#[derive(Debug, Clone)]
pub struct Turn {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub contact_id: ContactId,
    pub thread_id: String,
    pub agent_id: String,
    pub from_number: String,
    pub sender_msisdn: String,
    pub merged_text: String,
    pub pieces: Vec<TurnPiece>,
    pub first_arrival: DateTime<Utc>,
    pub last_arrival: DateTime<Utc>,
    pub language_hint: Option<String>,
}

impl Turn {
    #[must_use]
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.tenant_id, self.contact_id)
    }

    /// Media pieces (attachments) collected separately from merged text.
    #[must_use]
    pub fn attachments(&self) -> Vec<&TurnPiece> {
        self.pieces.iter().filter(|p| p.kind.is_media()).collect()
    }
}

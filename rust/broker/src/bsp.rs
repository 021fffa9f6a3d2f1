/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! BSP webhook envelope: normalization of inbound message records and
//! delivery reports. Records are parsed one by one — a malformed record is
//! logged and skipped without failing the batch.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::types::MessageKind;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Raw webhook body: a list of result records. Each record is either an
/// inbound message or a delivery report; we keep them as raw JSON so one bad
/// record cannot poison the batch.
#[derive(Deserialize, Debug)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
}

/// A successfully parsed record.
#[derive(Debug, Clone)]
pub enum WebhookRecord {
    Inbound(InboundRecord),
    Report(DeliveryReport),
}

/// One normalized inbound message.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub provider_message_id: String,
    pub from_number: String,
    pub to_number: String,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub content_url: Option<String>,
    pub location: Option<InboundLocation>,
    pub contact_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InboundLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
    pub address: Option<String>,
}

/// A delivery status callback for a previously sent message.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    fn from_group_name(group: &str) -> Option<Self> {
        match group.to_ascii_uppercase().as_str() {
            "SENT" | "PENDING" | "ACCEPTED" => Some(Self::Sent),
            "DELIVERED" | "DELIVERED_TO_HANDSET" => Some(Self::Delivered),
            "SEEN" | "READ" => Some(Self::Read),
            "UNDELIVERABLE" | "REJECTED" | "EXPIRED" | "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Record parsing
// ---------------------------------------------------------------------------

/// Parse the whole envelope, skipping (and logging) malformed records.
#[must_use]
pub fn parse_envelope(envelope: &WebhookEnvelope) -> Vec<WebhookRecord> {
    let mut records = Vec::with_capacity(envelope.results.len());
    for (idx, raw) in envelope.results.iter().enumerate() {
        match parse_record(raw) {
            Some(record) => records.push(record),
            None => warn!(index = idx, "skipping unrecognizable webhook record"),
        }
    }
    records
}

/// Parse a single record. A record carrying a `status` object is a delivery
/// report; a record carrying a `message` object is an inbound message.
#[must_use]
pub fn parse_record(raw: &serde_json::Value) -> Option<WebhookRecord> {
    let message_id = raw.get("messageId").and_then(|v| v.as_str())?;

    if let Some(status) = raw.get("status").and_then(|v| v.as_object()) {
        let group = status.get("groupName").and_then(|v| v.as_str())?;
        let mapped = DeliveryStatus::from_group_name(group)?;
        return Some(WebhookRecord::Report(DeliveryReport {
            provider_message_id: message_id.to_string(),
            status: mapped,
            description: status
                .get("description")
                .and_then(|v| v.as_str())
                .map(String::from),
        }));
    }

    let message = raw.get("message")?.as_object()?;
    let from_number = raw.get("from").and_then(|v| v.as_str())?.to_string();
    let to_number = raw.get("to").and_then(|v| v.as_str())?.to_string();

    let kind = match message
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_ascii_uppercase)
        .as_deref()
    {
        Some("TEXT") => MessageKind::Text,
        Some("IMAGE") => MessageKind::Image,
        Some("AUDIO" | "VOICE") => MessageKind::Audio,
        Some("VIDEO") => MessageKind::Video,
        Some("DOCUMENT") => MessageKind::Document,
        Some("LOCATION") => MessageKind::Location,
        Some("BUTTON" | "TEMPLATE_REPLY" | "INTERACTIVE_BUTTON_REPLY") => MessageKind::Template,
        _ => return None,
    };

    let text = message
        .get("text")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| {
            // Template replies carry the pressed button text under `payload`.
            message
                .get("payload")
                .and_then(|v| v.as_str())
                .map(String::from)
        });

    let content_url = message
        .get("url")
        .and_then(|v| v.as_str())
        .map(String::from);

    // Location can arrive as a nested object or as flat lat/lon fields.
    let location = if kind == MessageKind::Location {
        parse_location(message)
    } else {
        None
    };
    if kind == MessageKind::Location && location.is_none() {
        return None;
    }

    let contact_name = raw
        .get("contact")
        .and_then(|c| c.get("name"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let received_at = raw
        .get("receivedAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));

    Some(WebhookRecord::Inbound(InboundRecord {
        provider_message_id: message_id.to_string(),
        from_number,
        to_number,
        kind,
        text,
        content_url,
        location,
        contact_name,
        received_at,
    }))
}

fn parse_location(message: &serde_json::Map<String, serde_json::Value>) -> Option<InboundLocation> {
    let obj = message
        .get("location")
        .and_then(|v| v.as_object())
        .unwrap_or(message);
    let latitude = obj.get("latitude").and_then(serde_json::Value::as_f64)?;
    let longitude = obj.get("longitude").and_then(serde_json::Value::as_f64)?;
    Some(InboundLocation {
        latitude,
        longitude,
        name: obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(String::from),
        address: obj
            .get("address")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

impl InboundRecord {
    /// The text the agent should see for this record. Media without captions
    /// yields a bracketed placeholder; locations yield a coordinate summary
    /// an agent can reason about.
    #[must_use]
    pub fn agent_text(&self) -> Option<String> {
        if let Some(ref t) = self.text {
            if !t.trim().is_empty() {
                return Some(t.clone());
            }
        }
        match self.kind {
            MessageKind::Location => self.location.as_ref().map(|loc| {
                let mut line = format!(
                    "Customer shared a location: {:.6}, {:.6}",
                    loc.latitude, loc.longitude
                );
                if let Some(ref name) = loc.name {
                    line.push_str(&format!(" ({name})"));
                }
                if let Some(ref addr) = loc.address {
                    line.push_str(&format!(", {addr}"));
                }
                line
            }),
            MessageKind::Image => Some("[Customer sent an image]".to_string()),
            MessageKind::Audio => Some("[Customer sent a voice message]".to_string()),
            MessageKind::Video => Some("[Customer sent a video]".to_string()),
            MessageKind::Document => Some("[Customer sent a document]".to_string()),
            _ => None,
        }
    }

    /// Metadata blob persisted with the incoming row.
    #[must_use]
    pub fn row_metadata(&self) -> Option<serde_json::Value> {
        match self.kind {
            MessageKind::Location => self.location.as_ref().map(|loc| {
                serde_json::json!({
                    "location": {
                        "latitude": loc.latitude,
                        "longitude": loc.longitude,
                        "name": loc.name,
                        "address": loc.address,
                    }
                })
            }),
            MessageKind::Audio => Some(serde_json::json!({ "needs_transcription": true })),
            _ => None,
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

    fn envelope(body: &str) -> WebhookEnvelope {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_parse_text_record() {
        let env = envelope(
            r#"{"results":[{
                "messageId":"wamid-1",
                "from":"9613451652",
                "to":"96179374241",
                "message":{"type":"TEXT","text":"price?"},
                "contact":{"name":"Rana"},
                "receivedAt":"2026-03-01T10:15:00Z"
            }]}"#,
        );
        let records = parse_envelope(&env);
        assert_eq!(records.len(), 1);
        match &records[0] {
            WebhookRecord::Inbound(r) => {
                assert_eq!(r.provider_message_id, "wamid-1");
                assert_eq!(r.from_number, "9613451652");
                assert_eq!(r.to_number, "96179374241");
                assert_eq!(r.kind, MessageKind::Text);
                assert_eq!(r.text.as_deref(), Some("price?"));
                assert_eq!(r.contact_name.as_deref(), Some("Rana"));
            }
            WebhookRecord::Report(_) => panic!("expected inbound record"),
        }
    }

    #[test]
    fn test_parse_skips_malformed_record_keeps_good_one() {
        let env = envelope(
            r#"{"results":[
                {"bogus": true},
                {"messageId":"m2","from":"1","to":"2","message":{"type":"TEXT","text":"hi"}}
            ]}"#,
        );
        let records = parse_envelope(&env);
        assert_eq!(records.len(), 1, "bad record skipped, good one kept");
    }

    #[test]
    fn test_parse_location_nested_and_flat() {
        let nested = envelope(
            r#"{"results":[{
                "messageId":"m3","from":"1","to":"2",
                "message":{"type":"LOCATION","location":{"latitude":33.9,"longitude":35.6,"name":"Jounieh"}}
            }]}"#,
        );
        let flat = envelope(
            r#"{"results":[{
                "messageId":"m4","from":"1","to":"2",
                "message":{"type":"LOCATION","latitude":33.9,"longitude":35.6}
            }]}"#,
        );
        for env in [nested, flat] {
            let records = parse_envelope(&env);
            match &records[0] {
                WebhookRecord::Inbound(r) => {
                    let loc = r.location.as_ref().unwrap();
                    assert!((loc.latitude - 33.9).abs() < 1e-9);
                    assert!((loc.longitude - 35.6).abs() < 1e-9);
                }
                WebhookRecord::Report(_) => panic!("expected inbound record"),
            }
        }
    }

    #[test]
    fn test_location_without_coordinates_is_skipped() {
        let env = envelope(
            r#"{"results":[{
                "messageId":"m5","from":"1","to":"2",
                "message":{"type":"LOCATION","name":"nowhere"}
            }]}"#,
        );
        assert!(parse_envelope(&env).is_empty());
    }

    #[test]
    fn test_parse_delivery_report() {
        let env = envelope(
            r#"{"results":[{
                "messageId":"out-77",
                "to":"9613451652",
                "status":{"groupName":"DELIVERED","name":"DELIVERED_TO_HANDSET","description":"ok"}
            }]}"#,
        );
        let records = parse_envelope(&env);
        match &records[0] {
            WebhookRecord::Report(r) => {
                assert_eq!(r.provider_message_id, "out-77");
                assert_eq!(r.status, DeliveryStatus::Delivered);
            }
            WebhookRecord::Inbound(_) => panic!("expected delivery report"),
        }
    }

    #[test]
    fn test_report_status_mapping() {
        assert_eq!(
            DeliveryStatus::from_group_name("SEEN"),
            Some(DeliveryStatus::Read)
        );
        assert_eq!(
            DeliveryStatus::from_group_name("undeliverable"),
            Some(DeliveryStatus::Failed)
        );
        assert_eq!(DeliveryStatus::from_group_name("MYSTERY"), None);
    }

    #[test]
    fn test_agent_text_for_media_without_caption() {
        let env = envelope(
            r#"{"results":[{
                "messageId":"m6","from":"1","to":"2",
                "message":{"type":"IMAGE","url":"https://media.example/abc"}
            }]}"#,
        );
        match &parse_envelope(&env)[0] {
            WebhookRecord::Inbound(r) => {
                assert_eq!(r.agent_text().as_deref(), Some("[Customer sent an image]"));
                assert_eq!(r.content_url.as_deref(), Some("https://media.example/abc"));
            }
            WebhookRecord::Report(_) => panic!("expected inbound"),
        }
    }

    #[test]
    fn test_audio_rows_tagged_for_transcription() {
        let env = envelope(
            r#"{"results":[{
                "messageId":"m7","from":"1","to":"2",
                "message":{"type":"AUDIO","url":"https://media.example/voice.ogg"}
            }]}"#,
        );
        match &parse_envelope(&env)[0] {
            WebhookRecord::Inbound(r) => {
                let meta = r.row_metadata().unwrap();
                assert_eq!(meta["needs_transcription"], serde_json::json!(true));
            }
            WebhookRecord::Report(_) => panic!("expected inbound"),
        }
    }

    #[test]
    fn test_template_reply_payload_text() {
        let env = envelope(
            r#"{"results":[{
                "messageId":"m8","from":"1","to":"2",
                "message":{"type":"BUTTON","payload":"Track my order"}
            }]}"#,
        );
        match &parse_envelope(&env)[0] {
            WebhookRecord::Inbound(r) => {
                assert_eq!(r.kind, MessageKind::Template);
                assert_eq!(r.text.as_deref(), Some("Track my order"));
            }
            WebhookRecord::Report(_) => panic!("expected inbound"),
        }
    }
}

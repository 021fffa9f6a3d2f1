/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Typed tool calls the agent may invoke, and their execution. Every
//! execution is tenant-scoped: tenant, chatbot and contact come from the
//! worker's turn context, never from tool arguments, and the destination
//! number must be the contact this turn is running for.

use std::sync::Arc;

use base64::Engine;
use serde_json::json;
use tracing::info;
use waspline_config::Config;
use waspline_fs::{MediaKind, MediaStore};

use crate::agent::TurnContext;
use crate::broadcast::{BroadcastEvent, BroadcastHub, EventKind};
use crate::router::normalize_msisdn;
use crate::store::{NewAction, NewMessage, Store};
use crate::transport::MessagingTransport;
use crate::types::{ActionPriority, Direction, MessageKind};
use crate::usage::UsageGuard;

pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;
pub const MAX_REQUEST_TYPE_CHARS: usize = 100;
pub const MAX_REQUEST_DETAILS_CHARS: usize = 2000;
pub const MAX_REQUEST_DATA_BYTES: usize = 10_240;
pub const MAX_LOCATION_NAME_CHARS: usize = 1000;
pub const MAX_TEMPLATE_VARIABLES: usize = 10;

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// Closed sum of the tools the core executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    SendImage {
        to_number: String,
        image_url: String,
        caption: Option<String>,
    },
    SendLocation {
        to_number: String,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    SendTemplate {
        to_number: String,
        template_name: String,
        variables: Vec<String>,
        buttons: Vec<String>,
    },
    SubmitAction {
        request_type: String,
        request_details: String,
        priority: ActionPriority,
        request_data: Option<serde_json::Value>,
    },
    DownloadMedia {
        provider_media_url: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tenant violation: {0}")]
    TenantViolation(String),
    #[error("tool disabled: {0}")]
    Disabled(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

fn arg_str(args: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}'")))
}

fn arg_opt_str(args: &serde_json::Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn arg_f64(args: &serde_json::Value, key: &str) -> Result<f64, ToolError> {
    args.get(key)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing numeric '{key}'")))
}

fn arg_str_list(args: &serde_json::Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Exact-boundary coordinate validation: ±90 / ±180 inclusive, anything
/// beyond by any epsilon rejected.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ToolError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ToolError::InvalidArguments(format!(
            "latitude {latitude} outside [-90, 90]"
        )));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ToolError::InvalidArguments(format!(
            "longitude {longitude} outside [-180, 180]"
        )));
    }
    Ok(())
}

fn validate_image_url(url: &str) -> Result<(), ToolError> {
    let parsed = url::Url::parse(url)
        .map_err(|_| ToolError::InvalidArguments(format!("invalid image_url '{url}'")))?;
    if parsed.scheme() != "https" {
        return Err(ToolError::InvalidArguments(
            "image_url must use https".to_string(),
        ));
    }
    Ok(())
}

/// Size/type gate applied to the HEAD response for an image URL.
pub fn validate_image_head(
    content_length: Option<u64>,
    content_type: Option<&str>,
) -> Result<(), ToolError> {
    if let Some(len) = content_length {
        if len > MAX_IMAGE_BYTES {
            return Err(ToolError::InvalidArguments(format!(
                "image is {len} bytes, cap is {MAX_IMAGE_BYTES}"
            )));
        }
    }
    if let Some(ct) = content_type {
        if MediaKind::from_content_type(ct) != Some(MediaKind::Image) {
            return Err(ToolError::InvalidArguments(format!(
                "unsupported image content type '{ct}'"
            )));
        }
    }
    Ok(())
}

fn validate_request_data(data: &serde_json::Value) -> Result<(), ToolError> {
    if !data.is_object() {
        return Err(ToolError::InvalidArguments(
            "request_data must be a JSON object".to_string(),
        ));
    }
    let encoded = serde_json::to_vec(data)
        .map_err(|e| ToolError::InvalidArguments(format!("request_data not serializable: {e}")))?;
    if encoded.len() > MAX_REQUEST_DATA_BYTES {
        return Err(ToolError::InvalidArguments(format!(
            "request_data is {} bytes, cap is {MAX_REQUEST_DATA_BYTES}",
            encoded.len()
        )));
    }
    Ok(())
}

impl ToolCall {
    /// Parse and validate a `(name, arguments)` pair emitted by an agent.
    ///
    /// # Errors
    ///
    /// Returns `ToolError` for unknown tools and argument violations; the
    /// worker feeds the error back to the agent as a tool result so it can
    /// correct itself.
    pub fn parse(name: &str, args: &serde_json::Value) -> Result<Self, ToolError> {
        match name {
            "send_image" => {
                let image_url = arg_str(args, "image_url")?;
                validate_image_url(&image_url)?;
                Ok(Self::SendImage {
                    to_number: arg_str(args, "to_number")?,
                    image_url,
                    caption: arg_opt_str(args, "caption"),
                })
            }
            "send_location" => {
                let latitude = arg_f64(args, "lat")?;
                let longitude = arg_f64(args, "lon")?;
                validate_coordinates(latitude, longitude)?;
                let name = arg_opt_str(args, "name");
                let address = arg_opt_str(args, "address");
                for (field, value) in [("name", &name), ("address", &address)] {
                    if let Some(v) = value {
                        if v.chars().count() > MAX_LOCATION_NAME_CHARS {
                            return Err(ToolError::InvalidArguments(format!(
                                "{field} exceeds {MAX_LOCATION_NAME_CHARS} characters"
                            )));
                        }
                    }
                }
                Ok(Self::SendLocation {
                    to_number: arg_str(args, "to_number")?,
                    latitude,
                    longitude,
                    name,
                    address,
                })
            }
            "send_template" => {
                let variables = arg_str_list(args, "variables");
                if variables.len() > MAX_TEMPLATE_VARIABLES {
                    return Err(ToolError::InvalidArguments(format!(
                        "at most {MAX_TEMPLATE_VARIABLES} template variables"
                    )));
                }
                Ok(Self::SendTemplate {
                    to_number: arg_str(args, "to_number")?,
                    template_name: arg_str(args, "template_name")?,
                    variables,
                    buttons: arg_str_list(args, "buttons"),
                })
            }
            "submit_action" => {
                let request_type = arg_str(args, "request_type")?;
                if request_type.chars().count() > MAX_REQUEST_TYPE_CHARS {
                    return Err(ToolError::InvalidArguments(format!(
                        "request_type exceeds {MAX_REQUEST_TYPE_CHARS} characters"
                    )));
                }
                let request_details = arg_str(args, "request_details")?;
                if request_details.chars().count() > MAX_REQUEST_DETAILS_CHARS {
                    return Err(ToolError::InvalidArguments(format!(
                        "request_details exceeds {MAX_REQUEST_DETAILS_CHARS} characters"
                    )));
                }
                let priority = match args.get("priority").and_then(|v| v.as_str()) {
                    None => ActionPriority::Medium,
                    Some(raw) => ActionPriority::parse(raw).ok_or_else(|| {
                        ToolError::InvalidArguments(format!(
                            "priority must be one of low|medium|high, got '{raw}'"
                        ))
                    })?,
                };
                let request_data = match args.get("request_data") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(data) => {
                        validate_request_data(data)?;
                        Some(data.clone())
                    }
                };
                Ok(Self::SubmitAction {
                    request_type,
                    request_details,
                    priority,
                    request_data,
                })
            }
            "download_media" => Ok(Self::DownloadMedia {
                provider_media_url: arg_str(args, "provider_media_url")?,
            }),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// The destination this call sends to, when it sends anywhere.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::SendImage { to_number, .. }
            | Self::SendLocation { to_number, .. }
            | Self::SendTemplate { to_number, .. } => Some(to_number),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Executes validated tool calls against the tenant's transport and store.
pub struct ToolExecutor {
    store: Arc<dyn Store>,
    hub: Arc<BroadcastHub>,
    usage: Arc<UsageGuard>,
    probe_client: reqwest::Client,
    media: MediaStore,
    max_download_bytes: u64,
    actions_enabled: bool,
    default_language: String,
}

impl ToolExecutor {
    /// # Errors
    ///
    /// Returns `ToolError::Execution` when the probe client cannot be built.
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        hub: Arc<BroadcastHub>,
        usage: Arc<UsageGuard>,
    ) -> Result<Self, ToolError> {
        let probe_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ToolError::Execution(format!("probe client build failed: {e}")))?;
        Ok(Self {
            store,
            hub,
            usage,
            probe_client,
            media: MediaStore::new(&config.media.attachments_dir),
            max_download_bytes: config.media.max_download_bytes,
            actions_enabled: config.features.actions_center,
            default_language: "en".to_string(),
        })
    }

    /// Run one call. The returned JSON becomes the tool result echoed to the
    /// agent.
    ///
    /// # Errors
    ///
    /// `ToolError` for tenant violations and transport/store failures.
    pub async fn execute(
        &self,
        ctx: &TurnContext,
        transport: &dyn MessagingTransport,
        call: ToolCall,
    ) -> Result<serde_json::Value, ToolError> {
        // Agents may only message the contact this turn runs for.
        if let Some(to) = call.destination() {
            let to_norm = normalize_msisdn(to)
                .ok_or_else(|| ToolError::InvalidArguments(format!("bad to_number '{to}'")))?;
            let from_norm = normalize_msisdn(&ctx.from_number).ok_or_else(|| {
                ToolError::Execution("turn context has an invalid from_number".to_string())
            })?;
            if to_norm != from_norm {
                return Err(ToolError::TenantViolation(format!(
                    "tool attempted to send to {to_norm}, turn contact is {from_norm}"
                )));
            }
        }

        match call {
            ToolCall::SendImage {
                image_url, caption, ..
            } => {
                // Probe the public URL before asking the BSP to fetch it.
                if let Ok(head) = self.probe_client.head(&image_url).send().await {
                    let length = head
                        .headers()
                        .get(reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let content_type = head
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    validate_image_head(length, content_type.as_deref())?;
                }

                let response = transport
                    .send_image(&ctx.from_number, &image_url, caption.as_deref())
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let message_id = self
                    .store
                    .insert_message(&NewMessage {
                        tenant_id: ctx.tenant_id,
                        chatbot_id: ctx.chatbot_id,
                        contact_id: ctx.contact_id,
                        provider_message_id: response.provider_message_id.clone(),
                        direction: Direction::Outgoing,
                        kind: MessageKind::Image,
                        content_text: caption.clone(),
                        content_url: Some(image_url.clone()),
                        status: response.status.clone(),
                        metadata: Some(json!({ "tool": "send_image" })),
                        user_sent: false,
                        ai_processed: false,
                        processing_duration_ms: None,
                    })
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let _ = self.usage.record_outbound(ctx.tenant_id).await;
                self.hub.publish(&BroadcastEvent::new(
                    EventKind::MessageOutgoing,
                    ctx.tenant_id,
                    json!({
                        "contact_id": ctx.contact_id,
                        "message_type": "image",
                        "content_url": image_url,
                    }),
                ));
                info!(tenant_id = %ctx.tenant_id, contact_id = %ctx.contact_id, "tool sent image");
                Ok(json!({
                    "success": response.is_accepted(),
                    "status": response.status,
                    "message_id": message_id.map(|m| m.0),
                }))
            }
            ToolCall::SendLocation {
                latitude,
                longitude,
                name,
                address,
                ..
            } => {
                let response = transport
                    .send_location(
                        &ctx.from_number,
                        latitude,
                        longitude,
                        name.as_deref(),
                        address.as_deref(),
                    )
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let message_id = self
                    .store
                    .insert_message(&NewMessage {
                        tenant_id: ctx.tenant_id,
                        chatbot_id: ctx.chatbot_id,
                        contact_id: ctx.contact_id,
                        provider_message_id: response.provider_message_id.clone(),
                        direction: Direction::Outgoing,
                        kind: MessageKind::Location,
                        content_text: name.clone(),
                        content_url: None,
                        status: response.status.clone(),
                        metadata: Some(json!({
                            "tool": "send_location",
                            "location": {
                                "latitude": latitude,
                                "longitude": longitude,
                                "name": name,
                                "address": address,
                            },
                        })),
                        user_sent: false,
                        ai_processed: false,
                        processing_duration_ms: None,
                    })
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let _ = self.usage.record_outbound(ctx.tenant_id).await;
                self.hub.publish(&BroadcastEvent::new(
                    EventKind::MessageOutgoing,
                    ctx.tenant_id,
                    json!({
                        "contact_id": ctx.contact_id,
                        "message_type": "location",
                    }),
                ));
                Ok(json!({
                    "success": response.is_accepted(),
                    "status": response.status,
                    "message_id": message_id.map(|m| m.0),
                }))
            }
            ToolCall::SendTemplate {
                template_name,
                variables,
                buttons,
                ..
            } => {
                let response = transport
                    .send_template(
                        &ctx.from_number,
                        &template_name,
                        &variables,
                        &buttons,
                        ctx.language_hint.as_deref().unwrap_or(&self.default_language),
                    )
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let message_id = self
                    .store
                    .insert_message(&NewMessage {
                        tenant_id: ctx.tenant_id,
                        chatbot_id: ctx.chatbot_id,
                        contact_id: ctx.contact_id,
                        provider_message_id: response.provider_message_id.clone(),
                        direction: Direction::Outgoing,
                        kind: MessageKind::Template,
                        content_text: Some(template_name.clone()),
                        content_url: None,
                        status: response.status.clone(),
                        metadata: Some(json!({
                            "tool": "send_template",
                            "template_name": template_name,
                            "variables": variables,
                            "buttons": buttons,
                        })),
                        user_sent: false,
                        ai_processed: false,
                        processing_duration_ms: None,
                    })
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let _ = self.usage.record_outbound(ctx.tenant_id).await;
                self.hub.publish(&BroadcastEvent::new(
                    EventKind::MessageOutgoing,
                    ctx.tenant_id,
                    json!({
                        "contact_id": ctx.contact_id,
                        "message_type": "template",
                    }),
                ));
                Ok(json!({
                    "success": response.is_accepted(),
                    "status": response.status,
                    "message_id": message_id.map(|m| m.0),
                }))
            }
            ToolCall::SubmitAction {
                request_type,
                request_details,
                priority,
                request_data,
            } => {
                if !self.actions_enabled {
                    return Err(ToolError::Disabled("actions center is off".to_string()));
                }
                let action_id = self
                    .store
                    .create_action(&NewAction {
                        tenant_id: ctx.tenant_id,
                        chatbot_id: ctx.chatbot_id,
                        contact_id: ctx.contact_id,
                        request_type: request_type.clone(),
                        request_details: request_details.clone(),
                        request_data,
                        priority,
                    })
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                // Internal indicator row: shown on the dashboard transcript,
                // never transmitted to the BSP.
                let indicator = json!({
                    "action_id": action_id,
                    "request_type": request_type,
                    "status": "pending",
                    "priority": priority.as_str(),
                });
                let truncated: String = request_details.chars().take(100).collect();
                let _ = self
                    .store
                    .insert_message(&NewMessage {
                        tenant_id: ctx.tenant_id,
                        chatbot_id: ctx.chatbot_id,
                        contact_id: ctx.contact_id,
                        provider_message_id: None,
                        direction: Direction::Internal,
                        kind: MessageKind::ActionIndicator,
                        content_text: Some(indicator.to_string()),
                        content_url: None,
                        status: "indicator".to_string(),
                        metadata: Some(json!({
                            "action_id": action_id,
                            "internal_only": true,
                            "original_request": truncated,
                        })),
                        user_sent: false,
                        ai_processed: false,
                        processing_duration_ms: None,
                    })
                    .await;

                self.hub.publish(&BroadcastEvent::new(
                    EventKind::ActionCreated,
                    ctx.tenant_id,
                    json!({
                        "action_id": action_id,
                        "contact_id": ctx.contact_id,
                        "request_type": request_type,
                        "priority": priority.as_str(),
                    }),
                ));
                info!(tenant_id = %ctx.tenant_id, action_id = %action_id, "action request created");
                Ok(json!({ "success": true, "action_id": action_id.0, "status": "pending" }))
            }
            ToolCall::DownloadMedia { provider_media_url } => {
                let download = transport
                    .download_media(&provider_media_url, self.max_download_bytes)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                let stored = self
                    .media
                    .store(ctx.tenant_id.0, &download.content_type, &download.bytes)
                    .map_err(|e| ToolError::Execution(e.to_string()))?;

                Ok(json!({
                    "success": true,
                    "content_type": download.content_type,
                    "size_bytes": stored.size_bytes,
                    "sha256": stored.sha256,
                    "stored_path": stored.relative_path,
                    "data_base64":
                        base64::engine::general_purpose::STANDARD.encode(&download.bytes),
                }))
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

    #[test]
    fn test_parse_unknown_tool() {
        let err = ToolCall::parse("launch_rocket", &json!({})).unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[test]
    fn test_coordinates_boundaries_inclusive() {
        assert!(validate_coordinates(-90.0, -180.0).is_ok());
        assert!(validate_coordinates(90.0, 180.0).is_ok());
        assert!(validate_coordinates(0.0, 0.0).is_ok());
        assert!(validate_coordinates(90.0000001, 0.0).is_err());
        assert!(validate_coordinates(-90.0000001, 0.0).is_err());
        assert!(validate_coordinates(0.0, 180.0000001).is_err());
        assert!(validate_coordinates(0.0, -180.0000001).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_image_size_cap_exact_boundary() {
        assert!(validate_image_head(Some(MAX_IMAGE_BYTES), None).is_ok());
        assert!(validate_image_head(Some(MAX_IMAGE_BYTES + 1), None).is_err());
        assert!(validate_image_head(None, Some("image/webp")).is_ok());
        assert!(validate_image_head(None, Some("video/mp4")).is_err());
    }

    #[test]
    fn test_send_image_requires_https() {
        let err = ToolCall::parse(
            "send_image",
            &json!({ "to_number": "9613451652", "image_url": "http://x.example/a.jpg" }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn test_send_location_parses_and_bounds() {
        let call = ToolCall::parse(
            "send_location",
            &json!({
                "to_number": "9613451652",
                "lat": 33.98,
                "lon": 35.62,
                "name": "Jounieh store",
            }),
        )
        .unwrap();
        match call {
            ToolCall::SendLocation { latitude, name, .. } => {
                assert!((latitude - 33.98).abs() < 1e-9);
                assert_eq!(name.as_deref(), Some("Jounieh store"));
            }
            other => panic!("expected SendLocation, got {other:?}"),
        }

        let long_name = "x".repeat(MAX_LOCATION_NAME_CHARS + 1);
        let err = ToolCall::parse(
            "send_location",
            &json!({ "to_number": "1", "lat": 0.0, "lon": 0.0, "name": long_name }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn test_submit_action_caps() {
        let ok = ToolCall::parse(
            "submit_action",
            &json!({
                "request_type": "refund_request",
                "request_details": "Customer X requests refund on order #1001",
                "priority": "high",
            }),
        )
        .unwrap();
        assert!(matches!(
            ok,
            ToolCall::SubmitAction {
                priority: ActionPriority::High,
                ..
            }
        ));

        let too_long_type = "t".repeat(MAX_REQUEST_TYPE_CHARS + 1);
        assert!(ToolCall::parse(
            "submit_action",
            &json!({ "request_type": too_long_type, "request_details": "d" }),
        )
        .is_err());

        assert!(ToolCall::parse(
            "submit_action",
            &json!({ "request_type": "x", "request_details": "d", "priority": "urgent" }),
        )
        .is_err());
    }

    #[test]
    fn test_request_data_exact_byte_boundary() {
        // {"k":"vvv…"} serializes to 8 + len bytes; pick len so the total is
        // exactly the cap, then one past it.
        let payload_len = MAX_REQUEST_DATA_BYTES - 8;
        let at_cap = json!({ "k": "v".repeat(payload_len) });
        assert_eq!(serde_json::to_vec(&at_cap).unwrap().len(), MAX_REQUEST_DATA_BYTES);
        assert!(validate_request_data(&at_cap).is_ok());

        let over_cap = json!({ "k": "v".repeat(payload_len + 1) });
        assert_eq!(
            serde_json::to_vec(&over_cap).unwrap().len(),
            MAX_REQUEST_DATA_BYTES + 1
        );
        assert!(validate_request_data(&over_cap).is_err());
    }

    #[test]
    fn test_request_data_must_be_object() {
        assert!(validate_request_data(&json!(["a", "b"])).is_err());
        assert!(validate_request_data(&json!({ "a": 1 })).is_ok());
    }

    #[test]
    fn test_template_variable_cap() {
        let vars: Vec<String> = (0..=MAX_TEMPLATE_VARIABLES).map(|i| i.to_string()).collect();
        let err = ToolCall::parse(
            "send_template",
            &json!({ "to_number": "1", "template_name": "welcome", "variables": vars }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("template variables"));
    }

    #[test]
    fn test_destination_extraction() {
        let call = ToolCall::parse(
            "send_image",
            &json!({ "to_number": "9613451652", "image_url": "https://x.example/a.jpg" }),
        )
        .unwrap();
        assert_eq!(call.destination(), Some("9613451652"));

        let action = ToolCall::parse(
            "submit_action",
            &json!({ "request_type": "x", "request_details": "d" }),
        )
        .unwrap();
        assert_eq!(action.destination(), None);
    }
}

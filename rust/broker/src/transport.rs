/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Outbound messaging transport. One configured client per tenant (sender
//! credentials differ per tenant), each with its own bounded HTTP connection
//! pool, retry policy and circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use waspline_config::Config;
use waspline_fs::MediaKind;
use waspline_runtime::{CircuitBreaker, RetryPolicy};
use waspline_secrets::SecretsProvider;

use crate::types::TenantId;

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("bsp returned {0}: {1}")]
    Status(u16, String),
    #[error("rate limited by bsp")]
    RateLimited,
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("media validation failed: {0}")]
    Media(String),
    #[error("transport failure: {0}")]
    Other(String),
}

/// Outcome of a send call: the provider-assigned message id (used later to
/// correlate delivery reports) and the provider's initial status group.
#[derive(Debug, Clone)]
pub struct MessageResponse {
    pub provider_message_id: Option<String>,
    pub status: String,
}

impl MessageResponse {
    /// Whether the BSP accepted the message for delivery.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(
            self.status.as_str(),
            "pending" | "sent" | "accepted" | "delivered"
        )
    }
}

/// A downloaded media payload plus the content type it was validated as.
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Narrow interface over the BSP wire protocol. Implementations are pluggable;
/// the pipeline never sees HTTP.
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// The business MSISDN this client sends from.
    fn sender(&self) -> &str;

    async fn send_text(&self, to: &str, text: &str) -> Result<MessageResponse, TransportError>;

    async fn send_image(
        &self,
        to: &str,
        image_url: &str,
        caption: Option<&str>,
    ) -> Result<MessageResponse, TransportError>;

    async fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: Option<&str>,
        address: Option<&str>,
    ) -> Result<MessageResponse, TransportError>;

    async fn send_template(
        &self,
        to: &str,
        template_name: &str,
        variables: &[String],
        buttons: &[String],
        language: &str,
    ) -> Result<MessageResponse, TransportError>;

    /// HEAD + GET a provider media URL, enforcing content-type and size caps.
    async fn download_media(
        &self,
        media_url: &str,
        max_bytes: u64,
    ) -> Result<MediaDownload, TransportError>;

    /// Cheap reachability probe for startup checks and /health.
    async fn probe(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Infobip-style implementation
// ---------------------------------------------------------------------------

pub struct InfobipTransport {
    sender_msisdn: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl InfobipTransport {
    /// Build a client for one tenant's sender.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Other` if the HTTP client cannot be built.
    pub fn new(
        tenant_id: TenantId,
        sender_msisdn: String,
        base_url: String,
        api_key: String,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build http client: {e}")))?;
        Ok(Self {
            sender_msisdn,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            retry,
            breaker: CircuitBreaker::new(&format!("bsp-tenant-{tenant_id}"), 5, 30),
        })
    }

    fn auth_header(&self) -> String {
        format!("App {}", self.api_key)
    }

    /// POST a message payload. 5xx and network timeouts retry with
    /// exponential backoff; 429 honors `Retry-After` and the first two
    /// occurrences do not consume the retry budget; other 4xx fail fast.
    async fn post_message(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<MessageResponse, TransportError> {
        self.breaker
            .check()
            .map_err(TransportError::CircuitOpen)?;

        let url = format!("{}{path}", self.base_url);
        let mut attempt: u32 = 0;
        let mut rate_limit_grace: u32 = 2;

        loop {
            let result = self
                .client
                .post(&url)
                .header("Authorization", self.auth_header())
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let delay = retry_after(&resp).unwrap_or_else(|| self.retry.delay_for(attempt));
                        if rate_limit_grace > 0 {
                            rate_limit_grace -= 1;
                        } else if self.retry.should_retry(attempt) {
                            attempt += 1;
                        } else {
                            self.breaker.record_failure();
                            return Err(TransportError::RateLimited);
                        }
                        warn!(url = %url, delay_ms = delay.as_millis() as u64, "bsp rate limited, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if status.is_server_error() {
                        if self.retry.should_retry(attempt) {
                            let delay = self.retry.delay_for(attempt);
                            attempt += 1;
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        self.breaker.record_failure();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(TransportError::Status(status.as_u16(), body));
                    }
                    if !status.is_success() {
                        // Client errors are not retryable; the payload is wrong.
                        self.breaker.record_failure();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(TransportError::Status(status.as_u16(), body));
                    }

                    let body: serde_json::Value = resp
                        .json()
                        .await
                        .map_err(|e| TransportError::Other(format!("bad send response: {e}")))?;
                    self.breaker.record_success();
                    return Ok(parse_send_response(&body));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_for(attempt);
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    self.breaker.record_failure();
                    return Err(TransportError::Timeout);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(TransportError::Other(e.to_string()));
                }
            }
        }
    }
}

/// Parse the BSP send response envelope: `{ "messages": [ { "messageId",
/// "status": { "groupName", … } } ] }`.
fn parse_send_response(body: &serde_json::Value) -> MessageResponse {
    let first = body
        .get("messages")
        .and_then(|m| m.as_array())
        .and_then(|arr| arr.first());
    let provider_message_id = first
        .and_then(|m| m.get("messageId"))
        .and_then(|v| v.as_str())
        .map(String::from);
    let status = first
        .and_then(|m| m.get("status"))
        .and_then(|s| s.get("groupName"))
        .and_then(|v| v.as_str())
        .map_or_else(|| "unknown".to_string(), str::to_ascii_lowercase);
    MessageResponse {
        provider_message_id,
        status,
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl MessagingTransport for InfobipTransport {
    fn sender(&self) -> &str {
        &self.sender_msisdn
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<MessageResponse, TransportError> {
        self.post_message(
            "/whatsapp/1/message/text",
            json!({
                "from": self.sender_msisdn,
                "to": to,
                "content": { "text": text },
            }),
        )
        .await
    }

    async fn send_image(
        &self,
        to: &str,
        image_url: &str,
        caption: Option<&str>,
    ) -> Result<MessageResponse, TransportError> {
        let mut content = json!({ "mediaUrl": image_url });
        if let Some(c) = caption {
            content["caption"] = json!(c);
        }
        self.post_message(
            "/whatsapp/1/message/image",
            json!({
                "from": self.sender_msisdn,
                "to": to,
                "content": content,
            }),
        )
        .await
    }

    async fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: Option<&str>,
        address: Option<&str>,
    ) -> Result<MessageResponse, TransportError> {
        let mut content = json!({ "latitude": latitude, "longitude": longitude });
        if let Some(n) = name {
            content["name"] = json!(n);
        }
        if let Some(a) = address {
            content["address"] = json!(a);
        }
        self.post_message(
            "/whatsapp/1/message/location",
            json!({
                "from": self.sender_msisdn,
                "to": to,
                "content": content,
            }),
        )
        .await
    }

    async fn send_template(
        &self,
        to: &str,
        template_name: &str,
        variables: &[String],
        buttons: &[String],
        language: &str,
    ) -> Result<MessageResponse, TransportError> {
        let mut template_data = json!({ "body": { "placeholders": variables } });
        if !buttons.is_empty() {
            let btns: Vec<serde_json::Value> = buttons
                .iter()
                .map(|b| json!({ "type": "QUICK_REPLY", "parameter": b }))
                .collect();
            template_data["buttons"] = json!(btns);
        }
        self.post_message(
            "/whatsapp/1/message/template",
            json!({
                "from": self.sender_msisdn,
                "to": to,
                "content": {
                    "templateName": template_name,
                    "templateData": template_data,
                    "language": language,
                },
            }),
        )
        .await
    }

    async fn download_media(
        &self,
        media_url: &str,
        max_bytes: u64,
    ) -> Result<MediaDownload, TransportError> {
        self.breaker
            .check()
            .map_err(TransportError::CircuitOpen)?;

        // HEAD first: reject oversize or unsupported media before pulling bytes.
        let head = self
            .client
            .head(media_url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Other(format!("media HEAD failed: {e}")))?;
        if !head.status().is_success() {
            return Err(TransportError::Status(
                head.status().as_u16(),
                "media HEAD rejected".to_string(),
            ));
        }

        let content_type = head
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let kind = MediaKind::from_content_type(&content_type)
            .ok_or_else(|| TransportError::Media(format!("unsupported media type '{content_type}'")))?;

        let cap = kind.size_cap().min(max_bytes);
        if let Some(len) = head
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            if len > cap {
                return Err(TransportError::Media(format!(
                    "media size {len} exceeds cap {cap}"
                )));
            }
        }

        let resp = self
            .client
            .get(media_url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Other(format!("media GET failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(
                resp.status().as_u16(),
                "media GET rejected".to_string(),
            ));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Other(format!("media body read failed: {e}")))?;
        // The HEAD length is advisory; enforce the cap on actual bytes too.
        if bytes.len() as u64 > cap {
            return Err(TransportError::Media(format!(
                "media size {} exceeds cap {cap}",
                bytes.len()
            )));
        }

        self.breaker.record_success();
        Ok(MediaDownload {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    async fn probe(&self) -> bool {
        // Any HTTP answer counts as reachable; only network-level failure
        // marks the transport down.
        match self.client.get(&self.base_url).send().await {
            Ok(_) => true,
            Err(e) => {
                warn!(sender = %self.sender_msisdn, error = %e, "bsp probe failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-tenant transport set
// ---------------------------------------------------------------------------

/// All configured tenant clients, keyed by tenant id.
pub struct TransportSet {
    clients: HashMap<TenantId, Arc<dyn MessagingTransport>>,
}

impl TransportSet {
    /// Build one client per tenant, resolving API keys through secrets.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when a key cannot be resolved or a client
    /// cannot be built.
    pub async fn from_config(
        config: &Config,
        secrets: &dyn SecretsProvider,
    ) -> Result<Self, TransportError> {
        let retry = RetryPolicy::new(
            Duration::from_millis(500),
            Duration::from_secs(8),
            config.bsp.max_retries,
        );
        let timeout = Duration::from_secs(config.bsp.timeout_seconds);

        let mut clients: HashMap<TenantId, Arc<dyn MessagingTransport>> = HashMap::new();
        for tenant in &config.tenants {
            let key_name = tenant
                .bsp_api_key_name
                .as_deref()
                .unwrap_or(&config.bsp.api_key_name);
            let api_key = secrets.get(key_name).await.map_err(|e| {
                TransportError::Other(format!(
                    "cannot resolve BSP key '{key_name}' for tenant {}: {e}",
                    tenant.tenant_id
                ))
            })?;
            let base_url = tenant
                .bsp_base_url
                .clone()
                .unwrap_or_else(|| config.bsp.base_url.clone());
            let transport = InfobipTransport::new(
                TenantId(tenant.tenant_id),
                tenant.sender_msisdn.clone(),
                base_url,
                api_key,
                timeout,
                retry,
            )?;
            info!(tenant_id = tenant.tenant_id, sender = %tenant.sender_msisdn, "bsp client configured");
            clients.insert(TenantId(tenant.tenant_id), Arc::new(transport));
        }
        Ok(Self { clients })
    }

    #[must_use]
    pub fn for_tenant(&self, tenant_id: TenantId) -> Option<Arc<dyn MessagingTransport>> {
        self.clients.get(&tenant_id).map(Arc::clone)
    }

    #[must_use]
    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.clients.keys().copied().collect()
    }

    /// For tests and alternate BSP implementations.
    pub fn insert(&mut self, tenant_id: TenantId, transport: Arc<dyn MessagingTransport>) {
        self.clients.insert(tenant_id, transport);
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording transport for pipeline tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

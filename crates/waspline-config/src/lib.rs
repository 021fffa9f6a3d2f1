/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub waspline: WasplineConfig,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    pub bsp: BspConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub agents: HashMap<String, AgentEndpointConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WasplineConfig {
    pub env: String,
    pub version: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password_key: String,
    #[serde(default = "default_pg_min")]
    pub min_connections: u32,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
    /// Connections held back from the worker pool for ingress handlers.
    #[serde(default = "default_pg_ingress_reserve")]
    pub ingress_reserve: u32,
}

fn default_pg_min() -> u32 {
    5
}
fn default_pg_max() -> u32 {
    20
}
fn default_pg_ingress_reserve() -> u32 {
    4
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_provider")]
    pub provider: String,
    #[serde(default)]
    pub sops_file: Option<String>,
    #[serde(default)]
    pub age_identity: Option<String>,
}

fn default_secrets_provider() -> String {
    "env".to_string()
}

/// Default BSP (Infobip-style) transport settings. Tenants may override the
/// base URL and API key per sender.
#[derive(Deserialize, Clone, Debug)]
pub struct BspConfig {
    pub base_url: String,
    pub api_key_name: String,
    #[serde(default = "default_bsp_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_bsp_retries")]
    pub max_retries: u32,
}

fn default_bsp_timeout() -> u64 {
    30
}
fn default_bsp_retries() -> u32 {
    3
}

/// One sender binding: the business MSISDN customers write to, and the
/// tenant/chatbot/agent it routes to.
#[derive(Deserialize, Clone, Debug)]
pub struct TenantConfig {
    pub tenant_id: i64,
    pub name: String,
    pub sender_msisdn: String,
    pub chatbot_id: i64,
    pub agent_id: String,
    #[serde(default = "default_daily_cap")]
    pub daily_outbound_cap: i64,
    #[serde(default = "default_monthly_cap")]
    pub monthly_outbound_cap: i64,
    #[serde(default)]
    pub bsp_base_url: Option<String>,
    #[serde(default)]
    pub bsp_api_key_name: Option<String>,
    /// Binds `X-Shopify-Shop-Domain` catalog webhooks to this tenant.
    #[serde(default)]
    pub shopify_shop_domain: Option<String>,
    #[serde(default)]
    pub shopify_secret_key: Option<String>,
}

fn default_daily_cap() -> i64 {
    1000
}
fn default_monthly_cap() -> i64 {
    30000
}

#[derive(Deserialize, Clone, Debug)]
pub struct AgentEndpointConfig {
    pub endpoint_url: String,
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub language_hint: Option<String>,
}

fn default_agent_timeout() -> u64 {
    60
}

#[derive(Deserialize, Clone, Debug)]
pub struct PipelineConfig {
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    #[serde(default = "default_debounce_floor_ms")]
    pub debounce_floor_ms: u64,
    #[serde(default = "default_max_coalesce_span")]
    pub max_coalesce_span_seconds: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_queue_send_timeout")]
    pub queue_send_timeout_ms: u64,
    #[serde(default = "default_agent_deadline")]
    pub agent_deadline_seconds: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            debounce_floor_ms: default_debounce_floor_ms(),
            max_coalesce_span_seconds: default_max_coalesce_span(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            queue_send_timeout_ms: default_queue_send_timeout(),
            agent_deadline_seconds: default_agent_deadline(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

fn default_debounce_seconds() -> u64 {
    3
}
fn default_debounce_floor_ms() -> u64 {
    10
}
fn default_max_coalesce_span() -> u64 {
    10
}
fn default_max_workers() -> usize {
    5
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_queue_send_timeout() -> u64 {
    250
}
fn default_agent_deadline() -> u64 {
    60
}
fn default_shutdown_grace() -> u64 {
    15
}

#[derive(Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_sse_buffer")]
    pub sse_buffer: usize,
    #[serde(default = "default_sse_keepalive")]
    pub sse_keepalive_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: default_broker_port(),
            cors_origins: Vec::new(),
            body_limit_bytes: default_body_limit(),
            sse_buffer: default_sse_buffer(),
            sse_keepalive_seconds: default_sse_keepalive(),
        }
    }
}

fn default_broker_port() -> u16 {
    8000
}
fn default_body_limit() -> usize {
    1_048_576
}
fn default_sse_buffer() -> usize {
    64
}
fn default_sse_keepalive() -> u64 {
    15
}

#[derive(Deserialize, Clone, Debug)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub multi_tenant: bool,
    #[serde(default = "default_true")]
    pub usage_tracking: bool,
    #[serde(default = "default_true")]
    pub actions_center: bool,
    #[serde(default = "default_true")]
    pub route_by_destination: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            multi_tenant: true,
            usage_tracking: true,
            actions_center: true,
            route_by_destination: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Clone, Debug)]
pub struct MediaConfig {
    #[serde(default = "default_attachments_dir")]
    pub attachments_dir: String,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            attachments_dir: default_attachments_dir(),
            max_image_bytes: default_max_image_bytes(),
            max_download_bytes: default_max_download_bytes(),
        }
    }
}

fn default_attachments_dir() -> String {
    "~/.waspline/attachments".to_string()
}
fn default_max_image_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_max_download_bytes() -> u64 {
    16 * 1024 * 1024
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}
fn default_sample_rate() -> f64 {
    1.0
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

impl Config {
    /// Load configuration from the file named by the `WASPLINE_CONFIG` env
    /// var (default `config.toml`), with `WASPLINE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the file is missing, malformed, or a
    /// required field is absent.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("WASPLINE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(
                config::Environment::with_prefix("WASPLINE")
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: Self = settings.try_deserialize()?;

        cfg.media.attachments_dir = expand_tilde(&cfg.media.attachments_dir);
        if let Some(ref p) = cfg.secrets.sops_file {
            cfg.secrets.sops_file = Some(expand_tilde(p));
        }
        if let Some(ref p) = cfg.secrets.age_identity {
            cfg.secrets.age_identity = Some(expand_tilde(p));
        }

        Ok(cfg)
    }

    /// Structural validation beyond what serde can express. Called once at
    /// startup; any issue is a fatal configuration error.
    ///
    /// # Errors
    ///
    /// Returns every problem found, one message per line.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.tenants.is_empty() {
            issues.push("no [[tenants]] configured — nothing to route".to_string());
        }

        let mut seen_senders: HashMap<String, i64> = HashMap::new();
        let mut seen_tenants: HashMap<i64, &str> = HashMap::new();
        for t in &self.tenants {
            if t.sender_msisdn.trim().is_empty() {
                issues.push(format!("tenant {} has an empty sender_msisdn", t.tenant_id));
            }
            if let Some(prev) = seen_senders.insert(t.sender_msisdn.trim().to_string(), t.tenant_id)
            {
                issues.push(format!(
                    "sender_msisdn {} bound to both tenant {prev} and tenant {}",
                    t.sender_msisdn, t.tenant_id
                ));
            }
            if let Some(prev) = seen_tenants.insert(t.tenant_id, t.name.as_str()) {
                issues.push(format!(
                    "tenant_id {} declared twice ({prev} and {})",
                    t.tenant_id, t.name
                ));
            }
            if !self.agents.contains_key(&t.agent_id) {
                issues.push(format!(
                    "tenant {} references unknown agent_id '{}'",
                    t.tenant_id, t.agent_id
                ));
            }
            if t.daily_outbound_cap <= 0 || t.monthly_outbound_cap <= 0 {
                issues.push(format!(
                    "tenant {} has a non-positive outbound cap",
                    t.tenant_id
                ));
            }
            if t.shopify_shop_domain.is_some() != t.shopify_secret_key.is_some() {
                issues.push(format!(
                    "tenant {} must set shopify_shop_domain and shopify_secret_key together",
                    t.tenant_id
                ));
            }
        }

        // Workers each hold a store connection while processing; keep the
        // pool large enough that ingress handlers are never starved.
        let reserved = self.postgres.ingress_reserve;
        let available = self.postgres.max_connections.saturating_sub(reserved);
        if self.pipeline.max_workers as u32 > available {
            issues.push(format!(
                "pipeline.max_workers ({}) exceeds postgres.max_connections ({}) minus ingress_reserve ({reserved})",
                self.pipeline.max_workers, self.postgres.max_connections
            ));
        }

        if self.pipeline.debounce_floor_ms == 0 {
            issues.push("pipeline.debounce_floor_ms must be at least 1".to_string());
        }
        if self.pipeline.max_coalesce_span_seconds < self.pipeline.debounce_seconds {
            issues.push(format!(
                "pipeline.max_coalesce_span_seconds ({}) is below debounce_seconds ({})",
                self.pipeline.max_coalesce_span_seconds, self.pipeline.debounce_seconds
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Look up a tenant binding by its numeric id.
    #[must_use]
    pub fn tenant(&self, tenant_id: i64) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.tenant_id == tenant_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Tests share the `WASPLINE_CONFIG` env var; serialize access so the
    /// parallel test runner cannot interleave load calls.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Helper: a valid TOML config covering all required fields, two tenants.
    fn valid_toml() -> String {
        r#"
[waspline]
env = "test"
version = "0.3.0"

[postgres]
host = "127.0.0.1"
port = 5432
database = "waspline"
user = "waspline"
password_key = "PG_PASSWORD"

[bsp]
base_url = "https://api.bsp.example"
api_key_name = "BSP_API_KEY"

[[tenants]]
tenant_id = 1
name = "Ecla"
sender_msisdn = "96179374241"
chatbot_id = 2
agent_id = "ecla"

[[tenants]]
tenant_id = 7
name = "AstroSouks"
sender_msisdn = "9613451652"
chatbot_id = 3
agent_id = "astro"
daily_outbound_cap = 500

[agents.ecla]
endpoint_url = "http://127.0.0.1:9101/run"

[agents.astro]
endpoint_url = "http://127.0.0.1:9102/run"
language_hint = "en"
"#
        .to_string()
    }

    fn load_from(toml_body: &str) -> Result<Config, config::ConfigError> {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, toml_body).unwrap();
        std::env::set_var("WASPLINE_CONFIG", config_path.to_str().unwrap());
        let out = Config::load();
        std::env::remove_var("WASPLINE_CONFIG");
        out
    }

    #[test]
    fn test_load_valid_config() {
        let cfg = load_from(&valid_toml()).unwrap();

        assert_eq!(cfg.waspline.env, "test");
        assert_eq!(cfg.postgres.port, 5432);
        assert_eq!(cfg.bsp.base_url, "https://api.bsp.example");
        assert_eq!(cfg.tenants.len(), 2);
        assert_eq!(cfg.tenants[0].sender_msisdn, "96179374241");
        assert_eq!(cfg.tenants[1].agent_id, "astro");
        assert_eq!(cfg.agents.len(), 2);
        assert!(cfg.validate().is_ok(), "sample config should validate");
    }

    #[test]
    fn test_load_missing_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("WASPLINE_CONFIG", "/tmp/waspline_nonexistent_57281.toml");
        let result = Config::load();
        std::env::remove_var("WASPLINE_CONFIG");
        assert!(result.is_err(), "loading a nonexistent file should fail");
    }

    #[test]
    fn test_pipeline_defaults() {
        let cfg = load_from(&valid_toml()).unwrap();

        assert_eq!(cfg.pipeline.debounce_seconds, 3, "debounce default is 3s");
        assert_eq!(cfg.pipeline.debounce_floor_ms, 10);
        assert_eq!(cfg.pipeline.max_coalesce_span_seconds, 10);
        assert_eq!(cfg.pipeline.max_workers, 5);
        assert_eq!(cfg.pipeline.queue_capacity, 1024);
        assert_eq!(cfg.pipeline.agent_deadline_seconds, 60);
        assert_eq!(cfg.pipeline.shutdown_grace_seconds, 15);
        assert_eq!(cfg.bsp.timeout_seconds, 30);
        assert_eq!(cfg.bsp.max_retries, 3);
    }

    #[test]
    fn test_feature_flags_default_on() {
        let cfg = load_from(&valid_toml()).unwrap();
        assert!(cfg.features.multi_tenant);
        assert!(cfg.features.usage_tracking);
        assert!(cfg.features.actions_center);
        assert!(cfg.features.route_by_destination);
    }

    #[test]
    fn test_tenant_cap_defaults() {
        let cfg = load_from(&valid_toml()).unwrap();
        assert_eq!(cfg.tenants[0].daily_outbound_cap, 1000);
        assert_eq!(cfg.tenants[0].monthly_outbound_cap, 30000);
        assert_eq!(
            cfg.tenants[1].daily_outbound_cap, 500,
            "explicit cap overrides the default"
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_sender() {
        let mut body = valid_toml();
        body.push_str(
            r#"
[[tenants]]
tenant_id = 9
name = "Dup"
sender_msisdn = "96179374241"
chatbot_id = 4
agent_id = "ecla"
"#,
        );
        let cfg = load_from(&body).unwrap();
        let issues = cfg.validate().unwrap_err();
        assert!(
            issues.iter().any(|i| i.contains("96179374241")),
            "duplicate sender_msisdn must be reported: {issues:?}"
        );
    }

    #[test]
    fn test_validate_rejects_unknown_agent() {
        let mut body = valid_toml();
        body.push_str(
            r#"
[[tenants]]
tenant_id = 11
name = "Ghost"
sender_msisdn = "96170000000"
chatbot_id = 5
agent_id = "nope"
"#,
        );
        let cfg = load_from(&body).unwrap();
        let issues = cfg.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("nope")));
    }

    #[test]
    fn test_validate_worker_pool_vs_connections() {
        let body = valid_toml().replace(
            "password_key = \"PG_PASSWORD\"",
            "password_key = \"PG_PASSWORD\"\nmax_connections = 6",
        );
        let cfg = load_from(&body).unwrap();
        let issues = cfg.validate().unwrap_err();
        assert!(
            issues.iter().any(|i| i.contains("max_workers")),
            "worker pool larger than pool minus reserve must be rejected: {issues:?}"
        );
    }

    #[test]
    fn test_tenant_lookup() {
        let cfg = load_from(&valid_toml()).unwrap();
        assert_eq!(cfg.tenant(7).map(|t| t.chatbot_id), Some(3));
        assert!(cfg.tenant(99).is_none());
    }
}

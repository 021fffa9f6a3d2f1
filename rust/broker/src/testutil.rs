/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Test-only config construction, kept off the env-var loading path so
//! parallel tests never race on `WASPLINE_CONFIG`.

use std::collections::HashMap;

use waspline_config::{
    AgentEndpointConfig, BspConfig, Config, PostgresConfig, TenantConfig, WasplineConfig,
};

/// Build a config with the given `(tenant_id, sender_msisdn, chatbot_id,
/// agent_id)` bindings. Every referenced agent gets a loopback endpoint.
pub fn test_config(tenants: &[(i64, &str, i64, &str)]) -> Config {
    let mut agents = HashMap::new();
    for (_, _, _, agent_id) in tenants {
        agents.insert(
            (*agent_id).to_string(),
            AgentEndpointConfig {
                endpoint_url: format!("http://127.0.0.1:9101/{agent_id}"),
                timeout_seconds: 5,
                language_hint: if *agent_id == "astro" {
                    Some("ar".to_string())
                } else {
                    None
                },
            },
        );
    }

    Config {
        waspline: WasplineConfig {
            env: "test".to_string(),
            version: "0.3.0".to_string(),
        },
        postgres: PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "waspline_test".to_string(),
            user: "waspline".to_string(),
            password_key: "PG_PASSWORD".to_string(),
            min_connections: 1,
            max_connections: 20,
            ingress_reserve: 4,
        },
        secrets: Default::default(),
        bsp: BspConfig {
            base_url: "https://api.bsp.example".to_string(),
            api_key_name: "BSP_API_KEY".to_string(),
            timeout_seconds: 5,
            max_retries: 3,
        },
        tenants: tenants
            .iter()
            .map(|(tenant_id, sender, chatbot_id, agent_id)| TenantConfig {
                tenant_id: *tenant_id,
                name: format!("tenant-{tenant_id}"),
                sender_msisdn: (*sender).to_string(),
                chatbot_id: *chatbot_id,
                agent_id: (*agent_id).to_string(),
                daily_outbound_cap: 1000,
                monthly_outbound_cap: 30000,
                bsp_base_url: None,
                bsp_api_key_name: None,
                shopify_shop_domain: None,
                shopify_secret_key: None,
            })
            .collect(),
        agents,
        pipeline: Default::default(),
        broker: Default::default(),
        features: Default::default(),
        media: Default::default(),
        telemetry: Default::default(),
    }
}

/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Destination-based tenant routing. The business number the customer wrote
//! *to* selects the tenant; the customer's own number never participates in
//! routing (two tenants can both have a contact +9613451652).

use std::collections::HashMap;

use waspline_config::Config;

use crate::types::{ChatbotId, TenantId};

// ---------------------------------------------------------------------------
// MSISDN normalization
// ---------------------------------------------------------------------------

/// Normalize a phone number for lookups: digits only, no `+`, no separators,
/// no leading zeros. Returns `None` when nothing usable remains or the length
/// is outside the 7..=15 digit window.
#[must_use]
pub fn normalize_msisdn(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.len() < 7 || trimmed.len() > 15 {
        return None;
    }
    Some(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Sender map
// ---------------------------------------------------------------------------

/// The resolved binding for one business sender number.
#[derive(Debug, Clone)]
pub struct Route {
    pub tenant_id: TenantId,
    pub chatbot_id: ChatbotId,
    pub agent_id: String,
    pub sender_msisdn: String,
    pub language_hint: Option<String>,
}

/// Read-mostly map `sender_msisdn → Route`, built at startup from config and
/// swapped atomically on reload.
#[derive(Debug, Default)]
pub struct SenderMap {
    routes: HashMap<String, Route>,
}

impl SenderMap {
    /// Build the map, normalizing every configured sender.
    ///
    /// # Errors
    ///
    /// Returns a message when a sender fails normalization or two tenants
    /// collide on the same normalized sender.
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let mut routes = HashMap::with_capacity(config.tenants.len());
        for tenant in &config.tenants {
            let Some(normalized) = normalize_msisdn(&tenant.sender_msisdn) else {
                return Err(format!(
                    "tenant {}: sender_msisdn '{}' is not a usable MSISDN",
                    tenant.tenant_id, tenant.sender_msisdn
                ));
            };
            let language_hint = config
                .agents
                .get(&tenant.agent_id)
                .and_then(|a| a.language_hint.clone());
            let route = Route {
                tenant_id: TenantId(tenant.tenant_id),
                chatbot_id: ChatbotId(tenant.chatbot_id),
                agent_id: tenant.agent_id.clone(),
                sender_msisdn: normalized.clone(),
                language_hint,
            };
            if let Some(previous) = routes.insert(normalized.clone(), route) {
                return Err(format!(
                    "sender {normalized} routes to both tenant {} and tenant {}",
                    previous.tenant_id, tenant.tenant_id
                ));
            }
        }
        Ok(Self { routes })
    }

    /// Resolve a destination number to its tenant binding. `None` means the
    /// event is unroutable and must be dead-lettered by the caller.
    #[must_use]
    pub fn resolve(&self, destination: &str) -> Option<&Route> {
        let normalized = normalize_msisdn(destination)?;
        self.routes.get(&normalized)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        crate::testutil::test_config(&[
            (1, "+961 79 374 241", 2, "ecla"),
            (7, "9613451652", 3, "astro"),
        ])
    }

    #[test]
    fn test_normalize_strips_plus_spaces_and_zeros() {
        assert_eq!(
            normalize_msisdn("+961 79-374(241)").as_deref(),
            Some("96179374241")
        );
        assert_eq!(normalize_msisdn("0096179374241").as_deref(), Some("96179374241"));
        assert_eq!(normalize_msisdn("96179374241").as_deref(), Some("96179374241"));
    }

    #[test]
    fn test_normalize_rejects_garbage_and_bad_lengths() {
        assert_eq!(normalize_msisdn(""), None);
        assert_eq!(normalize_msisdn("abc"), None);
        assert_eq!(normalize_msisdn("12345"), None, "too short");
        assert_eq!(normalize_msisdn("1234567890123456"), None, "too long");
    }

    #[test]
    fn test_routing_is_by_destination_not_sender() {
        let map = SenderMap::from_config(&test_config()).unwrap();
        assert!(!map.is_empty());
        assert_eq!(map.len(), 2);

        // Same customer writes to two different business numbers.
        let a = map.resolve("96179374241").unwrap();
        let b = map.resolve("9613451652").unwrap();

        assert_eq!(a.tenant_id, TenantId(1));
        assert_eq!(a.agent_id, "ecla");
        assert_eq!(b.tenant_id, TenantId(7));
        assert_eq!(b.agent_id, "astro");
        assert_eq!(b.language_hint.as_deref(), Some("ar"));
    }

    #[test]
    fn test_resolve_normalizes_destination() {
        let map = SenderMap::from_config(&test_config()).unwrap();
        assert!(map.resolve("+96179374241").is_some());
        assert!(map.resolve("0096179374241").is_some());
    }

    #[test]
    fn test_unknown_destination_is_unroutable() {
        let map = SenderMap::from_config(&test_config()).unwrap();
        assert!(map.resolve("96170000000").is_none());
    }

    #[test]
    fn test_duplicate_normalized_sender_rejected() {
        let mut cfg = test_config();
        // "+96179374241" normalizes to the same sender as tenant 1.
        let mut dup = cfg.tenants[0].clone();
        dup.tenant_id = 99;
        dup.sender_msisdn = "+96179374241".to_string();
        cfg.tenants.push(dup);

        let err = SenderMap::from_config(&cfg).unwrap_err();
        assert!(err.contains("96179374241"), "collision must be named: {err}");
    }
}

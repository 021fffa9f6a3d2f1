/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Usage accounting against subscription limits. The pre-check is advisory
//! (it may be stale by one concurrent message); the post-increment through
//! the store is authoritative. Only the outbound path is rate-limited —
//! incoming processing is never blocked on usage.

use std::collections::HashMap;
use std::sync::Arc;

use waspline_config::Config;

use crate::error::BrokerError;
use crate::store::{Store, UsageSnapshot};
use crate::types::TenantId;

/// Per-tenant caps from the subscription configuration.
#[derive(Debug, Clone, Copy)]
pub struct UsageCaps {
    pub daily_outbound_cap: i64,
    pub monthly_outbound_cap: i64,
}

/// Outcome of the quota pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageVerdict {
    WithinLimits,
    DailyCapReached,
    MonthlyCapReached,
}

impl UsageVerdict {
    #[must_use]
    pub fn is_over(self) -> bool {
        !matches!(self, Self::WithinLimits)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WithinLimits => "within_limits",
            Self::DailyCapReached => "daily_cap_reached",
            Self::MonthlyCapReached => "monthly_cap_reached",
        }
    }
}

/// Pure cap evaluation, factored out so the decision is testable without a
/// store. Daily is checked before monthly.
#[must_use]
pub fn evaluate(snapshot: UsageSnapshot, caps: UsageCaps) -> UsageVerdict {
    if snapshot.daily_outbound >= caps.daily_outbound_cap {
        UsageVerdict::DailyCapReached
    } else if snapshot.monthly_outbound >= caps.monthly_outbound_cap {
        UsageVerdict::MonthlyCapReached
    } else {
        UsageVerdict::WithinLimits
    }
}

/// Guards the outbound path for every tenant.
pub struct UsageGuard {
    store: Arc<dyn Store>,
    caps: HashMap<TenantId, UsageCaps>,
    enabled: bool,
}

impl UsageGuard {
    #[must_use]
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> Self {
        let caps = config
            .tenants
            .iter()
            .map(|t| {
                (
                    TenantId(t.tenant_id),
                    UsageCaps {
                        daily_outbound_cap: t.daily_outbound_cap,
                        monthly_outbound_cap: t.monthly_outbound_cap,
                    },
                )
            })
            .collect();
        Self {
            store,
            caps,
            enabled: config.features.usage_tracking,
        }
    }

    #[cfg(test)]
    pub fn for_tests(store: Arc<dyn Store>, tenant_id: TenantId, caps: UsageCaps) -> Self {
        let mut map = HashMap::new();
        map.insert(tenant_id, caps);
        Self {
            store,
            caps: map,
            enabled: true,
        }
    }

    /// Advisory pre-check before invoking the agent / transport.
    ///
    /// # Errors
    ///
    /// Propagates store failures; unknown tenants pass (no caps configured).
    pub async fn check(&self, tenant_id: TenantId) -> Result<UsageVerdict, BrokerError> {
        if !self.enabled {
            return Ok(UsageVerdict::WithinLimits);
        }
        let Some(caps) = self.caps.get(&tenant_id) else {
            return Ok(UsageVerdict::WithinLimits);
        };
        let snapshot = self.store.usage_snapshot(tenant_id).await?;
        Ok(evaluate(snapshot, *caps))
    }

    /// Authoritative post-increment after a successful outbound send.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record_outbound(&self, tenant_id: TenantId) -> Result<(), BrokerError> {
        if !self.enabled {
            return Ok(());
        }
        self.store.record_outbound(tenant_id, 1).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

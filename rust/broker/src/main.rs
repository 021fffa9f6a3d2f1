/*
 * Waspline - Multi-tenant WhatsApp conversation broker
 * Copyright (C) 2025–2026 Neven Kordic <neven@waspline.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Broker entry point. Wires config → secrets → store → transports → pipeline
//! → ingress, then serves until SIGINT/SIGTERM.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 store unreachable,
//! 3 transport unreachable for a tenant at startup.

mod agent;
mod broadcast;
mod bsp;
mod debounce;
mod dispatch;
mod error;
mod ingress;
mod router;
mod store;
#[cfg(test)]
mod testutil;
mod tools;
mod transport;
mod types;
mod usage;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use waspline_config::Config;
use waspline_secrets::SecretsProvider;

use crate::agent::AgentRegistry;
use crate::broadcast::BroadcastHub;
use crate::debounce::Debouncer;
use crate::dispatch::{Dispatcher, PipelineGauges, WorkerContext, WorkerPool};
use crate::ingress::{AppState, ShopifyBinding};
use crate::router::SenderMap;
use crate::store::{PgStore, Store};
use crate::tools::ToolExecutor;
use crate::transport::TransportSet;
use crate::types::TenantId;
use crate::usage::UsageGuard;

const SERVICE_NAME: &str = "waspline-broker";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_TRANSPORT: i32 = 3;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("fatal: failed to load config: {e}");
            process::exit(EXIT_CONFIG);
        }
    };

    let _telemetry_guard =
        waspline_telemetry::init_telemetry(SERVICE_NAME, SERVICE_VERSION, &config.telemetry)
            .unwrap_or_else(|e| {
                eprintln!("fatal: telemetry init failed: {e}");
                process::exit(EXIT_CONFIG);
            });

    info!(
        service = SERVICE_NAME,
        version = SERVICE_VERSION,
        env = %config.waspline.env,
        "starting broker"
    );

    if let Err(issues) = config.validate() {
        for issue in &issues {
            error!(issue = %issue, "configuration invalid");
        }
        process::exit(EXIT_CONFIG);
    }

    let sender_map = match SenderMap::from_config(&config) {
        Ok(map) => Arc::new(map),
        Err(e) => {
            error!(error = %e, "sender map construction failed");
            process::exit(EXIT_CONFIG);
        }
    };
    info!(senders = sender_map.len(), "sender map loaded");

    // Secrets
    let secrets: Arc<dyn SecretsProvider> = {
        let sc = &config.secrets;
        match waspline_secrets::create_provider(
            &sc.provider,
            sc.sops_file.as_deref(),
            sc.age_identity.as_deref(),
        ) {
            Ok(p) => Arc::from(p),
            Err(e) => {
                error!(error = %e, "failed to create secrets provider");
                process::exit(EXIT_CONFIG);
            }
        }
    };

    // Postgres pool
    let pg_password = match secrets.get(&config.postgres.password_key).await {
        Ok(pw) => pw,
        Err(e) => {
            error!(error = %e, "failed to resolve postgres password");
            process::exit(EXIT_CONFIG);
        }
    };
    let pg_url = format!(
        "postgres://{}:{}@{}:{}/{}",
        config.postgres.user,
        pg_password,
        config.postgres.host,
        config.postgres.port,
        config.postgres.database,
    );
    let pool = match PgPoolOptions::new()
        .min_connections(config.postgres.min_connections)
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&pg_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "store unreachable at startup");
            process::exit(EXIT_STORE);
        }
    };
    info!("postgres pool connected");
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));

    // Per-tenant transports, probed before accepting traffic
    let transports = match TransportSet::from_config(&config, secrets.as_ref()).await {
        Ok(set) => Arc::new(set),
        Err(e) => {
            error!(error = %e, "transport construction failed");
            process::exit(EXIT_TRANSPORT);
        }
    };
    for tenant_id in transports.tenant_ids() {
        let Some(transport) = transports.for_tenant(tenant_id) else {
            continue;
        };
        if !transport.probe().await {
            error!(tenant_id = %tenant_id, "transport unreachable at startup");
            process::exit(EXIT_TRANSPORT);
        }
    }
    info!(tenants = transports.tenant_ids().len(), "bsp transports ready");

    let agents = match AgentRegistry::from_config(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "agent registry construction failed");
            process::exit(EXIT_CONFIG);
        }
    };
    info!(agents = agents.len(), "agent registry built");

    // Pipeline plumbing
    let hub = Arc::new(BroadcastHub::new(config.broker.sse_buffer));
    let usage = Arc::new(UsageGuard::from_config(&config, Arc::clone(&store)));
    let tools = match ToolExecutor::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&usage),
    ) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = %e, "tool executor construction failed");
            process::exit(EXIT_CONFIG);
        }
    };

    let gauges = Arc::new(PipelineGauges::default());
    let (turn_tx, turn_rx) = mpsc::channel(config.pipeline.queue_capacity);
    let dispatcher = Arc::new(Dispatcher::new(
        turn_tx,
        Arc::clone(&gauges),
        Arc::clone(&hub),
        Duration::from_millis(config.pipeline.queue_send_timeout_ms),
    ));
    let debouncer = Arc::new(Debouncer::new(
        Duration::from_secs(config.pipeline.debounce_seconds),
        Duration::from_millis(config.pipeline.debounce_floor_ms),
        Duration::from_secs(config.pipeline.max_coalesce_span_seconds),
        Arc::clone(&dispatcher),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = tokio::spawn(Arc::clone(&debouncer).run(shutdown_rx.clone()));

    let worker_ctx = Arc::new(WorkerContext {
        store: Arc::clone(&store),
        agents: Arc::clone(&agents),
        transports: Arc::clone(&transports),
        tools,
        usage: Arc::clone(&usage),
        hub: Arc::clone(&hub),
        agent_deadline: Duration::from_secs(config.pipeline.agent_deadline_seconds),
    });
    let workers = WorkerPool::spawn(
        config.pipeline.max_workers,
        turn_rx,
        Arc::clone(dispatcher.in_flight()),
        Arc::clone(&gauges),
        worker_ctx,
        shutdown_rx.clone(),
    );
    info!(workers = config.pipeline.max_workers, "worker pool started");

    // Database change notifications → broadcast hub
    let bridge_hub = Arc::clone(&hub);
    let bridge_pool = pool.clone();
    let bridge_shutdown = shutdown_rx.clone();
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = store::run_notification_bridge(bridge_pool, bridge_hub, bridge_shutdown).await
        {
            error!(error = %e, "notification bridge failed");
        }
    });

    // Shopify bindings: resolve shared secrets once at startup
    let mut shopify = HashMap::new();
    for tenant in &config.tenants {
        let (Some(domain), Some(secret_key)) =
            (&tenant.shopify_shop_domain, &tenant.shopify_secret_key)
        else {
            continue;
        };
        match secrets.get(secret_key).await {
            Ok(secret) => {
                shopify.insert(
                    domain.clone(),
                    ShopifyBinding {
                        tenant_id: TenantId(tenant.tenant_id),
                        chatbot_id: crate::types::ChatbotId(tenant.chatbot_id),
                        secret,
                    },
                );
            }
            Err(e) => {
                error!(tenant_id = tenant.tenant_id, error = %e, "cannot resolve shopify secret");
                process::exit(EXIT_CONFIG);
            }
        }
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        transports: Arc::clone(&transports),
        hub: Arc::clone(&hub),
        debouncer: Arc::clone(&debouncer),
        sender_map: tokio::sync::RwLock::new(sender_map),
        gauges: Arc::clone(&gauges),
        usage,
        shopify,
        transport_ok: AtomicBool::new(true),
        started_at: std::time::Instant::now(),
    });

    // Periodic transport reachability probe for /health
    let probe_state = Arc::clone(&state);
    let mut probe_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(60)) => {
                    let mut all_ok = true;
                    for tenant_id in probe_state.transports.tenant_ids() {
                        if let Some(t) = probe_state.transports.for_tenant(tenant_id) {
                            if !t.probe().await {
                                all_ok = false;
                            }
                        }
                    }
                    probe_state.transport_ok.store(all_ok, Ordering::Relaxed);
                }
                _ = probe_shutdown.changed() => return,
            }
        }
    });

    // SIGHUP: reload the sender map atomically
    #[cfg(unix)]
    {
        let reload_state = Arc::clone(&state);
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                warn!("SIGHUP handler unavailable, sender map reload disabled");
                return;
            };
            while hangup.recv().await.is_some() {
                match Config::load().map(|c| SenderMap::from_config(&c)) {
                    Ok(Ok(map)) => {
                        let count = map.len();
                        *reload_state.sender_map.write().await = Arc::new(map);
                        info!(senders = count, "sender map reloaded on SIGHUP");
                    }
                    Ok(Err(e)) => error!(error = %e, "sender map reload rejected"),
                    Err(e) => error!(error = %e, "config reload failed"),
                }
            }
        });
    }

    // Ingress server
    let app = ingress::router(Arc::clone(&state));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.broker.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind ingress listener");
            process::exit(EXIT_CONFIG);
        }
    };
    info!(addr = %addr, "ingress listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(waspline_runtime::shutdown_signal())
        .await
    {
        error!(error = %e, "ingress server error");
    }

    // Graceful shutdown: stop accepting, let in-flight turns finish within
    // the grace budget, then cancel.
    info!("initiating graceful shutdown");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.pipeline.shutdown_grace_seconds);
    match tokio::time::timeout(grace, workers.join()).await {
        Ok(()) => info!("all workers drained"),
        Err(_) => warn!("shutdown grace of {grace:?} exceeded, cancelling workers"),
    }
    if let Err(e) = sweeper_handle.await {
        warn!(error = %e, "debounce sweeper panicked");
    }
    bridge_handle.abort();

    pool.close().await;
    info!(
        rejected = gauges.rejected_count.load(Ordering::Relaxed),
        failures = gauges.processing_failures.load(Ordering::Relaxed),
        "broker shutdown complete"
    );
}

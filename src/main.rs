//! ==============================================================================
//! main.rs - weather hub entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the hub together and runs it until ctrl-c / SIGTERM.
//!
//! responsibilities:
//!     - load hub.toml (or defaults) and apply broker env overrides
//!     - set up structured logging
//!     - open the optional sqlite history
//!     - run the uplink ingestor against the mqtt broker
//!     - serve the json api
//!     - prune durable history past its retention
//!
//! relationships:
//!     - uses: config.rs (HubConfig, env names)
//!     - uses: lib.rs (HubContext shared by every task)
//!     - uses: feed.rs + ingest.rs (broker -> store)
//!     - uses: server.rs (store -> http)
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    weather hub (this file)                   │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//!     │  │  ingestor   │  │  json api   │  │  retention pruner   │  │
//!     │  │ (mqtt feed) │  │ (port 3000) │  │   (every 6 hours)   │  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//!     │         │ writes         │ reads              │ deletes     │
//!     │         └────────────────┼────────────────────┘             │
//!     │                   ┌──────┴──────┐                           │
//!     │                   │ HubContext  │ <- store + sqlite history │
//!     │                   └─────────────┘                           │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! shutdown:
//!     a `watch` channel flips to true. the ingestor finishes the message in
//!     hand and closes the broker session. the api drains in-flight requests.
//!
//! ==============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use weather_hub::config::{HubConfig, ENV_PASSWORD};
use weather_hub::domain::now_ms;
use weather_hub::feed::MqttFeed;
use weather_hub::ingest::Ingestor;
use weather_hub::persistence::PersistenceAdapter;
use weather_hub::{server, HubContext};

const PRUNE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const MS_PER_DAY: u64 = 86_400_000;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    // logging is not up yet, so the outcome is reported after step 2
    let (mut config, config_path) = HubConfig::load_or_default()?;
    config.apply_env(|key| std::env::var(key).ok())?;

    // step 2: structured logging, RUST_LOG wins over hub.toml
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .init();

    tracing::info!("===========================================================");
    tracing::info!("  Weather Hub - LoRaWAN uplink decoder");
    tracing::info!("===========================================================");
    match &config_path {
        Some(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
        None => tracing::info!("[CONFIG] No config file found, using defaults"),
    }
    config.print_summary();

    let password = std::env::var(ENV_PASSWORD).ok();
    if config.broker.username.is_some() && password.is_none() {
        tracing::warn!("[CONFIG] broker username set but {ENV_PASSWORD} is not; the broker will likely refuse us");
    }

    // step 3: shared state (and durable history)
    let ctx = HubContext::build(config)?;
    let config = ctx.config.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // step 4: json api in background
    let server_task = if config.server.enabled {
        let listener = tokio::net::TcpListener::bind(&config.server.bind)
            .await
            .with_context(|| format!("failed to bind api on {}", config.server.bind))?;
        tracing::info!("[STARTUP] ✓ API live at http://{}", config.server.bind);

        let mut stop = shutdown_rx.clone();
        let facade = ctx.facade();
        Some(tokio::spawn(async move {
            let signal = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = server::run_server(listener, facade, signal).await {
                tracing::error!("[ERROR] Web server error: {e:#}");
            }
        }))
    } else {
        None
    };

    // step 5: retention pruning
    if let (Some(days), Some(history)) = (config.storage.retention_days, ctx.store.persistence().cloned()) {
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }
                let cutoff = now_ms().saturating_sub(days.saturating_mul(MS_PER_DAY));
                match history.prune(cutoff).await {
                    Ok(n) if n > 0 => tracing::info!(deleted = n, retention_days = days, "pruned old readings"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "history prune failed"),
                }
            }
        });
    }

    // step 6: uplink ingestor
    let feed = MqttFeed::new(&config.broker, password.as_deref());
    let ingestor = Ingestor::new(feed, ctx.uplink_handler(), config.reconnect.clone());
    let mut ingest_task = tokio::spawn(ingestor.run(shutdown_rx));
    tracing::info!("[RUNTIME] Listening for uplinks on {}", config.broker.topic);

    // step 7: wait for a signal, or for the ingestor to give up
    let exit_reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate() => "SIGTERM",
        result = &mut ingest_task => {
            let _ = shutdown_tx.send(true);
            if let Some(task) = server_task {
                let _ = task.await;
            }
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("uplink feed failed"),
                Err(e) => Err(e).context("ingestor task panicked"),
            };
        }
    };

    tracing::warn!(signal = exit_reason, "shutting down");
    let _ = shutdown_tx.send(true);

    match ingest_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "ingestor stopped with an error"),
        Err(e) => tracing::error!(error = %e, "ingestor task panicked"),
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }

    let stats = ctx.stats.snapshot();
    tracing::info!(
        received = stats.received,
        stored = stats.stored,
        rejected = stats.rejected,
        "hub stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

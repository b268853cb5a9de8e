use event_stream::{EventBus, InMemoryBus, JetStreamConfig, NatsBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webhooks_rs::config::Config;
use webhooks_rs::{build_router, AppState};

async fn connect_bus(config: &Config) -> Arc<dyn EventBus> {
    if config.bus_type.eq_ignore_ascii_case("nats") {
        tracing::info!(url = %config.nats_url, "Connecting to NATS");
        match async_nats::connect(&config.nats_url).await {
            Ok(client) => {
                let js = JetStreamConfig::new(config.stream_subject_prefix.clone());
                return match NatsBus::with_jetstream(client.clone(), js).await {
                    Ok(bus) => Arc::new(bus),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "JetStream unavailable, stream delivery is at-most-once on core NATS"
                        );
                        Arc::new(NatsBus::new(client))
                    }
                };
            }
            Err(e) => {
                tracing::error!(error = %e, "NATS unavailable, falling back to in-memory bus");
            }
        }
    }
    tracing::info!("Using in-memory event bus");
    Arc::new(InMemoryBus::new())
}

/// Resolves on Ctrl-C after telling push clients to disconnect, so open
/// sockets do not hold the server's graceful shutdown.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    let closed = state.hub.shutdown();
    tracing::info!(connections = closed, "Push connections closed");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,webhooks_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = Config::from_env()?;
    let bus = connect_bus(&cfg).await;
    let state = AppState::build(cfg.clone(), bus);

    // Breaker transitions
    let mut transitions = state.breakers.subscribe();
    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(t) => {
                    tracing::warn!(breaker = %t.name, from = %t.from, to = %t.to, "Circuit breaker transition")
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Breaker transition log lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = state.start_consumers().await {
        tracing::error!(error = %e, "Stream consumer groups not started");
    }

    let sweeper = state
        .bus
        .spawn_sweeper(Duration::from_secs(cfg.dedup_sweep_interval_secs.max(1)));

    let app = build_router(state.clone());

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    let grace = cfg.shutdown_grace();
    let abandoned = state.inflight.wait_idle(grace).await;
    if abandoned > 0 {
        tracing::warn!(abandoned, "Webhook tasks abandoned at shutdown");
    }
    state.stream.shutdown(grace).await;
    sweeper.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

//! `jobctl-server`: boots the control plane — configuration, migrations,
//! the kernel, the background scheduler tick, and the HTTP/WebSocket
//! listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobctl_core::clock::SystemClock;
use jobctl_core::config::Config;
use jobctl_core::kernel::ServerKernel;
use jobctl_core::server::app::build_app;
use jobctl_core::store::Store;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobctl_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting control plane");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!("configuration loaded");

    tracing::info!("connecting to database...");
    let store = Store::connect(&config.database_url, 10)
        .await
        .context("failed to connect to database")?;
    tracing::info!("database connected");

    tracing::info!("running migrations...");
    store.run_migrations().await.context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let shutdown = CancellationToken::new();
    let port = config.port;
    let background_interval = config.scheduler_background_interval_seconds;

    let kernel = Arc::new(ServerKernel::new(store, Arc::new(SystemClock), config));

    if background_interval > 0 {
        let scheduler = kernel.scheduler.clone();
        let clock = kernel.clock.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(jobctl_core::scheduler::run_background_tick_loop(
            scheduler,
            clock,
            std::time::Duration::from_secs(background_interval),
            shutdown,
        ));
        tracing::info!(interval_seconds = background_interval, "background tick loop started");

        let run_lifecycle = kernel.run_lifecycle.clone();
        let clock = kernel.clock.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(background_interval));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = run_lifecycle.expire_scan(clock.as_ref()).await {
                            tracing::warn!(error = %err, "lease expiry scan failed");
                        }
                    }
                }
            }
        });
        tracing::info!("lease expiry scan loop started");
    }

    let app = build_app(kernel);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "starting server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .await
        .context("server error")?;

    shutdown.cancel();
    Ok(())
}

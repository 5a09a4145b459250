//! Gantry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use gantry_core::config::AppConfig;
use gantry_server::{create_router, AppState};
use gantry_tasks::TaskStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Gantry - zero-trust IPA delivery server
#[derive(Parser, Debug)]
#[command(name = "gantryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "GANTRY_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Gantry v{}", env!("CARGO_PKG_VERSION"));

    // Config file is optional; GANTRY_* env vars and the well-known
    // environment inputs can provide everything.
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("no config file found at {}", args.config);
    }

    let mut config: AppConfig = figment
        .merge(Env::prefixed("GANTRY_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.apply_env_overrides();

    // Initialize storage and verify connectivity before accepting requests.
    let storage = gantry_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "storage backend ready");

    let tasks = Arc::new(
        TaskStore::new(&config.tasks.path)
            .await
            .context("failed to open task store")?,
    );
    tracing::info!(path = %config.tasks.path.display(), "task store ready");

    let bind = config.server.bind.clone();
    let state = AppState::new(config, storage, tasks);

    // Daily janitor at 02:00 UTC.
    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                let wait = gantry_server::janitor::until_next_run(time::OffsetDateTime::now_utc());
                tracing::debug!(secs = wait.as_secs(), "janitor sleeping until next run");
                tokio::time::sleep(wait).await;
                gantry_server::janitor::run_janitor(&state).await;
            }
        });
    }
    tracing::info!("janitor scheduled for 02:00 UTC daily");

    let app = create_router(state);
    let addr: SocketAddr = bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}

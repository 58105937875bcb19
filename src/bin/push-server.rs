use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use push_dispatcher::config::{ServerConfig, StoreConfig};
use push_dispatcher::server::{router, AppState};
use push_dispatcher::{
    logging, Dispatcher, HttpTransport, InMemoryStore, SignedPassthroughEncoder, SubscriptionStore,
};

#[derive(Debug, Parser)]
#[command(name = "push-server", about = "Web Push registration and broadcast server")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "PUSH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config.apply_env();
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    logging::init_with(config.log_format);

    if config.vapid_public_key.is_empty() {
        tracing::warn!("no VAPID public key configured, /vapidPublicKey will be empty");
    }

    let store = open_store(&config.store).await?;
    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher.clone(),
        store.clone(),
        Arc::new(SignedPassthroughEncoder::new()),
        Arc::new(HttpTransport::new()),
    ));

    let state = AppState {
        dispatcher: dispatcher.clone(),
        store,
        vapid_public_key: Arc::from(config.vapid_public_key.as_str()),
        max_ttl: Duration::from_secs(config.max_ttl_secs),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!(listen = %config.listen, "push server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serving http")?;

    dispatcher.shutdown().await;
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn SubscriptionStore>> {
    match config {
        StoreConfig::Memory => {
            tracing::info!("using in-memory subscription store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreConfig::Sqlite { path } => open_sqlite(path),
        StoreConfig::Postgres { url, table } => open_postgres(url, table).await,
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(path: &str) -> Result<Arc<dyn SubscriptionStore>> {
    let store = push_dispatcher::SqliteStore::open(path)
        .with_context(|| format!("opening sqlite store at {path}"))?;
    tracing::info!(path, "using sqlite subscription store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_path: &str) -> Result<Arc<dyn SubscriptionStore>> {
    anyhow::bail!("sqlite store requested but the `sqlite` feature is disabled")
}

#[cfg(feature = "postgres")]
async fn open_postgres(url: &str, table: &str) -> Result<Arc<dyn SubscriptionStore>> {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .context("connecting to postgres")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "postgres connection closed");
        }
    });

    let store = push_dispatcher::PostgresStore::new(client, table).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_url: &str, _table: &str) -> Result<Arc<dyn SubscriptionStore>> {
    anyhow::bail!("postgres store requested but the `postgres` feature is disabled")
}

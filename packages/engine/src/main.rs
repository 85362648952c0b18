use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use escalation_engine::config::Config;
use escalation_engine::scanner;
use escalation_engine::service_client::ServiceClient;
use escalation_engine::store::Store;
use escalation_engine::webhook::{self, WebhookState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,escalation_engine=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting escalation engine");

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);

    let store = Arc::new(
        Store::connect(&config.database_path)
            .await
            .context("failed to connect to the store")?,
    );
    store.initialize().await.context("failed to run store migrations")?;
    tracing::info!(path = %config.database_path, "store ready");

    let client = Arc::new(ServiceClient::new());

    spawn_scanner(store.clone(), client.clone(), config.clone());

    let state = WebhookState {
        store: store.clone(),
        client: client.clone(),
        config: config.clone(),
    };
    let app = Router::new()
        .route("/health", get(health))
        .merge(webhook::router(state))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    axum::serve(listener, app.into_make_service())
        .await
        .context("server error")?;

    Ok(())
}

/// The scanner tick runs as its own Tokio task so a stuck worker inside one
/// tick never blocks the next tick from firing (spec.md §5).
fn spawn_scanner(store: Arc<Store>, client: Arc<ServiceClient>, config: Arc<Config>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.scan_interval_secs));
        loop {
            interval.tick().await;
            let store = store.clone();
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move { scanner::tick(store, client, config).await });
        }
    });
}

async fn health() -> &'static str {
    "OK"
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use parley_gateway::push::{NoopNotifier, PushNotifier, WebhookNotifier};
use parley_gateway::reaper::run_reaper_loop;
use parley_server::app;
use parley_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let store = parley_store::Database::open(&PathBuf::from(&config.db_path))?;

    let push: Arc<dyn PushNotifier> = match &config.push_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };

    let state = app::build_state(store, &config, push);

    // Idle-queue garbage collection
    tokio::spawn(run_reaper_loop(
        state.queues.clone(),
        config.reaper_interval,
        config.queue_idle,
    ));

    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

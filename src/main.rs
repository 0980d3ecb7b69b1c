mod config;
mod google;
mod local;
mod receiver;
mod reconcile;
mod registrar;
mod retry;
mod scheduler;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use livesync_core::{CalendarProvider, ChannelStore, DedupWatermarks, EventStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::google::GoogleCalendarClient;
use crate::local::LocalEventStore;
use crate::reconcile::Reconciler;
use crate::registrar::Registrar;
use crate::retry::RetryPolicy;
use crate::scheduler::RenewalScheduler;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livesync=info")),
        )
        .init();

    let config = Config::load()?;
    std::fs::create_dir_all(&config.state_dir)?;

    let store = Arc::new(ChannelStore::open(&config.state_dir.join("channels.json"))?);
    let watermarks = Arc::new(DedupWatermarks::open(
        &config.state_dir.join("watermarks.json"),
    )?);
    let events: Arc<dyn EventStore> =
        Arc::new(LocalEventStore::new(config.state_dir.join("events"))?);
    let provider: Arc<dyn CalendarProvider> = Arc::new(GoogleCalendarClient::new(
        config.provider_base_url.clone(),
        config.provider_bearer_token.clone(),
    ));

    let retry = RetryPolicy::new(&config.retry);
    let registrar = Arc::new(Registrar::new(
        provider.clone(),
        store.clone(),
        config.callback_address.clone(),
        retry.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        provider.clone(),
        store.clone(),
        events,
        watermarks.clone(),
        retry,
    ));

    let selectors = config
        .resources
        .iter()
        .cloned()
        .map(livesync_core::ResourceSelector)
        .collect();
    let scheduler = Arc::new(RenewalScheduler::new(
        store.clone(),
        registrar,
        provider,
        watermarks.clone(),
        selectors,
        config.renewal_interval(),
        config.renewal_window(),
        config.grace(),
    ));

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    let app = receiver::router(AppState {
        store,
        watermarks,
        reconciler,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("livesync listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Let the scheduler finish any in-flight renewal before exiting, so no
    // resource is left without a confirmed channel.
    cancel.cancel();
    scheduler_task.await?;
    info!("livesync stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown requested");
    cancel.cancel();
}

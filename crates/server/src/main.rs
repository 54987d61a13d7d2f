use std::{net::SocketAddr, sync::Arc, time::Duration};

use server_api::ApiContext;
use storage::Storage;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod auth;
mod config;
mod realtime;
mod routes;
mod sweeper;

use app_state::AppState;
use auth::TokenKeys;
use config::{load_settings, prepare_database_url};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        transitions: settings.transition_graph()?,
    };
    let state = Arc::new(AppState::new(
        api,
        TokenKeys::new(&settings.jwt_secret, settings.token_ttl_seconds),
    ));

    sweeper::spawn_offer_sweeper(
        state.clone(),
        Duration::from_secs(settings.offer_sweep_interval_seconds.max(1)),
    );
    let app = routes::build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

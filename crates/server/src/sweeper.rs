use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::{error, info};

use crate::app_state::AppState;

/// Periodically expires offers whose window has passed and publishes the updates.
pub(crate) fn spawn_offer_sweeper(state: Arc<AppState>, every: Duration) -> JoinHandle<()> {
    info!(interval_seconds = every.as_secs(), "offer sweeper started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(interval);
    tokio::spawn(async move {
        while ticks.next().await.is_some() {
            sweep_once(&state).await;
        }
    })
}

pub(crate) async fn sweep_once(state: &AppState) -> usize {
    match server_api::expire_stale_offers(&state.api, Utc::now()).await {
        Ok(outcome) => {
            state.publish(outcome.changes);
            outcome.value
        }
        Err(err) => {
            error!(error = %err, "offer sweep failed");
            0
        }
    }
}

//! Change-stream websocket. Each connection keeps its own subscription table and
//! filters the shared change feed against it.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{mission_visible_to, ApiContext, Caller};
use shared::{
    error::ApiError,
    protocol::{ChangeEvent, RealtimeMessage, RealtimeRequest, Row, RowFilter, SubscriptionId, Topic},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{app_state::AppState, auth::authenticate, routes::reject};

#[derive(Debug, Deserialize)]
pub(crate) struct RealtimeQuery {
    access_token: String,
}

#[derive(Debug, Clone)]
struct ActiveSubscription {
    topic: Topic,
    filter: Option<RowFilter>,
}

pub(crate) async fn realtime_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RealtimeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, Json<ApiError>)> {
    let caller = authenticate(&state, &q.access_token)
        .await
        .map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| realtime_connection(state, socket, caller)))
}

async fn realtime_connection(state: Arc<AppState>, socket: WebSocket, caller: Caller) {
    let (mut sender, mut receiver) = socket.split();
    let mut changes_rx = state.changes.subscribe();
    let mut subscriptions: HashMap<SubscriptionId, ActiveSubscription> = HashMap::new();
    info!(user_id = %caller.user_id, "realtime connection opened");

    loop {
        let outgoing = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => vec![handle_request(&mut subscriptions, &text)],
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(error = %err, "realtime socket error");
                    break;
                }
            },
            change = changes_rx.recv() => match change {
                Ok(change) => deliveries(&state.api, &subscriptions, caller, change).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id = %caller.user_id, skipped, "realtime connection lagged behind the change feed");
                    vec![lagged_notice(skipped)]
                }
                Err(RecvError::Closed) => break,
            },
        };

        for message in outgoing {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode realtime frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                info!(user_id = %caller.user_id, "realtime connection closed by peer");
                return;
            }
        }
    }
    info!(user_id = %caller.user_id, "realtime connection closed");
}

fn handle_request(
    subscriptions: &mut HashMap<SubscriptionId, ActiveSubscription>,
    text: &str,
) -> RealtimeMessage {
    let request = match serde_json::from_str::<RealtimeRequest>(text) {
        Ok(request) => request,
        Err(err) => {
            return RealtimeMessage::Error(ApiError::validation(format!(
                "malformed realtime frame: {err}"
            )))
        }
    };
    match request {
        RealtimeRequest::Subscribe {
            subscription_id,
            topic,
            filter,
        } => {
            if subscriptions.contains_key(&subscription_id) {
                return RealtimeMessage::SubscriptionError {
                    subscription_id,
                    error: ApiError::conflict("subscription id already in use"),
                };
            }
            if let Some(Err(error)) = filter.as_ref().map(|filter| topic.validate_filter(filter)) {
                return RealtimeMessage::SubscriptionError {
                    subscription_id,
                    error,
                };
            }
            subscriptions.insert(subscription_id, ActiveSubscription { topic, filter });
            RealtimeMessage::Subscribed { subscription_id }
        }
        RealtimeRequest::Unsubscribe { subscription_id } => {
            subscriptions.remove(&subscription_id);
            RealtimeMessage::Unsubscribed { subscription_id }
        }
    }
}

async fn deliveries(
    api: &ApiContext,
    subscriptions: &HashMap<SubscriptionId, ActiveSubscription>,
    caller: Caller,
    change: ChangeEvent,
) -> Vec<RealtimeMessage> {
    let matching: Vec<SubscriptionId> = subscriptions
        .iter()
        .filter(|(_, subscription)| change.matches(subscription.topic, subscription.filter.as_ref()))
        .map(|(subscription_id, _)| *subscription_id)
        .collect();
    if matching.is_empty() || !visible_to(api, &change, caller).await {
        return Vec::new();
    }
    matching
        .into_iter()
        .map(|subscription_id| RealtimeMessage::Change {
            subscription_id,
            event: change.clone(),
        })
        .collect()
}

/// Mirrors the read procedures: notifications reach their recipient, offers reach
/// staff and their recipient. Subcontractors see mission rows assigned to them, and
/// transition and chat rows of missions assigned or offered to them.
async fn visible_to(api: &ApiContext, change: &ChangeEvent, caller: Caller) -> bool {
    let Some(row) = change.new.as_ref().or(change.old.as_ref()) else {
        return false;
    };
    let mission_id = match row {
        Row::Notification(notification) => return notification.recipient_id == caller.user_id,
        Row::MissionOffer(offer) => {
            return caller.role.is_staff() || offer.recipient_id == caller.user_id
        }
        _ if caller.role.is_staff() => return true,
        Row::Mission(_) => {
            return [change.new.as_ref(), change.old.as_ref()]
                .into_iter()
                .flatten()
                .any(|row| matches!(row, Row::Mission(mission) if mission.assigned_to == Some(caller.user_id)))
        }
        Row::StatusTransition(record) => record.mission_id,
        Row::ChatMessage(message) => message.mission_id,
    };
    match mission_visible_to(api, caller, mission_id).await {
        Ok(visible) => visible,
        Err(err) => {
            warn!(user_id = %caller.user_id, %mission_id, error = %err, "visibility check failed");
            false
        }
    }
}

/// Sent in place of the changes a slow connection missed; clients re-fetch state.
fn lagged_notice(skipped: u64) -> RealtimeMessage {
    RealtimeMessage::Error(ApiError::conflict(format!(
        "missed {skipped} changes; re-fetch current state"
    )))
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;

use chrono::Utc;
use shared::{
    domain::{ChatMessage, MissionId, Notification, NotificationId},
    error::ApiError,
    protocol::{ChangeEvent, Row},
};

use crate::{ensure_mission_visible, internal, load_mission, ApiContext, Caller, Outcome};

pub const MAX_CHAT_MESSAGE_LEN: usize = 4000;

/// Notifications are private: every call is scoped to the caller's own rows.
pub async fn list_notifications(
    ctx: &ApiContext,
    caller: Caller,
) -> Result<Vec<Notification>, ApiError> {
    ctx.storage
        .notifications_for(caller.user_id)
        .await
        .map_err(internal)
}

pub async fn mark_notification_read(
    ctx: &ApiContext,
    caller: Caller,
    notification_id: NotificationId,
) -> Result<Outcome<Notification>, ApiError> {
    let (before, after) = ctx
        .storage
        .mark_notification_read(notification_id, caller.user_id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("notification {notification_id} not found")))?;
    let changes = if before.read_at.is_none() {
        vec![ChangeEvent::update(
            Row::Notification(before),
            Row::Notification(after.clone()),
        )]
    } else {
        Vec::new()
    };
    Ok(Outcome::new(after, changes))
}

pub async fn delete_notification(
    ctx: &ApiContext,
    caller: Caller,
    notification_id: NotificationId,
) -> Result<Outcome<()>, ApiError> {
    let deleted = ctx
        .storage
        .delete_notification(notification_id, caller.user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("notification {notification_id} not found")))?;
    Ok(Outcome::new(
        (),
        vec![ChangeEvent::delete(Row::Notification(deleted))],
    ))
}

pub async fn list_chat_messages(
    ctx: &ApiContext,
    caller: Caller,
    mission_id: MissionId,
) -> Result<Vec<ChatMessage>, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    ensure_mission_visible(ctx, caller, &mission).await?;
    ctx.storage
        .chat_messages(mission_id)
        .await
        .map_err(internal)
}

pub async fn post_chat_message(
    ctx: &ApiContext,
    caller: Caller,
    mission_id: MissionId,
    body: &str,
) -> Result<Outcome<ChatMessage>, ApiError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::validation("message body is empty"));
    }
    if body.chars().count() > MAX_CHAT_MESSAGE_LEN {
        return Err(ApiError::validation(format!(
            "message exceeds {MAX_CHAT_MESSAGE_LEN} characters"
        )));
    }
    let mission = load_mission(ctx, mission_id).await?;
    ensure_mission_visible(ctx, caller, &mission).await?;

    let message = ctx
        .storage
        .insert_chat_message(mission_id, caller.user_id, body)
        .await
        .map_err(internal)?;
    tracing::debug!(mission_id = %mission_id, message_id = %message.id, "chat message posted");
    let changes = vec![ChangeEvent::insert(Row::ChatMessage(message.clone()))];
    Ok(Outcome::new(message, changes))
}

#[cfg(test)]
#[path = "tests/inbox_tests.rs"]
mod tests;

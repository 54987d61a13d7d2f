//! Backend procedures for missions, offers and the per-user inbox.
//!
//! Every mutating procedure returns an [`Outcome`] carrying the change events it
//! committed; the transport layer forwards those to realtime subscribers.

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{Mission, MissionId, Profile, ProfileRole, UserId},
    error::{ApiError, ErrorCode},
    lifecycle::TransitionGraph,
    protocol::ChangeEvent,
};
use storage::Storage;

mod inbox;
mod missions;
mod offers;

pub use inbox::{
    delete_notification, list_chat_messages, list_notifications, mark_notification_read,
    post_chat_message, MAX_CHAT_MESSAGE_LEN,
};
pub use missions::{
    create_mission, delete_mission, get_mission, query_missions, set_mission_status,
    status_history, MAX_NOTE_LEN,
};
pub use offers::{
    accept_mission_offer, expire_stale_offers, list_offers, publish_mission_offers,
    refuse_mission_offer,
};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub transitions: TransitionGraph,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            transitions: TransitionGraph::standard(),
        }
    }
}

/// Authenticated identity on whose behalf a procedure runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: ProfileRole,
}

#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub changes: Vec<ChangeEvent>,
}

impl<T> Outcome<T> {
    pub fn new(value: T, changes: Vec<ChangeEvent>) -> Self {
        Self { value, changes }
    }
}

pub async fn login(ctx: &ApiContext, email: &str) -> Result<Profile, ApiError> {
    let profile = ctx
        .storage
        .profile_by_email(email)
        .await
        .map_err(internal)?
        .filter(|profile| profile.active)
        .ok_or_else(|| ApiError::unauthorized("unknown or inactive account"))?;
    Ok(profile)
}

pub async fn current_profile(ctx: &ApiContext, caller: Caller) -> Result<Profile, ApiError> {
    ctx.storage
        .profile(caller.user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))
}

pub(crate) async fn load_mission(ctx: &ApiContext, mission_id: MissionId) -> Result<Mission, ApiError> {
    ctx.storage
        .mission(mission_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("mission {mission_id} not found")))
}

/// Staff see every mission; other profiles see missions assigned to them or
/// missions they hold an offer for.
pub(crate) async fn ensure_mission_visible(
    ctx: &ApiContext,
    caller: Caller,
    mission: &Mission,
) -> Result<(), ApiError> {
    if can_see(ctx, caller, mission).await? {
        Ok(())
    } else {
        Err(ApiError::forbidden("mission is not visible to this account"))
    }
}

/// Same rule as the mission reads, by id. A mission that no longer exists is
/// visible to staff only.
pub async fn mission_visible_to(
    ctx: &ApiContext,
    caller: Caller,
    mission_id: MissionId,
) -> Result<bool, ApiError> {
    if caller.role.is_staff() {
        return Ok(true);
    }
    match ctx.storage.mission(mission_id).await.map_err(internal)? {
        Some(mission) => can_see(ctx, caller, &mission).await,
        None => Ok(false),
    }
}

async fn can_see(ctx: &ApiContext, caller: Caller, mission: &Mission) -> Result<bool, ApiError> {
    if caller.role.is_staff() || mission.assigned_to == Some(caller.user_id) {
        return Ok(true);
    }
    let offered = ctx
        .storage
        .offer_for(mission.id, caller.user_id)
        .await
        .map_err(internal)?
        .is_some();
    Ok(offered)
}

pub(crate) fn ensure_staff(caller: Caller) -> Result<(), ApiError> {
    if caller.role.is_staff() {
        Ok(())
    } else {
        Err(ApiError::forbidden("operation requires an admin or employee account"))
    }
}

/// History timestamps strictly increase per mission even when the clock does not.
pub(crate) async fn next_transition_at(
    ctx: &ApiContext,
    mission_id: MissionId,
) -> Result<DateTime<Utc>, ApiError> {
    let now = Utc::now();
    let latest = ctx
        .storage
        .latest_transition_at(mission_id)
        .await
        .map_err(internal)?;
    Ok(match latest {
        Some(latest) if latest >= now => latest + Duration::microseconds(1),
        _ => now,
    })
}

pub(crate) fn is_unique_violation(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains("UNIQUE constraint failed")
}

pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Storage failures are logged in full; callers only get a fixed message.
pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{err:#}"), "procedure failed");
    ApiError::new(ErrorCode::Internal, INTERNAL_ERROR_MESSAGE)
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use shared::{
    domain::{
        Mission, MissionId, MissionStatus, NotificationKind, ProfileRole, StatusTransitionRecord,
        TransitionChannel,
    },
    error::ApiError,
    protocol::{ChangeEvent, CreateMissionRequest, MissionQuery, Row, SetMissionStatusRequest},
};
use storage::{NewNotification, NewTransition};
use tracing::info;

use crate::{
    ensure_mission_visible, ensure_staff, internal, is_unique_violation, load_mission,
    next_transition_at, ApiContext, Caller, Outcome,
};

pub const MAX_NOTE_LEN: usize = 2000;

/// The `set_mission_status` procedure. The transition graph is checked here and only
/// here; on success exactly one history record is appended.
pub async fn set_mission_status(
    ctx: &ApiContext,
    caller: Caller,
    request: SetMissionStatusRequest,
) -> Result<Outcome<StatusTransitionRecord>, ApiError> {
    if request.actor_id != caller.user_id {
        return Err(ApiError::forbidden(
            "actor does not match the authenticated session",
        ));
    }
    if request.channel != TransitionChannel::Manual {
        return Err(ApiError::validation(
            "only manual transitions can be submitted by clients",
        ));
    }
    let note = normalize_note(request.note)?;

    let before = load_mission(ctx, request.mission_id).await?;
    if !caller.role.is_staff() && before.assigned_to != Some(caller.user_id) {
        return Err(ApiError::forbidden(
            "only the assigned subcontractor can change this mission",
        ));
    }
    ctx.transitions.check(before.status, request.target_status)?;

    let at = next_transition_at(ctx, before.id).await?;
    let applied = ctx
        .storage
        .apply_transition(&NewTransition {
            mission_id: before.id,
            from_status: before.status,
            to_status: request.target_status,
            channel: request.channel,
            note: note.clone(),
            context: request.context,
            actor_id: caller.user_id,
            at,
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::conflict(format!(
                "mission {} changed status concurrently",
                before.id
            ))
        })?;
    info!(
        mission_id = %before.id,
        from = %before.status,
        to = %applied.record.to_status,
        actor_id = %caller.user_id,
        "mission status changed"
    );

    let mut changes = vec![
        ChangeEvent::update(
            Row::Mission(before),
            Row::Mission(applied.mission.clone()),
        ),
        ChangeEvent::insert(Row::StatusTransition(applied.record.clone())),
    ];
    if !applied.withdrawn.is_empty() {
        info!(
            mission_id = %applied.mission.id,
            withdrawn = applied.withdrawn.len(),
            "pending offers withdrawn"
        );
    }
    changes.extend(applied.withdrawn.into_iter().map(|(before, after)| {
        ChangeEvent::update(Row::MissionOffer(before), Row::MissionOffer(after))
    }));
    if let Some(assignee) = applied
        .mission
        .assigned_to
        .filter(|assignee| *assignee != caller.user_id)
    {
        let notification = ctx
            .storage
            .insert_notification(&NewNotification {
                recipient_id: assignee,
                kind: NotificationKind::MissionStatus,
                title: format!(
                    "Mission {} is now {}",
                    applied.mission.reference, applied.mission.status
                ),
                body: note.unwrap_or_default(),
                mission_id: Some(applied.mission.id),
            })
            .await
            .map_err(internal)?;
        changes.push(ChangeEvent::insert(Row::Notification(notification)));
    }

    Ok(Outcome::new(applied.record, changes))
}

/// Full transition log of a mission, newest first.
pub async fn status_history(
    ctx: &ApiContext,
    caller: Caller,
    mission_id: MissionId,
) -> Result<Vec<StatusTransitionRecord>, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    ensure_mission_visible(ctx, caller, &mission).await?;
    ctx.storage
        .status_history(mission_id)
        .await
        .map_err(internal)
}

pub async fn get_mission(
    ctx: &ApiContext,
    caller: Caller,
    mission_id: MissionId,
) -> Result<Mission, ApiError> {
    let mission = load_mission(ctx, mission_id).await?;
    ensure_mission_visible(ctx, caller, &mission).await?;
    Ok(mission)
}

pub async fn query_missions(
    ctx: &ApiContext,
    caller: Caller,
    query: &MissionQuery,
) -> Result<Vec<Mission>, ApiError> {
    let visible_to = (!caller.role.is_staff()).then_some(caller.user_id);
    ctx.storage
        .query_missions(query, visible_to)
        .await
        .map_err(internal)
}

pub async fn create_mission(
    ctx: &ApiContext,
    caller: Caller,
    request: CreateMissionRequest,
) -> Result<Outcome<Mission>, ApiError> {
    ensure_staff(caller)?;
    if request.reference.trim().is_empty() {
        return Err(ApiError::validation("mission reference is required"));
    }
    if request.title.trim().is_empty() {
        return Err(ApiError::validation("mission title is required"));
    }
    if let (Some(start), Some(end)) = (request.scheduled_start, request.scheduled_end) {
        if end < start {
            return Err(ApiError::validation(
                "scheduled end must not precede scheduled start",
            ));
        }
    }
    if request.price_cents.is_some_and(|price| price < 0) {
        return Err(ApiError::validation("price must not be negative"));
    }

    let mission = ctx
        .storage
        .insert_mission(caller.user_id, &request)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ApiError::conflict(format!(
                    "mission reference '{}' already exists",
                    request.reference.trim()
                ))
            } else {
                internal(err)
            }
        })?;
    info!(mission_id = %mission.id, reference = %mission.reference, "mission created");
    let changes = vec![ChangeEvent::insert(Row::Mission(mission.clone()))];
    Ok(Outcome::new(mission, changes))
}

/// Admins may remove missions that never left DRAFT or were cancelled.
pub async fn delete_mission(
    ctx: &ApiContext,
    caller: Caller,
    mission_id: MissionId,
) -> Result<Outcome<()>, ApiError> {
    if caller.role != ProfileRole::Admin {
        return Err(ApiError::forbidden("only admins can delete missions"));
    }
    let mission = load_mission(ctx, mission_id).await?;
    if !matches!(
        mission.status,
        MissionStatus::Draft | MissionStatus::Cancelled
    ) {
        return Err(ApiError::conflict(format!(
            "mission in status {} cannot be deleted",
            mission.status
        )));
    }
    let deleted = ctx
        .storage
        .delete_mission(mission_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("mission {mission_id} not found")))?;
    info!(mission_id = %mission_id, "mission deleted");
    Ok(Outcome::new(
        (),
        vec![ChangeEvent::delete(Row::Mission(deleted))],
    ))
}

fn normalize_note(note: Option<String>) -> Result<Option<String>, ApiError> {
    let note = note
        .map(|note| note.trim().to_string())
        .filter(|note| !note.is_empty());
    if note
        .as_ref()
        .is_some_and(|note| note.chars().count() > MAX_NOTE_LEN)
    {
        return Err(ApiError::validation(format!(
            "note exceeds {MAX_NOTE_LEN} characters"
        )));
    }
    Ok(note)
}

#[cfg(test)]
#[path = "tests/missions_tests.rs"]
mod tests;

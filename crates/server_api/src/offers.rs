use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{MissionStatus, NotificationKind, Offer, OfferStatus, TransitionChannel},
    error::ApiError,
    protocol::{
        ChangeEvent, MissionOfferRequest, OfferQuery, PublishMissionOffersRequest, Row,
        MAX_OFFER_TTL_MINUTES, RPC_OK,
    },
};
use storage::{AcceptOutcome, NewNotification, NewTransition};
use tracing::{info, warn};

use crate::{
    ensure_staff, internal, load_mission, next_transition_at, ApiContext, Caller, Outcome,
};

/// The `publish_mission_offers` procedure: answers with the number of offers created.
pub async fn publish_mission_offers(
    ctx: &ApiContext,
    caller: Caller,
    request: PublishMissionOffersRequest,
) -> Result<Outcome<u32>, ApiError> {
    ensure_staff(caller)?;
    if request.ttl_minutes == 0 || request.ttl_minutes > MAX_OFFER_TTL_MINUTES {
        return Err(ApiError::validation(format!(
            "ttl_minutes must be between 1 and {MAX_OFFER_TTL_MINUTES}"
        )));
    }

    let mission = load_mission(ctx, request.mission_id).await?;
    let mut changes = Vec::new();
    match mission.status {
        MissionStatus::Published => {}
        MissionStatus::Draft => {
            ctx.transitions
                .check(MissionStatus::Draft, MissionStatus::Published)?;
            let at = next_transition_at(ctx, mission.id).await?;
            let applied = ctx
                .storage
                .apply_transition(&NewTransition {
                    mission_id: mission.id,
                    from_status: MissionStatus::Draft,
                    to_status: MissionStatus::Published,
                    channel: TransitionChannel::Automatic,
                    note: Some("published for offers".to_string()),
                    context: None,
                    actor_id: caller.user_id,
                    at,
                })
                .await
                .map_err(internal)?
                .ok_or_else(|| {
                    ApiError::conflict(format!("mission {} changed status concurrently", mission.id))
                })?;
            changes.push(ChangeEvent::update(
                Row::Mission(mission.clone()),
                Row::Mission(applied.mission),
            ));
            changes.push(ChangeEvent::insert(Row::StatusTransition(applied.record)));
        }
        other => {
            return Err(ApiError::illegal_transition(format!(
                "mission is not publishable in status {other}"
            )));
        }
    }

    let recipients: Vec<_> = ctx
        .storage
        .list_offer_recipients(request.include_employees)
        .await
        .map_err(internal)?
        .into_iter()
        .map(|profile| profile.id)
        .filter(|recipient| *recipient != caller.user_id)
        .collect();
    let sent_at = Utc::now();
    let expires_at = sent_at + Duration::minutes(i64::from(request.ttl_minutes));
    let offers = ctx
        .storage
        .create_offers(mission.id, &recipients, sent_at, expires_at)
        .await
        .map_err(internal)?;

    for offer in &offers {
        let notification = ctx
            .storage
            .insert_notification(&NewNotification {
                recipient_id: offer.recipient_id,
                kind: NotificationKind::MissionOffer,
                title: format!("New mission offer {}", mission.reference),
                body: mission.title.clone(),
                mission_id: Some(mission.id),
            })
            .await
            .map_err(internal)?;
        changes.push(ChangeEvent::insert(Row::MissionOffer(offer.clone())));
        changes.push(ChangeEvent::insert(Row::Notification(notification)));
    }

    let count = u32::try_from(offers.len()).unwrap_or(u32::MAX);
    info!(
        mission_id = %mission.id,
        offers = count,
        ttl_minutes = request.ttl_minutes,
        include_employees = request.include_employees,
        "mission offers published"
    );
    Ok(Outcome::new(count, changes))
}

/// The `accept_mission_offer` procedure. At most one acceptance per mission succeeds.
pub async fn accept_mission_offer(
    ctx: &ApiContext,
    caller: Caller,
    request: MissionOfferRequest,
) -> Result<Outcome<String>, ApiError> {
    let before = load_mission(ctx, request.mission_id).await?;
    let offer = open_offer(ctx, caller, &request, Utc::now()).await?;
    if before.assigned_to.is_some() {
        return Err(ApiError::conflict("mission already accepted"));
    }
    ctx.transitions
        .check(before.status, MissionStatus::Accepted)?;

    let at = next_transition_at(ctx, before.id).await?;
    let outcome = ctx
        .storage
        .accept_offer(
            offer.id,
            caller.user_id,
            &NewTransition {
                mission_id: before.id,
                from_status: MissionStatus::Published,
                to_status: MissionStatus::Accepted,
                channel: TransitionChannel::Automatic,
                note: Some("offer accepted".to_string()),
                context: None,
                actor_id: caller.user_id,
                at,
            },
        )
        .await
        .map_err(internal)?;

    let (mission, record, offer, withdrawn) = match outcome {
        AcceptOutcome::Accepted {
            mission,
            record,
            offer,
            withdrawn,
        } => (mission, record, offer, withdrawn),
        AcceptOutcome::MissionTaken => {
            return Err(ApiError::conflict("mission already accepted"));
        }
        AcceptOutcome::OfferClosed => {
            return Err(ApiError::conflict("offer is no longer pending"));
        }
    };
    info!(
        mission_id = %mission.id,
        recipient_id = %caller.user_id,
        withdrawn = withdrawn.len(),
        "mission offer accepted"
    );

    let mut changes = vec![
        ChangeEvent::update(Row::Mission(before), Row::Mission(mission.clone())),
        ChangeEvent::update(Row::MissionOffer(offer.0), Row::MissionOffer(offer.1)),
    ];
    changes.extend(withdrawn.into_iter().map(|(old, new)| {
        ChangeEvent::update(Row::MissionOffer(old), Row::MissionOffer(new))
    }));
    changes.push(ChangeEvent::insert(Row::StatusTransition(record)));

    let notification = ctx
        .storage
        .insert_notification(&NewNotification {
            recipient_id: mission.created_by,
            kind: NotificationKind::OfferAccepted,
            title: format!("Mission {} accepted", mission.reference),
            body: mission.title.clone(),
            mission_id: Some(mission.id),
        })
        .await
        .map_err(internal)?;
    changes.push(ChangeEvent::insert(Row::Notification(notification)));

    Ok(Outcome::new(RPC_OK.to_string(), changes))
}

pub async fn refuse_mission_offer(
    ctx: &ApiContext,
    caller: Caller,
    request: MissionOfferRequest,
) -> Result<Outcome<String>, ApiError> {
    load_mission(ctx, request.mission_id).await?;
    let offer = open_offer(ctx, caller, &request, Utc::now()).await?;
    let (before, after) = ctx
        .storage
        .close_offer(offer.id, OfferStatus::Refused, Utc::now())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::conflict("offer is no longer pending"))?;
    info!(mission_id = %request.mission_id, recipient_id = %caller.user_id, "mission offer refused");
    Ok(Outcome::new(
        RPC_OK.to_string(),
        vec![ChangeEvent::update(
            Row::MissionOffer(before),
            Row::MissionOffer(after),
        )],
    ))
}

/// Expires every pending offer past its window. Returns how many were expired.
pub async fn expire_stale_offers(
    ctx: &ApiContext,
    now: DateTime<Utc>,
) -> Result<Outcome<usize>, ApiError> {
    let expired = ctx.storage.expire_offers(now).await.map_err(internal)?;
    if !expired.is_empty() {
        info!(count = expired.len(), "expired stale mission offers");
    }
    let count = expired.len();
    let changes = expired
        .into_iter()
        .map(|(old, new)| ChangeEvent::update(Row::MissionOffer(old), Row::MissionOffer(new)))
        .collect();
    Ok(Outcome::new(count, changes))
}

pub async fn list_offers(
    ctx: &ApiContext,
    caller: Caller,
    query: &OfferQuery,
) -> Result<Vec<Offer>, ApiError> {
    let recipient = (!caller.role.is_staff()).then_some(caller.user_id);
    ctx.storage
        .list_offers(query, recipient)
        .await
        .map_err(internal)
}

async fn open_offer(
    ctx: &ApiContext,
    caller: Caller,
    request: &MissionOfferRequest,
    now: DateTime<Utc>,
) -> Result<Offer, ApiError> {
    let offer = ctx
        .storage
        .offer_for(request.mission_id, caller.user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("no offer for this mission"))?;
    match offer.status {
        OfferStatus::Pending if offer.is_open_at(now) => Ok(offer),
        OfferStatus::Pending => {
            warn!(offer_id = %offer.id, "offer used after expiry");
            Err(ApiError::conflict("offer has expired"))
        }
        OfferStatus::Accepted => Err(ApiError::conflict("mission already accepted")),
        other => Err(ApiError::conflict(format!("offer is {other}"))),
    }
}

#[cfg(test)]
#[path = "tests/offers_tests.rs"]
mod tests;

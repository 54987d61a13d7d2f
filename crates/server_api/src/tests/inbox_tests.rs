use shared::{
    domain::NotificationKind,
    error::ErrorCode,
    protocol::{ChangeKind, MissionOfferRequest, PublishMissionOffersRequest},
};

use super::*;
use crate::test_support::{caller, Fixture};

async fn offered_mission(fixture: &Fixture, reference: &str) -> MissionId {
    let mission = fixture.mission(reference).await;
    crate::publish_mission_offers(
        &fixture.ctx,
        caller(&fixture.admin),
        PublishMissionOffersRequest {
            mission_id: mission.id,
            ttl_minutes: 30,
            include_employees: false,
        },
    )
    .await
    .expect("publish");
    mission.id
}

#[tokio::test]
async fn notifications_are_private_to_their_recipient() {
    let fixture = Fixture::new().await;
    offered_mission(&fixture, "M-201").await;

    let alice_inbox = list_notifications(&fixture.ctx, caller(&fixture.alice))
        .await
        .expect("alice inbox");
    assert_eq!(alice_inbox.len(), 1);
    let notification = &alice_inbox[0];
    assert_eq!(notification.kind, NotificationKind::MissionOffer);
    assert!(notification.read_at.is_none());

    let err = mark_notification_read(&fixture.ctx, caller(&fixture.bob), notification.id)
        .await
        .expect_err("bob cannot touch alice's notification");
    assert_eq!(err.code, ErrorCode::NotFound);
    let err = delete_notification(&fixture.ctx, caller(&fixture.bob), notification.id)
        .await
        .expect_err("bob cannot delete alice's notification");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn marking_read_is_idempotent() {
    let fixture = Fixture::new().await;
    offered_mission(&fixture, "M-202").await;
    let alice = caller(&fixture.alice);
    let notification_id = list_notifications(&fixture.ctx, alice)
        .await
        .expect("inbox")[0]
        .id;

    let first = mark_notification_read(&fixture.ctx, alice, notification_id)
        .await
        .expect("mark read");
    let read_at = first.value.read_at.expect("read timestamp");
    assert_eq!(first.changes.len(), 1);

    let second = mark_notification_read(&fixture.ctx, alice, notification_id)
        .await
        .expect("mark read again");
    assert_eq!(second.value.read_at, Some(read_at));
    assert!(second.changes.is_empty());

    let deleted = delete_notification(&fixture.ctx, alice, notification_id)
        .await
        .expect("delete");
    assert_eq!(deleted.changes[0].kind, ChangeKind::Delete);
    assert!(list_notifications(&fixture.ctx, alice)
        .await
        .expect("inbox")
        .is_empty());
}

#[tokio::test]
async fn chat_is_open_to_offer_holders_and_staff() {
    let fixture = Fixture::new().await;
    let mission_id = offered_mission(&fixture, "M-203").await;

    post_chat_message(&fixture.ctx, caller(&fixture.admin), mission_id, "Access code is 4512")
        .await
        .expect("admin posts");
    let reply = post_chat_message(&fixture.ctx, caller(&fixture.alice), mission_id, "  Thanks!  ")
        .await
        .expect("alice replies");
    assert_eq!(reply.value.body, "Thanks!");

    let messages = list_chat_messages(&fixture.ctx, caller(&fixture.employee), mission_id)
        .await
        .expect("messages");
    let bodies: Vec<_> = messages.iter().map(|message| message.body.as_str()).collect();
    assert_eq!(bodies, vec!["Access code is 4512", "Thanks!"]);
}

#[tokio::test]
async fn chat_rejects_outsiders_and_bad_bodies() {
    let fixture = Fixture::new().await;
    let mission = fixture.mission("M-204").await;

    let err = post_chat_message(&fixture.ctx, caller(&fixture.alice), mission.id, "hello")
        .await
        .expect_err("no offer, no access");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = post_chat_message(&fixture.ctx, caller(&fixture.admin), mission.id, "   ")
        .await
        .expect_err("empty body");
    assert_eq!(err.code, ErrorCode::Validation);

    let long = "y".repeat(MAX_CHAT_MESSAGE_LEN + 1);
    let err = post_chat_message(&fixture.ctx, caller(&fixture.admin), mission.id, &long)
        .await
        .expect_err("body too long");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn losing_bidders_keep_chat_history_access() {
    let fixture = Fixture::new().await;
    let mission_id = offered_mission(&fixture, "M-205").await;
    crate::accept_mission_offer(
        &fixture.ctx,
        caller(&fixture.alice),
        MissionOfferRequest { mission_id },
    )
    .await
    .expect("accept");

    let messages = list_chat_messages(&fixture.ctx, caller(&fixture.bob), mission_id)
        .await
        .expect("bob still holds a withdrawn offer");
    assert!(messages.is_empty());
}

use shared::domain::{MissionStatus, TransitionChannel};
use shared::protocol::PublishMissionOffersRequest;

use super::*;
use crate::test_support::{caller, Fixture};

#[tokio::test]
async fn login_accepts_active_profiles_case_insensitively() {
    let fixture = Fixture::new().await;
    let profile = login(&fixture.ctx, "  Alice@Example.com ")
        .await
        .expect("login");
    assert_eq!(profile.id, fixture.alice.id);
}

#[tokio::test]
async fn login_rejects_unknown_and_inactive_accounts() {
    let fixture = Fixture::new().await;
    let err = login(&fixture.ctx, "nobody@example.com")
        .await
        .expect_err("unknown");
    assert_eq!(err.code, ErrorCode::Unauthorized);

    fixture
        .ctx
        .storage
        .set_profile_active(fixture.bob.id, false)
        .await
        .expect("deactivate");
    let err = login(&fixture.ctx, "bob@example.com")
        .await
        .expect_err("inactive");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn transition_timestamps_never_repeat() {
    let fixture = Fixture::new().await;
    let mission = fixture.mission("M-301").await;
    let future = Utc::now() + Duration::seconds(30);
    fixture
        .ctx
        .storage
        .apply_transition(&storage::NewTransition {
            mission_id: mission.id,
            from_status: MissionStatus::Draft,
            to_status: MissionStatus::Published,
            channel: TransitionChannel::Manual,
            note: None,
            context: None,
            actor_id: fixture.admin.id,
            at: future,
        })
        .await
        .expect("apply")
        .expect("applied");

    let next = next_transition_at(&fixture.ctx, mission.id)
        .await
        .expect("next");
    assert_eq!(next, future + Duration::microseconds(1));
}

#[test]
fn internal_errors_hide_storage_details() {
    let err = internal(
        anyhow::anyhow!("UNIQUE constraint failed: missions.reference")
            .context("insert mission"),
    );
    assert_eq!(err.code, ErrorCode::Internal);
    assert_eq!(err.message, INTERNAL_ERROR_MESSAGE);
    assert!(!err.message.contains("UNIQUE"));
}

#[tokio::test]
async fn missions_are_visible_to_staff_and_offer_holders_only() {
    let fixture = Fixture::new().await;
    let mission = fixture.mission("M-302").await;

    assert!(mission_visible_to(&fixture.ctx, caller(&fixture.employee), mission.id)
        .await
        .expect("employee"));
    assert!(!mission_visible_to(&fixture.ctx, caller(&fixture.alice), mission.id)
        .await
        .expect("alice before offers"));

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
    assert!(mission_visible_to(&fixture.ctx, caller(&fixture.alice), mission.id)
        .await
        .expect("alice with offer"));

    let gone = MissionId::random();
    assert!(!mission_visible_to(&fixture.ctx, caller(&fixture.alice), gone)
        .await
        .expect("missing mission"));
    assert!(mission_visible_to(&fixture.ctx, caller(&fixture.admin), gone)
        .await
        .expect("admin"));
}

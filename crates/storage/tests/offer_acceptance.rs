use chrono::{Duration, Utc};
use shared::{
    domain::{MissionStatus, OfferStatus, ProfileRole, TransitionChannel},
    protocol::{CreateMissionRequest, OfferQuery},
};
use storage::{AcceptOutcome, NewTransition, Storage};

#[tokio::test]
async fn first_acceptance_wins_and_withdraws_remaining_offers() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let admin = storage
        .create_profile("admin@example.com", "Admin", ProfileRole::Admin)
        .await
        .expect("admin");
    let alice = storage
        .create_profile("alice@example.com", "Alice", ProfileRole::Subcontractor)
        .await
        .expect("alice");
    let bob = storage
        .create_profile("bob@example.com", "Bob", ProfileRole::Subcontractor)
        .await
        .expect("bob");
    let mission = storage
        .insert_mission(
            admin.id,
            &CreateMissionRequest {
                reference: "M-100".into(),
                title: "Chiller inspection".into(),
                ..CreateMissionRequest::default()
            },
        )
        .await
        .expect("mission");
    storage
        .apply_transition(&NewTransition {
            mission_id: mission.id,
            from_status: MissionStatus::Draft,
            to_status: MissionStatus::Published,
            channel: TransitionChannel::Automatic,
            note: None,
            context: None,
            actor_id: admin.id,
            at: Utc::now(),
        })
        .await
        .expect("publish")
        .expect("published");

    let now = Utc::now();
    let offers = storage
        .create_offers(mission.id, &[alice.id, bob.id], now, now + Duration::minutes(30))
        .await
        .expect("offers");
    assert_eq!(offers.len(), 2);

    let accept = |offer_index: usize, recipient| {
        let storage = storage.clone();
        let offer_id = offers[offer_index].id;
        let transition = NewTransition {
            mission_id: mission.id,
            from_status: MissionStatus::Published,
            to_status: MissionStatus::Accepted,
            channel: TransitionChannel::Automatic,
            note: Some("offer accepted".into()),
            context: None,
            actor_id: recipient,
            at: Utc::now(),
        };
        async move { storage.accept_offer(offer_id, recipient, &transition).await }
    };

    match accept(0, alice.id).await.expect("accept") {
        AcceptOutcome::Accepted {
            mission,
            offer,
            withdrawn,
            record,
        } => {
            assert_eq!(mission.status, MissionStatus::Accepted);
            assert_eq!(mission.assigned_to, Some(alice.id));
            assert_eq!(offer.1.status, OfferStatus::Accepted);
            assert_eq!(withdrawn.len(), 1);
            assert_eq!(withdrawn[0].1.recipient_id, bob.id);
            assert_eq!(record.from_status, MissionStatus::Published);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(matches!(
        accept(1, bob.id).await.expect("second accept"),
        AcceptOutcome::MissionTaken
    ));

    let accepted = storage
        .list_offers(
            &OfferQuery {
                mission_id: Some(mission.id),
                status: Some(OfferStatus::Accepted),
            },
            None,
        )
        .await
        .expect("offers");
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].recipient_id, alice.id);
}

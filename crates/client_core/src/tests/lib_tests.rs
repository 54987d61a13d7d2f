use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::TransitionId;
use tokio::net::TcpListener;

use super::*;

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    authorization: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockState {
    async fn record(&self, path: impl Into<String>, headers: &HeaderMap, body: Value) {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.requests.lock().await.push(Recorded {
            path: path.into(),
            authorization,
            body,
        });
    }

    async fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().await.clone()
    }
}

type MockResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn rejected(status: StatusCode, code: ErrorCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(code, message)))
}

async fn login(Json(request): Json<LoginRequest>) -> MockResult<LoginResponse> {
    if request.email != "tech@example.com" {
        return Err(rejected(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthorized,
            "unknown account",
        ));
    }
    Ok(Json(LoginResponse {
        access_token: "token-tech".into(),
        user_id: UserId::random(),
        role: ProfileRole::Subcontractor,
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }))
}

async fn set_status(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> MockResult<StatusTransitionRecord> {
    state
        .record("/rpc/set_mission_status", &headers, body.clone())
        .await;
    let request: SetMissionStatusRequest = serde_json::from_value(body).map_err(|err| {
        rejected(StatusCode::BAD_REQUEST, ErrorCode::Validation, &err.to_string())
    })?;
    if request.target_status == MissionStatus::Paid {
        return Err(rejected(
            StatusCode::CONFLICT,
            ErrorCode::IllegalTransition,
            "transition from ACCEPTED to PAID is not allowed",
        ));
    }
    Ok(Json(StatusTransitionRecord {
        id: TransitionId(1),
        mission_id: request.mission_id,
        from_status: MissionStatus::Accepted,
        to_status: request.target_status,
        channel: request.channel,
        note: request.note,
        context: request.context,
        actor_id: request.actor_id,
        created_at: Utc::now(),
    }))
}

async fn status_history(Path(mission_id): Path<MissionId>) -> Json<Vec<StatusTransitionRecord>> {
    let actor_id = UserId::random();
    let record = |id, from_status, to_status| StatusTransitionRecord {
        id: TransitionId(id),
        mission_id,
        from_status,
        to_status,
        channel: TransitionChannel::Manual,
        note: None,
        context: None,
        actor_id,
        created_at: Utc::now(),
    };
    Json(vec![
        record(2, MissionStatus::Published, MissionStatus::Accepted),
        record(1, MissionStatus::Draft, MissionStatus::Published),
    ])
}

async fn publish(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<u32> {
    state
        .record("/rpc/publish_mission_offers", &headers, body)
        .await;
    Json(3)
}

async fn accept(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> MockResult<String> {
    state.record("/rpc/accept_mission_offer", &headers, body).await;
    Err(rejected(
        StatusCode::CONFLICT,
        ErrorCode::Conflict,
        "mission already accepted",
    ))
}

async fn refuse(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<String> {
    state.record("/rpc/refuse_mission_offer", &headers, body).await;
    Json("OK".into())
}

async fn offers(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<Offer>> {
    state.record("/offers", &headers, json!(params)).await;
    Json(Vec::new())
}

async fn delete_mission(
    State(state): State<MockState>,
    headers: HeaderMap,
    Path(mission_id): Path<MissionId>,
) -> StatusCode {
    state
        .record(format!("/missions/{mission_id}"), &headers, Value::Null)
        .await;
    StatusCode::NO_CONTENT
}

async fn notifications() -> (StatusCode, &'static str) {
    (StatusCode::BAD_GATEWAY, "upstream unavailable")
}

async fn spawn_mock_server() -> (String, MockState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = MockState::default();
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/rpc/set_mission_status", post(set_status))
        .route("/rpc/publish_mission_offers", post(publish))
        .route("/rpc/accept_mission_offer", post(accept))
        .route("/rpc/refuse_mission_offer", post(refuse))
        .route("/missions/:mission_id/status_history", get(status_history))
        .route("/missions/:mission_id", delete(delete_mission))
        .route("/offers", get(offers))
        .route("/notifications", get(notifications))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn signed_in_client() -> (MissionClient, MockState) {
    let (server_url, state) = spawn_mock_server().await;
    let client = MissionClient::new(server_url);
    client.login("tech@example.com").await.expect("login");
    (client, state)
}

fn mission_in(status: MissionStatus) -> Mission {
    Mission {
        id: MissionId::random(),
        reference: "M-1".into(),
        title: "Heat pump service".into(),
        description: None,
        status,
        customer_name: None,
        address: None,
        scheduled_start: None,
        scheduled_end: None,
        price_cents: None,
        assigned_to: None,
        created_by: UserId::random(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn calls_without_a_session_fail_before_the_network() {
    let (server_url, state) = spawn_mock_server().await;
    let client = MissionClient::new(server_url);

    let err = client
        .set_mission_status(MissionId::random(), MissionStatus::EnRoute, None, None)
        .await
        .expect_err("no session");
    assert!(matches!(err, ClientError::NotAuthenticated));
    assert!(state.requests().await.is_empty());
}

#[tokio::test]
async fn nil_mission_ids_are_rejected_locally() {
    let (client, state) = signed_in_client().await;
    let err = client
        .set_mission_status(MissionId(uuid::Uuid::nil()), MissionStatus::EnRoute, None, None)
        .await
        .expect_err("nil id");
    assert!(matches!(err, ClientError::Validation(_)));
    assert!(state.requests().await.is_empty());
}

#[tokio::test]
async fn set_mission_status_sends_a_manual_transition_as_the_signed_in_user() {
    let (client, state) = signed_in_client().await;
    let session = client.session().await.expect("session");
    let mission_id = MissionId::random();

    let record = client
        .set_mission_status(
            mission_id,
            MissionStatus::Planned,
            Some("   "),
            Some(json!({ "source": "mobile" })),
        )
        .await
        .expect("transition");
    assert_eq!(record.to_status, MissionStatus::Planned);
    assert_eq!(record.actor_id, session.user_id);

    let requests = state.requests().await;
    assert_eq!(requests.len(), 1);
    let sent = &requests[0];
    assert_eq!(sent.authorization.as_deref(), Some("Bearer token-tech"));
    assert_eq!(sent.body["channel"], "manual");
    assert_eq!(sent.body["target_status"], "PLANNED");
    assert_eq!(sent.body["actor_id"], json!(session.user_id));
    assert!(sent.body.get("note").is_none(), "blank note must be omitted");
    assert_eq!(sent.body["context"]["source"], "mobile");
}

#[tokio::test]
async fn backend_rejections_are_returned_verbatim() {
    let (client, _) = signed_in_client().await;
    let err = client
        .set_mission_status(MissionId::random(), MissionStatus::Paid, Some("skip"), None)
        .await
        .expect_err("illegal");
    assert_eq!(err.code(), Some(ErrorCode::IllegalTransition));
    assert!(err.is_conflict());
    assert_eq!(
        err.to_string(),
        "transition from ACCEPTED to PAID is not allowed"
    );
}

#[tokio::test]
async fn unknown_accounts_cannot_sign_in() {
    let (server_url, _) = spawn_mock_server().await;
    let client = MissionClient::new(server_url);
    let err = client
        .login("someone@example.com")
        .await
        .expect_err("unknown");
    assert_eq!(err.code(), Some(ErrorCode::Unauthorized));
    assert!(client.session().await.is_none());

    let err = client.login("   ").await.expect_err("blank");
    assert!(matches!(err, ClientError::Validation(_)));
}

#[tokio::test]
async fn logout_forgets_the_session() {
    let (client, _) = signed_in_client().await;
    client.logout().await;
    assert!(client.session().await.is_none());
    let err = client
        .status_timeline(MissionId::random())
        .await
        .expect_err("signed out");
    assert!(matches!(err, ClientError::NotAuthenticated));
}

#[tokio::test]
async fn status_timeline_keeps_backend_order() {
    let (client, _) = signed_in_client().await;
    let mission_id = MissionId::random();
    let timeline = client.status_timeline(mission_id).await.expect("timeline");
    assert_eq!(timeline.len(), 2);
    assert_eq!(timeline[0].to_status, MissionStatus::Accepted);
    assert_eq!(timeline[1].to_status, MissionStatus::Published);
    assert!(timeline.iter().all(|record| record.mission_id == mission_id));
}

#[tokio::test]
async fn publish_offers_validates_ttl_and_applies_the_default() {
    let (client, state) = signed_in_client().await;
    let mission_id = MissionId::random();

    for ttl in [0, MAX_OFFER_TTL_MINUTES + 1] {
        let err = client
            .publish_offers(mission_id, Some(ttl), false)
            .await
            .expect_err("bad ttl");
        assert!(matches!(err, ClientError::Validation(_)), "ttl {ttl}");
    }
    assert!(state.requests().await.is_empty());

    let created = client
        .publish_offers(mission_id, None, true)
        .await
        .expect("publish");
    assert_eq!(created, 3);
    let requests = state.requests().await;
    assert_eq!(requests[0].body["ttl_minutes"], DEFAULT_OFFER_TTL_MINUTES);
    assert_eq!(requests[0].body["include_employees"], true);
}

#[tokio::test]
async fn offer_responses_surface_conflicts() {
    let (client, state) = signed_in_client().await;
    let mission_id = MissionId::random();

    let err = client.accept_offer(mission_id).await.expect_err("taken");
    assert!(err.is_conflict());
    assert_eq!(err.to_string(), "mission already accepted");

    client.refuse_offer(mission_id).await.expect("refuse");
    let paths: Vec<String> = state
        .requests()
        .await
        .into_iter()
        .map(|request| request.path)
        .collect();
    assert_eq!(
        paths,
        vec!["/rpc/accept_mission_offer", "/rpc/refuse_mission_offer"]
    );
}

#[tokio::test]
async fn offer_queries_are_sent_as_url_parameters() {
    let (client, state) = signed_in_client().await;
    let mission_id = MissionId::random();
    client
        .offers(&OfferQuery {
            mission_id: Some(mission_id),
            status: Some(shared::domain::OfferStatus::Pending),
        })
        .await
        .expect("offers");
    let requests = state.requests().await;
    assert_eq!(requests[0].body["mission_id"], mission_id.to_string());
    assert_eq!(requests[0].body["status"], "pending");
}

#[tokio::test]
async fn empty_success_bodies_are_accepted() {
    let (client, state) = signed_in_client().await;
    let mission_id = MissionId::random();
    client.delete_mission(mission_id).await.expect("delete");
    assert_eq!(
        state.requests().await[0].path,
        format!("/missions/{mission_id}")
    );
}

#[tokio::test]
async fn unexpected_error_bodies_are_reported_as_internal() {
    let (client, _) = signed_in_client().await;
    let err = client.notifications().await.expect_err("bad gateway");
    assert_eq!(err.code(), Some(ErrorCode::Internal));
    assert!(err.to_string().contains("502"), "{err}");
    assert!(err.to_string().contains("upstream unavailable"), "{err}");
}

#[test]
fn suggested_next_status_follows_the_canonical_path() {
    assert_eq!(
        MissionClient::suggested_next_status(&mission_in(MissionStatus::Draft)),
        Some(MissionStatus::Published)
    );
    assert_eq!(
        MissionClient::suggested_next_status(&mission_in(MissionStatus::Paid)),
        Some(MissionStatus::Closed)
    );
    assert_eq!(
        MissionClient::suggested_next_status(&mission_in(MissionStatus::Closed)),
        None
    );
    assert_eq!(
        MissionClient::suggested_next_status(&mission_in(MissionStatus::Cancelled)),
        None
    );
}

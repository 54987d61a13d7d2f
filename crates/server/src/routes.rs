use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use server_api::{
    accept_mission_offer, create_mission, current_profile, delete_mission, delete_notification,
    get_mission, list_chat_messages, list_notifications, list_offers, mark_notification_read,
    post_chat_message, publish_mission_offers, query_missions, refuse_mission_offer,
    set_mission_status, status_history,
};
use shared::{
    domain::{
        ChatMessage, Mission, MissionId, Notification, NotificationId, Offer, Profile,
        StatusTransitionRecord,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        CreateMissionRequest, LoginRequest, LoginResponse, MissionOfferRequest, MissionQuery,
        OfferQuery, PostChatMessageRequest, PublishMissionOffersRequest, SetMissionStatusRequest,
    },
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use crate::{app_state::AppState, auth::AuthUser, realtime};

const MAX_REQUEST_BYTES: usize = 256 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
        .route("/rpc/set_mission_status", post(rpc_set_mission_status))
        .route("/rpc/publish_mission_offers", post(rpc_publish_mission_offers))
        .route("/rpc/accept_mission_offer", post(rpc_accept_mission_offer))
        .route("/rpc/refuse_mission_offer", post(rpc_refuse_mission_offer))
        .route("/missions", post(http_create_mission))
        .route("/missions/query", post(http_query_missions))
        .route(
            "/missions/:mission_id",
            get(http_get_mission).delete(http_delete_mission),
        )
        .route(
            "/missions/:mission_id/status_history",
            get(http_status_history),
        )
        .route(
            "/missions/:mission_id/chat",
            get(http_list_chat).post(http_post_chat),
        )
        .route("/offers", get(http_list_offers))
        .route("/notifications", get(http_list_notifications))
        .route(
            "/notifications/:notification_id",
            axum::routing::delete(http_delete_notification),
        )
        .route(
            "/notifications/:notification_id/read",
            post(http_mark_notification_read),
        )
        .route("/realtime", get(realtime::realtime_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::IllegalTransition | ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|err| {
        error!(error = %err, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let profile = server_api::login(&state.api, &req.email)
        .await
        .map_err(reject)?;
    let (access_token, expires_at) = state.tokens.issue(&profile).map_err(|err| {
        error!(error = %err, "failed to sign access token");
        reject(ApiError::new(ErrorCode::Internal, "failed to sign access token"))
    })?;
    info!(user_id = %profile.id, role = %profile.role, "session opened");
    Ok(Json(LoginResponse {
        access_token,
        user_id: profile.id,
        role: profile.role,
        expires_at,
    }))
}

async fn me(State(state): State<Arc<AppState>>, AuthUser(caller): AuthUser) -> ApiResult<Profile> {
    current_profile(&state.api, caller)
        .await
        .map(Json)
        .map_err(reject)
}

async fn rpc_set_mission_status(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Json(req): Json<SetMissionStatusRequest>,
) -> ApiResult<StatusTransitionRecord> {
    let outcome = set_mission_status(&state.api, caller, req)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn rpc_publish_mission_offers(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Json(req): Json<PublishMissionOffersRequest>,
) -> ApiResult<u32> {
    let outcome = publish_mission_offers(&state.api, caller, req)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn rpc_accept_mission_offer(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Json(req): Json<MissionOfferRequest>,
) -> ApiResult<String> {
    let outcome = accept_mission_offer(&state.api, caller, req)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn rpc_refuse_mission_offer(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Json(req): Json<MissionOfferRequest>,
) -> ApiResult<String> {
    let outcome = refuse_mission_offer(&state.api, caller, req)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn http_create_mission(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Json(req): Json<CreateMissionRequest>,
) -> ApiResult<Mission> {
    let outcome = create_mission(&state.api, caller, req)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn http_query_missions(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Json(query): Json<MissionQuery>,
) -> ApiResult<Vec<Mission>> {
    query_missions(&state.api, caller, &query)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_get_mission(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(mission_id): Path<MissionId>,
) -> ApiResult<Mission> {
    get_mission(&state.api, caller, mission_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_delete_mission(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(mission_id): Path<MissionId>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let outcome = delete_mission(&state.api, caller, mission_id)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_status_history(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(mission_id): Path<MissionId>,
) -> ApiResult<Vec<StatusTransitionRecord>> {
    status_history(&state.api, caller, mission_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(mission_id): Path<MissionId>,
) -> ApiResult<Vec<ChatMessage>> {
    list_chat_messages(&state.api, caller, mission_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_post_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(mission_id): Path<MissionId>,
    Json(req): Json<PostChatMessageRequest>,
) -> ApiResult<ChatMessage> {
    let outcome = post_chat_message(&state.api, caller, mission_id, &req.body)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn http_list_offers(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Query(query): Query<OfferQuery>,
) -> ApiResult<Vec<Offer>> {
    list_offers(&state.api, caller, &query)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_notifications(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
) -> ApiResult<Vec<Notification>> {
    list_notifications(&state.api, caller)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_mark_notification_read(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(notification_id): Path<NotificationId>,
) -> ApiResult<Notification> {
    let outcome = mark_notification_read(&state.api, caller, notification_id)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(Json(outcome.value))
}

async fn http_delete_notification(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(notification_id): Path<NotificationId>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let outcome = delete_notification(&state.api, caller, notification_id)
        .await
        .map_err(reject)?;
    state.publish(outcome.changes);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod tests;

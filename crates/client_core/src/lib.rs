//! Client data-access layer for the mission backend.
//!
//! [`MissionClient`] wraps the remote procedures and table reads behind typed calls;
//! [`RealtimeClient`] opens the change stream and hands out explicit subscription handles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{
        ChatMessage, Mission, MissionId, MissionStatus, Notification, NotificationId, Offer,
        Profile, ProfileRole, StatusTransitionRecord, TransitionChannel, UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        CreateMissionRequest, LoginRequest, LoginResponse, MissionOfferRequest, MissionQuery,
        OfferQuery, PostChatMessageRequest, PublishMissionOffersRequest, SetMissionStatusRequest,
        DEFAULT_OFFER_TTL_MINUTES, MAX_OFFER_TTL_MINUTES,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod error;
pub mod realtime;

pub use error::{ClientError, ClientResult};
pub use realtime::{RealtimeClient, RealtimeConnection, Subscription};

/// Authenticated identity attached to every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user_id: UserId,
    pub role: ProfileRole,
    pub expires_at: DateTime<Utc>,
}

impl From<LoginResponse> for Session {
    fn from(value: LoginResponse) -> Self {
        Self {
            access_token: value.access_token,
            user_id: value.user_id,
            role: value.role,
            expires_at: value.expires_at,
        }
    }
}

/// The lifecycle and offer operations a screen drives.
#[async_trait]
pub trait MissionGateway: Send + Sync {
    async fn set_mission_status(
        &self,
        mission_id: MissionId,
        target_status: MissionStatus,
        note: Option<&str>,
        context: Option<serde_json::Value>,
    ) -> ClientResult<StatusTransitionRecord>;
    async fn status_timeline(&self, mission_id: MissionId)
        -> ClientResult<Vec<StatusTransitionRecord>>;
    async fn publish_offers(
        &self,
        mission_id: MissionId,
        ttl_minutes: Option<u32>,
        include_employees: bool,
    ) -> ClientResult<u32>;
    async fn accept_offer(&self, mission_id: MissionId) -> ClientResult<()>;
    async fn refuse_offer(&self, mission_id: MissionId) -> ClientResult<()>;
}

pub struct MissionClient {
    http: Client,
    server_url: String,
    session: Mutex<Option<Session>>,
}

impl MissionClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        }
    }

    /// Resumes a session obtained earlier, e.g. restored from disk.
    pub fn with_session(server_url: impl Into<String>, session: Session) -> Self {
        let client = Self::new(server_url);
        Self {
            session: Mutex::new(Some(session)),
            ..client
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    pub async fn login(&self, email: &str) -> ClientResult<Session> {
        let email = email.trim();
        if email.is_empty() {
            return Err(ClientError::Validation("email is required".into()));
        }
        let response: LoginResponse = decode(
            self.http
                .post(self.url("/auth/login"))
                .json(&LoginRequest {
                    email: email.to_string(),
                })
                .send()
                .await?,
        )
        .await?;
        let session = Session::from(response);
        info!(user_id = %session.user_id, role = %session.role, "signed in");
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    pub async fn logout(&self) {
        if let Some(session) = self.session.lock().await.take() {
            info!(user_id = %session.user_id, "signed out");
        }
    }

    pub async fn me(&self) -> ClientResult<Profile> {
        let session = self.require_session().await?;
        self.get(&session, "/auth/me").await
    }

    /// Canonical next step for a mission, for display only; the backend decides legality.
    pub fn suggested_next_status(mission: &Mission) -> Option<MissionStatus> {
        mission.status.next()
    }

    pub async fn query_missions(&self, query: &MissionQuery) -> ClientResult<Vec<Mission>> {
        let session = self.require_session().await?;
        decode(
            self.authorized(self.http.post(self.url("/missions/query")), &session)
                .json(query)
                .send()
                .await?,
        )
        .await
    }

    pub async fn mission(&self, mission_id: MissionId) -> ClientResult<Mission> {
        require_mission_id(mission_id)?;
        let session = self.require_session().await?;
        self.get(&session, &format!("/missions/{mission_id}")).await
    }

    pub async fn create_mission(&self, request: &CreateMissionRequest) -> ClientResult<Mission> {
        if request.reference.trim().is_empty() || request.title.trim().is_empty() {
            return Err(ClientError::Validation(
                "reference and title are required".into(),
            ));
        }
        let session = self.require_session().await?;
        decode(
            self.authorized(self.http.post(self.url("/missions")), &session)
                .json(request)
                .send()
                .await?,
        )
        .await
    }

    pub async fn delete_mission(&self, mission_id: MissionId) -> ClientResult<()> {
        require_mission_id(mission_id)?;
        let session = self.require_session().await?;
        expect_empty(
            self.authorized(
                self.http.delete(self.url(&format!("/missions/{mission_id}"))),
                &session,
            )
            .send()
            .await?,
        )
        .await
    }

    pub async fn offers(&self, query: &OfferQuery) -> ClientResult<Vec<Offer>> {
        let session = self.require_session().await?;
        let mut params = Vec::new();
        if let Some(mission_id) = query.mission_id {
            params.push(("mission_id", mission_id.to_string()));
        }
        if let Some(status) = query.status {
            params.push(("status", status.to_string()));
        }
        decode(
            self.authorized(self.http.get(self.url("/offers")), &session)
                .query(&params)
                .send()
                .await?,
        )
        .await
    }

    pub async fn notifications(&self) -> ClientResult<Vec<Notification>> {
        let session = self.require_session().await?;
        self.get(&session, "/notifications").await
    }

    pub async fn mark_notification_read(
        &self,
        notification_id: NotificationId,
    ) -> ClientResult<Notification> {
        let session = self.require_session().await?;
        decode(
            self.authorized(
                self.http
                    .post(self.url(&format!("/notifications/{notification_id}/read"))),
                &session,
            )
            .send()
            .await?,
        )
        .await
    }

    pub async fn delete_notification(&self, notification_id: NotificationId) -> ClientResult<()> {
        let session = self.require_session().await?;
        expect_empty(
            self.authorized(
                self.http
                    .delete(self.url(&format!("/notifications/{notification_id}"))),
                &session,
            )
            .send()
            .await?,
        )
        .await
    }

    pub async fn chat_messages(&self, mission_id: MissionId) -> ClientResult<Vec<ChatMessage>> {
        require_mission_id(mission_id)?;
        let session = self.require_session().await?;
        self.get(&session, &format!("/missions/{mission_id}/chat"))
            .await
    }

    pub async fn post_chat_message(
        &self,
        mission_id: MissionId,
        body: &str,
    ) -> ClientResult<ChatMessage> {
        require_mission_id(mission_id)?;
        if body.trim().is_empty() {
            return Err(ClientError::Validation("message body is empty".into()));
        }
        let session = self.require_session().await?;
        decode(
            self.authorized(
                self.http.post(self.url(&format!("/missions/{mission_id}/chat"))),
                &session,
            )
            .json(&PostChatMessageRequest {
                body: body.to_string(),
            })
            .send()
            .await?,
        )
        .await
    }

    /// Opens the change stream with the current session's token.
    pub async fn realtime(&self) -> ClientResult<RealtimeConnection> {
        let session = self.require_session().await?;
        RealtimeClient::connect(&self.server_url, &session.access_token).await
    }

    async fn require_session(&self) -> ClientResult<Session> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotAuthenticated)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn authorized(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request.bearer_auth(&session.access_token)
    }

    async fn get<T: DeserializeOwned>(&self, session: &Session, path: &str) -> ClientResult<T> {
        decode(
            self.authorized(self.http.get(self.url(path)), session)
                .send()
                .await?,
        )
        .await
    }

    async fn rpc<B, T>(&self, session: &Session, procedure: &str, body: &B) -> ClientResult<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(procedure, "calling remote procedure");
        decode(
            self.authorized(self.http.post(self.url(&format!("/rpc/{procedure}"))), session)
                .json(body)
                .send()
                .await?,
        )
        .await
    }
}

#[async_trait]
impl MissionGateway for MissionClient {
    /// Submits a manual transition on behalf of the signed-in user. No local legality
    /// check is made; the backend's verdict is returned as is.
    async fn set_mission_status(
        &self,
        mission_id: MissionId,
        target_status: MissionStatus,
        note: Option<&str>,
        context: Option<serde_json::Value>,
    ) -> ClientResult<StatusTransitionRecord> {
        let session = self.require_session().await?;
        require_mission_id(mission_id)?;
        let request = SetMissionStatusRequest {
            mission_id,
            target_status,
            actor_id: session.user_id,
            channel: TransitionChannel::Manual,
            note: note
                .map(str::trim)
                .filter(|note| !note.is_empty())
                .map(str::to_string),
            context,
        };
        let record: StatusTransitionRecord = self
            .rpc(&session, "set_mission_status", &request)
            .await
            .inspect_err(|err| {
                warn!(mission_id = %mission_id, target = %target_status, error = %err, "status change rejected")
            })?;
        info!(
            mission_id = %mission_id,
            from = %record.from_status,
            to = %record.to_status,
            "mission status changed"
        );
        Ok(record)
    }

    /// Every recorded transition of the mission, newest first.
    async fn status_timeline(
        &self,
        mission_id: MissionId,
    ) -> ClientResult<Vec<StatusTransitionRecord>> {
        require_mission_id(mission_id)?;
        let session = self.require_session().await?;
        self.get(&session, &format!("/missions/{mission_id}/status_history"))
            .await
    }

    async fn publish_offers(
        &self,
        mission_id: MissionId,
        ttl_minutes: Option<u32>,
        include_employees: bool,
    ) -> ClientResult<u32> {
        require_mission_id(mission_id)?;
        let ttl_minutes = ttl_minutes.unwrap_or(DEFAULT_OFFER_TTL_MINUTES);
        if !(1..=MAX_OFFER_TTL_MINUTES).contains(&ttl_minutes) {
            return Err(ClientError::Validation(format!(
                "ttl_minutes must be between 1 and {MAX_OFFER_TTL_MINUTES}"
            )));
        }
        let session = self.require_session().await?;
        let created: u32 = self
            .rpc(
                &session,
                "publish_mission_offers",
                &PublishMissionOffersRequest {
                    mission_id,
                    ttl_minutes,
                    include_employees,
                },
            )
            .await?;
        info!(mission_id = %mission_id, created, "mission offers published");
        Ok(created)
    }

    async fn accept_offer(&self, mission_id: MissionId) -> ClientResult<()> {
        require_mission_id(mission_id)?;
        let session = self.require_session().await?;
        let _: String = self
            .rpc(&session, "accept_mission_offer", &MissionOfferRequest { mission_id })
            .await?;
        Ok(())
    }

    async fn refuse_offer(&self, mission_id: MissionId) -> ClientResult<()> {
        require_mission_id(mission_id)?;
        let session = self.require_session().await?;
        let _: String = self
            .rpc(&session, "refuse_mission_offer", &MissionOfferRequest { mission_id })
            .await?;
        Ok(())
    }
}

fn require_mission_id(mission_id: MissionId) -> ClientResult<()> {
    if mission_id.is_nil() {
        Err(ClientError::Validation("mission id is required".into()))
    } else {
        Ok(())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let response = ensure_success(response).await?;
    Ok(response.json().await?)
}

async fn expect_empty(response: Response) -> ClientResult<()> {
    ensure_success(response).await.map(|_| ())
}

/// Non-2xx responses carry an `ApiError` body; anything else is reported as internal.
async fn ensure_success(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await?;
    let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        ApiError::new(
            ErrorCode::Internal,
            format!("unexpected response {status}: {body}"),
        )
    });
    Err(ClientError::Remote(error))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChatMessage, Mission, MissionId, MissionStatus, Notification, Offer, OfferStatus,
        ProfileRole, StatusTransitionRecord, TransitionChannel, UserId,
    },
    error::ApiError,
};

pub const DEFAULT_OFFER_TTL_MINUTES: u32 = 30;
pub const MAX_OFFER_TTL_MINUTES: u32 = 7 * 24 * 60;
pub const RPC_OK: &str = "OK";
pub const DEFAULT_MISSION_PAGE_SIZE: u32 = 50;
pub const MAX_MISSION_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user_id: UserId,
    pub role: ProfileRole,
    pub expires_at: DateTime<Utc>,
}

/// Input of the `set_mission_status` remote procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMissionStatusRequest {
    pub mission_id: MissionId,
    pub target_status: MissionStatus,
    pub actor_id: UserId,
    pub channel: TransitionChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Input of the `publish_mission_offers` remote procedure. The procedure answers with
/// the number of offers it created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMissionOffersRequest {
    pub mission_id: MissionId,
    pub ttl_minutes: u32,
    #[serde(default)]
    pub include_employees: bool,
}

/// Input of `accept_mission_offer` and `refuse_mission_offer`; both answer [`RPC_OK`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionOfferRequest {
    pub mission_id: MissionId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateMissionRequest {
    pub reference: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionSort {
    #[default]
    CreatedAt,
    ScheduledStart,
    UpdatedAt,
}

impl MissionSort {
    pub fn column(&self) -> &'static str {
        match self {
            MissionSort::CreatedAt => "created_at",
            MissionSort::ScheduledStart => "scheduled_start",
            MissionSort::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<MissionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default)]
    pub sort_by: MissionSort,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

impl MissionQuery {
    pub fn page_size(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_MISSION_PAGE_SIZE)
            .clamp(1, MAX_MISSION_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<MissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OfferStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostChatMessageRequest {
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Missions,
    MissionOffers,
    StatusTransitions,
    Notifications,
    ChatMessages,
}

impl Topic {
    /// Columns a subscription may filter on. This list is the change-stream schema contract.
    pub fn filterable_columns(&self) -> &'static [&'static str] {
        match self {
            Topic::Missions => &["id", "status", "assigned_to", "created_by"],
            Topic::MissionOffers => &["id", "mission_id", "recipient_id", "status"],
            Topic::StatusTransitions => &["mission_id", "actor_id", "to_status"],
            Topic::Notifications => &["recipient_id", "kind", "mission_id"],
            Topic::ChatMessages => &["mission_id", "author_id"],
        }
    }

    pub fn validate_filter(&self, filter: &RowFilter) -> Result<(), ApiError> {
        if self.filterable_columns().contains(&filter.column.as_str()) {
            Ok(())
        } else {
            Err(ApiError::validation(format!(
                "column '{}' is not filterable on topic {:?}",
                filter.column, self
            )))
        }
    }
}

/// Equality predicate on one column of a changed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn column_eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.column_value(&self.column).as_deref() == Some(self.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Row {
    Mission(Mission),
    MissionOffer(Offer),
    StatusTransition(StatusTransitionRecord),
    Notification(Notification),
    ChatMessage(ChatMessage),
}

impl Row {
    pub fn topic(&self) -> Topic {
        match self {
            Row::Mission(_) => Topic::Missions,
            Row::MissionOffer(_) => Topic::MissionOffers,
            Row::StatusTransition(_) => Topic::StatusTransitions,
            Row::Notification(_) => Topic::Notifications,
            Row::ChatMessage(_) => Topic::ChatMessages,
        }
    }

    /// Column value rendered as text, the way filters compare it.
    pub fn column_value(&self, column: &str) -> Option<String> {
        let value = match self {
            Row::Mission(row) => serde_json::to_value(row),
            Row::MissionOffer(row) => serde_json::to_value(row),
            Row::StatusTransition(row) => serde_json::to_value(row),
            Row::Notification(row) => serde_json::to_value(row),
            Row::ChatMessage(row) => serde_json::to_value(row),
        }
        .ok()?;
        match value.get(column)? {
            serde_json::Value::String(text) => Some(text.clone()),
            serde_json::Value::Number(number) => Some(number.to_string()),
            serde_json::Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One committed change on a watched table. `old` is present for updates and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert(row: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
            committed_at: Utc::now(),
        }
    }

    pub fn update(old: Row, new: Row) -> Self {
        Self {
            kind: ChangeKind::Update,
            new: Some(new),
            old: Some(old),
            committed_at: Utc::now(),
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
            committed_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> Option<Topic> {
        self.new.as_ref().or(self.old.as_ref()).map(Row::topic)
    }

    /// Matches when either side of the change satisfies the filter, so a row moving
    /// out of a filtered set is still reported once.
    pub fn matches(&self, topic: Topic, filter: Option<&RowFilter>) -> bool {
        if self.topic() != Some(topic) {
            return false;
        }
        let Some(filter) = filter else {
            return true;
        };
        self.new
            .iter()
            .chain(self.old.iter())
            .any(|row| filter.matches(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeRequest {
    Subscribe {
        subscription_id: SubscriptionId,
        topic: Topic,
        #[serde(default)]
        filter: Option<RowFilter>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeMessage {
    Subscribed {
        subscription_id: SubscriptionId,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    Change {
        subscription_id: SubscriptionId,
        event: ChangeEvent,
    },
    SubscriptionError {
        subscription_id: SubscriptionId,
        error: ApiError,
    },
    Error(ApiError),
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;

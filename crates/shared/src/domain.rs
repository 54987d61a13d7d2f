use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

/// Declares a closed set of labels with a single wire and storage spelling.
macro_rules! label_enum {
    ($kind:literal, $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(UnknownLabel {
                        kind: $kind,
                        label: other.to_string(),
                    }),
                }
            }
        }
    };
}

uuid_newtype!(MissionId);
uuid_newtype!(UserId);

id_newtype!(TransitionId);
id_newtype!(OfferId);
id_newtype!(NotificationId);
id_newtype!(ChatMessageId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} label '{label}'")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub label: String,
}

label_enum!("mission status", MissionStatus {
    Draft => "DRAFT",
    Published => "PUBLISHED",
    Accepted => "ACCEPTED",
    Planned => "PLANNED",
    EnRoute => "EN_ROUTE",
    InProgress => "IN_PROGRESS",
    Done => "DONE",
    Billable => "BILLABLE",
    Billed => "BILLED",
    Paid => "PAID",
    Closed => "CLOSED",
    Cancelled => "CANCELLED",
});

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionStatus::Closed | MissionStatus::Cancelled)
    }
}

label_enum!("transition channel", TransitionChannel {
    Manual => "manual",
    Automatic => "automatic",
});

label_enum!("offer status", OfferStatus {
    Pending => "pending",
    Accepted => "accepted",
    Refused => "refused",
    Expired => "expired",
    Withdrawn => "withdrawn",
});

label_enum!("profile role", ProfileRole {
    Admin => "admin",
    Employee => "employee",
    Subcontractor => "subcontractor",
});

impl ProfileRole {
    /// Back-office roles see and manage every mission.
    pub fn is_staff(&self) -> bool {
        matches!(self, ProfileRole::Admin | ProfileRole::Employee)
    }
}

label_enum!("notification kind", NotificationKind {
    MissionOffer => "mission_offer",
    OfferAccepted => "offer_accepted",
    MissionStatus => "mission_status",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: ProfileRole,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: MissionId,
    pub reference: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: MissionStatus,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit entry written once per accepted status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransitionRecord {
    pub id: TransitionId,
    pub mission_id: MissionId,
    pub from_status: MissionStatus,
    pub to_status: MissionStatus,
    pub channel: TransitionChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub actor_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub mission_id: MissionId,
    pub recipient_id: UserId,
    pub status: OfferStatus,
    pub sent_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Pending && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<MissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ChatMessageId,
    pub mission_id: MissionId,
    pub author_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

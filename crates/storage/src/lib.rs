use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::info;
use uuid::Uuid;

use shared::{
    domain::{
        ChatMessage, ChatMessageId, Mission, MissionId, MissionStatus, Notification,
        NotificationId, NotificationKind, Offer, OfferId, OfferStatus, Profile, ProfileRole,
        StatusTransitionRecord, TransitionChannel, TransitionId, UserId,
    },
    protocol::{CreateMissionRequest, MissionQuery, OfferQuery},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A status change to apply atomically: compare-and-set on the mission row plus
/// one appended history record.
#[derive(Debug, Clone)]
pub struct NewTransition {
    pub mission_id: MissionId,
    pub from_status: MissionStatus,
    pub to_status: MissionStatus,
    pub channel: TransitionChannel,
    pub note: Option<String>,
    pub context: Option<serde_json::Value>,
    pub actor_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub mission: Mission,
    pub record: StatusTransitionRecord,
    /// Offers still pending when the mission left PUBLISHED, before and after.
    pub withdrawn: Vec<(Offer, Offer)>,
}

#[derive(Debug, Clone)]
pub enum AcceptOutcome {
    Accepted {
        mission: Mission,
        record: StatusTransitionRecord,
        offer: (Offer, Offer),
        withdrawn: Vec<(Offer, Offer)>,
    },
    /// The mission left PUBLISHED before this acceptance committed.
    MissionTaken,
    /// The caller's offer stopped being pending before this acceptance committed.
    OfferClosed,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub mission_id: Option<MissionId>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // An in-memory database lives exactly as long as its single connection.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(connect_options)
        .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(%database_url, "storage ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_profile(
        &self,
        email: &str,
        display_name: &str,
        role: ProfileRole,
    ) -> Result<Profile> {
        let profile = Profile {
            id: UserId::random(),
            email: email.trim().to_ascii_lowercase(),
            display_name: display_name.to_string(),
            role,
            active: true,
        };
        sqlx::query(
            "INSERT INTO profiles (id, email, display_name, role, active, created_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(profile.id.to_string())
        .bind(&profile.email)
        .bind(&profile.display_name)
        .bind(role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create profile '{}'", profile.email))?;
        Ok(profile)
    }

    pub async fn profile(&self, user_id: UserId) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT * FROM profiles WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT * FROM profiles WHERE email = ?")
            .bind(email.trim().to_ascii_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn set_profile_active(&self, user_id: UserId, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE profiles SET active = ? WHERE id = ?")
            .bind(active)
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Active profiles eligible for mission offers.
    pub async fn list_offer_recipients(&self, include_employees: bool) -> Result<Vec<Profile>> {
        let rows = sqlx::query(
            "SELECT * FROM profiles
             WHERE active = 1 AND (role = 'subcontractor' OR (? AND role = 'employee'))
             ORDER BY email",
        )
        .bind(include_employees)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(profile_from_row).collect()
    }

    pub async fn insert_mission(
        &self,
        created_by: UserId,
        request: &CreateMissionRequest,
    ) -> Result<Mission> {
        let now = Utc::now();
        let mission = Mission {
            id: MissionId::random(),
            reference: request.reference.trim().to_string(),
            title: request.title.trim().to_string(),
            description: request.description.clone(),
            status: MissionStatus::Draft,
            customer_name: request.customer_name.clone(),
            address: request.address.clone(),
            scheduled_start: request.scheduled_start,
            scheduled_end: request.scheduled_end,
            price_cents: request.price_cents,
            assigned_to: None,
            created_by,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO missions (
                id, reference, title, description, status, customer_name, address,
                scheduled_start, scheduled_end, price_cents, assigned_to, created_by,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(mission.id.to_string())
        .bind(&mission.reference)
        .bind(&mission.title)
        .bind(&mission.description)
        .bind(mission.status.as_str())
        .bind(&mission.customer_name)
        .bind(&mission.address)
        .bind(mission.scheduled_start)
        .bind(mission.scheduled_end)
        .bind(mission.price_cents)
        .bind(created_by.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert mission '{}'", mission.reference))?;
        Ok(mission)
    }

    pub async fn mission(&self, mission_id: MissionId) -> Result<Option<Mission>> {
        let row = sqlx::query("SELECT * FROM missions WHERE id = ?")
            .bind(mission_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(mission_from_row).transpose()
    }

    /// Filtered, sorted, paginated mission listing. `visible_to` restricts the
    /// result to missions assigned to that profile.
    pub async fn query_missions(
        &self,
        query: &MissionQuery,
        visible_to: Option<UserId>,
    ) -> Result<Vec<Mission>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM missions WHERE 1 = 1");
        if !query.statuses.is_empty() {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in &query.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(assigned_to) = query.assigned_to {
            builder
                .push(" AND assigned_to = ")
                .push_bind(assigned_to.to_string());
        }
        if let Some(user_id) = visible_to {
            builder
                .push(" AND assigned_to = ")
                .push_bind(user_id.to_string());
        }
        if let Some(search) = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|search| !search.is_empty())
        {
            let pattern = format!("%{search}%");
            builder
                .push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" OR reference LIKE ")
                .push_bind(pattern.clone())
                .push(" OR customer_name LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        let direction = if query.descending { "DESC" } else { "ASC" };
        builder.push(format!(
            " ORDER BY {} {direction}, reference ASC",
            query.sort_by.column()
        ));
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(query.page_size()))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(mission_from_row).collect()
    }

    /// Removes a mission with its offers and chat. The status history is kept.
    pub async fn delete_mission(&self, mission_id: MissionId) -> Result<Option<Mission>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM missions WHERE id = ?")
            .bind(mission_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mission = mission_from_row(&row)?;
        for statement in [
            "DELETE FROM mission_offers WHERE mission_id = ?",
            "DELETE FROM chat_messages WHERE mission_id = ?",
            "DELETE FROM missions WHERE id = ?",
        ] {
            sqlx::query(statement)
                .bind(mission_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(Some(mission))
    }

    /// Applies a transition only if the mission is still in `from_status`.
    /// Returns `None` when another writer moved the mission first. Leaving PUBLISHED
    /// withdraws the mission's pending offers in the same transaction.
    pub async fn apply_transition(
        &self,
        transition: &NewTransition,
    ) -> Result<Option<AppliedTransition>> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE missions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(transition.to_status.as_str())
        .bind(transition.at)
        .bind(transition.mission_id.to_string())
        .bind(transition.from_status.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let withdrawn = if transition.from_status == MissionStatus::Published {
            withdraw_pending_offers(&mut tx, transition.mission_id, transition.at).await?
        } else {
            Vec::new()
        };
        let record = insert_history(&mut tx, transition).await?;
        let row = sqlx::query("SELECT * FROM missions WHERE id = ?")
            .bind(transition.mission_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let mission = mission_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(AppliedTransition {
            mission,
            record,
            withdrawn,
        }))
    }

    /// Accepts `recipient_id`'s pending offer: moves the mission PUBLISHED -> ACCEPTED,
    /// assigns it, withdraws every other pending offer and appends the history record.
    pub async fn accept_offer(
        &self,
        offer_id: OfferId,
        recipient_id: UserId,
        transition: &NewTransition,
    ) -> Result<AcceptOutcome> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "UPDATE missions SET status = ?, assigned_to = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(transition.to_status.as_str())
        .bind(recipient_id.to_string())
        .bind(transition.at)
        .bind(transition.mission_id.to_string())
        .bind(transition.from_status.as_str())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(AcceptOutcome::MissionTaken);
        }

        let pending_rows = sqlx::query(
            "SELECT * FROM mission_offers WHERE mission_id = ? AND status = 'pending' ORDER BY id",
        )
        .bind(transition.mission_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
        let pending = pending_rows
            .iter()
            .map(offer_from_row)
            .collect::<Result<Vec<_>>>()?;
        let Some(before) = pending.iter().find(|offer| offer.id == offer_id).cloned() else {
            tx.rollback().await?;
            return Ok(AcceptOutcome::OfferClosed);
        };

        sqlx::query("UPDATE mission_offers SET status = 'accepted', responded_at = ? WHERE id = ?")
            .bind(transition.at)
            .bind(offer_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE mission_offers SET status = 'withdrawn', responded_at = ?
             WHERE mission_id = ? AND status = 'pending'",
        )
        .bind(transition.at)
        .bind(transition.mission_id.to_string())
        .execute(&mut *tx)
        .await?;

        let record = insert_history(&mut tx, transition).await?;
        let row = sqlx::query("SELECT * FROM missions WHERE id = ?")
            .bind(transition.mission_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let mission = mission_from_row(&row)?;
        tx.commit().await?;

        let responded = |offer: &Offer, status: OfferStatus| Offer {
            status,
            responded_at: Some(transition.at),
            ..offer.clone()
        };
        let accepted = responded(&before, OfferStatus::Accepted);
        let withdrawn = pending
            .iter()
            .filter(|offer| offer.id != offer_id)
            .map(|offer| (offer.clone(), responded(offer, OfferStatus::Withdrawn)))
            .collect();
        Ok(AcceptOutcome::Accepted {
            mission,
            record,
            offer: (before, accepted),
            withdrawn,
        })
    }

    pub async fn status_history(&self, mission_id: MissionId) -> Result<Vec<StatusTransitionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM mission_status_history
             WHERE mission_id = ?
             ORDER BY created_at DESC, id DESC",
        )
        .bind(mission_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transition_from_row).collect()
    }

    pub async fn latest_transition_at(&self, mission_id: MissionId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM mission_status_history
             WHERE mission_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(mission_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get::<DateTime<Utc>, _>("created_at"))
            .transpose()
            .map_err(Into::into)
    }

    /// Creates one pending offer per recipient that has no pending offer for the mission yet.
    pub async fn create_offers(
        &self,
        mission_id: MissionId,
        recipients: &[UserId],
        sent_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<Offer>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::new();
        for recipient_id in recipients {
            let row = sqlx::query(
                "INSERT INTO mission_offers (mission_id, recipient_id, status, sent_at, expires_at)
                 SELECT ?1, ?2, 'pending', ?3, ?4
                 WHERE NOT EXISTS (
                     SELECT 1 FROM mission_offers
                     WHERE mission_id = ?1 AND recipient_id = ?2 AND status = 'pending'
                 )
                 RETURNING *",
            )
            .bind(mission_id.to_string())
            .bind(recipient_id.to_string())
            .bind(sent_at)
            .bind(expires_at)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                created.push(offer_from_row(&row)?);
            }
        }
        tx.commit().await?;
        Ok(created)
    }

    pub async fn offer_for(
        &self,
        mission_id: MissionId,
        recipient_id: UserId,
    ) -> Result<Option<Offer>> {
        let row = sqlx::query(
            "SELECT * FROM mission_offers
             WHERE mission_id = ? AND recipient_id = ?
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(mission_id.to_string())
        .bind(recipient_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    pub async fn list_offers(
        &self,
        query: &OfferQuery,
        recipient_id: Option<UserId>,
    ) -> Result<Vec<Offer>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM mission_offers WHERE 1 = 1");
        if let Some(mission_id) = query.mission_id {
            builder
                .push(" AND mission_id = ")
                .push_bind(mission_id.to_string());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(recipient_id) = recipient_id {
            builder
                .push(" AND recipient_id = ")
                .push_bind(recipient_id.to_string());
        }
        builder.push(" ORDER BY sent_at DESC, id DESC");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(offer_from_row).collect()
    }

    /// Closes a pending offer with a terminal response status. Returns the offer before
    /// and after, or `None` when it was no longer pending.
    pub async fn close_offer(
        &self,
        offer_id: OfferId,
        status: OfferStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<(Offer, Offer)>> {
        let mut tx = self.pool.begin().await?;
        let before = sqlx::query("SELECT * FROM mission_offers WHERE id = ? AND status = 'pending'")
            .bind(offer_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(before) = before.as_ref().map(offer_from_row).transpose()? else {
            return Ok(None);
        };
        let after = sqlx::query(
            "UPDATE mission_offers SET status = ?, responded_at = ? WHERE id = ? RETURNING *",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(offer_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let after = offer_from_row(&after)?;
        tx.commit().await?;
        Ok(Some((before, after)))
    }

    /// Marks every pending offer whose window ended at or before `now` as expired.
    pub async fn expire_offers(&self, now: DateTime<Utc>) -> Result<Vec<(Offer, Offer)>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT * FROM mission_offers WHERE status = 'pending' AND expires_at <= ? ORDER BY id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        let stale = rows
            .iter()
            .map(offer_from_row)
            .collect::<Result<Vec<_>>>()?;
        let mut expired = Vec::with_capacity(stale.len());
        for offer in stale {
            sqlx::query("UPDATE mission_offers SET status = 'expired' WHERE id = ?")
                .bind(offer.id.0)
                .execute(&mut *tx)
                .await?;
            let after = Offer {
                status: OfferStatus::Expired,
                ..offer.clone()
            };
            expired.push((offer, after));
        }
        tx.commit().await?;
        Ok(expired)
    }

    pub async fn insert_notification(&self, notification: &NewNotification) -> Result<Notification> {
        let row = sqlx::query(
            "INSERT INTO notifications (recipient_id, kind, title, body, mission_id, read_at, created_at)
             VALUES (?, ?, ?, ?, ?, NULL, ?)
             RETURNING *",
        )
        .bind(notification.recipient_id.to_string())
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.mission_id.map(|id| id.to_string()))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        notification_from_row(&row)
    }

    pub async fn notifications_for(&self, recipient_id: UserId) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE recipient_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(recipient_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    pub async fn mark_notification_read(
        &self,
        notification_id: NotificationId,
        recipient_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<(Notification, Notification)>> {
        let mut tx = self.pool.begin().await?;
        let before = sqlx::query("SELECT * FROM notifications WHERE id = ? AND recipient_id = ?")
            .bind(notification_id.0)
            .bind(recipient_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(before) = before.as_ref().map(notification_from_row).transpose()? else {
            return Ok(None);
        };
        let after = sqlx::query(
            "UPDATE notifications SET read_at = COALESCE(read_at, ?) WHERE id = ? RETURNING *",
        )
        .bind(at)
        .bind(notification_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let after = notification_from_row(&after)?;
        tx.commit().await?;
        Ok(Some((before, after)))
    }

    pub async fn delete_notification(
        &self,
        notification_id: NotificationId,
        recipient_id: UserId,
    ) -> Result<Option<Notification>> {
        let row = sqlx::query("DELETE FROM notifications WHERE id = ? AND recipient_id = ? RETURNING *")
            .bind(notification_id.0)
            .bind(recipient_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    pub async fn insert_chat_message(
        &self,
        mission_id: MissionId,
        author_id: UserId,
        body: &str,
    ) -> Result<ChatMessage> {
        let row = sqlx::query(
            "INSERT INTO chat_messages (mission_id, author_id, body, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING *",
        )
        .bind(mission_id.to_string())
        .bind(author_id.to_string())
        .bind(body)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        chat_message_from_row(&row)
    }

    pub async fn chat_messages(&self, mission_id: MissionId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE mission_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(mission_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chat_message_from_row).collect()
    }
}

async fn withdraw_pending_offers(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    mission_id: MissionId,
    at: DateTime<Utc>,
) -> Result<Vec<(Offer, Offer)>> {
    let rows = sqlx::query(
        "UPDATE mission_offers SET status = 'withdrawn', responded_at = ?
         WHERE mission_id = ? AND status = 'pending'
         RETURNING *",
    )
    .bind(at)
    .bind(mission_id.to_string())
    .fetch_all(&mut **tx)
    .await?;
    let mut withdrawn = rows
        .iter()
        .map(offer_from_row)
        .collect::<Result<Vec<_>>>()?;
    withdrawn.sort_by_key(|offer| offer.id);
    Ok(withdrawn
        .into_iter()
        .map(|after| {
            let before = Offer {
                status: OfferStatus::Pending,
                responded_at: None,
                ..after.clone()
            };
            (before, after)
        })
        .collect())
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    transition: &NewTransition,
) -> Result<StatusTransitionRecord> {
    let context = transition
        .context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let row = sqlx::query(
        "INSERT INTO mission_status_history (
            mission_id, from_status, to_status, channel, note, context, actor_id, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(transition.mission_id.to_string())
    .bind(transition.from_status.as_str())
    .bind(transition.to_status.as_str())
    .bind(transition.channel.as_str())
    .bind(&transition.note)
    .bind(context)
    .bind(transition.actor_id.to_string())
    .bind(transition.at)
    .fetch_one(&mut **tx)
    .await?;
    transition_from_row(&row)
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("malformed uuid '{raw}' in storage"))
}

fn label<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|err| anyhow!(err).context(format!("invalid value in column {column}")))
}

fn optional_uuid(row: &SqliteRow, column: &str) -> Result<Option<Uuid>> {
    row.try_get::<Option<String>, _>(column)?
        .as_deref()
        .map(parse_uuid)
        .transpose()
}

fn profile_from_row(row: &SqliteRow) -> Result<Profile> {
    Ok(Profile {
        id: UserId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        role: label::<ProfileRole>(row, "role")?,
        active: row.try_get("active")?,
    })
}

fn mission_from_row(row: &SqliteRow) -> Result<Mission> {
    Ok(Mission {
        id: MissionId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        reference: row.try_get("reference")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: label::<MissionStatus>(row, "status")?,
        customer_name: row.try_get("customer_name")?,
        address: row.try_get("address")?,
        scheduled_start: row.try_get("scheduled_start")?,
        scheduled_end: row.try_get("scheduled_end")?,
        price_cents: row.try_get("price_cents")?,
        assigned_to: optional_uuid(row, "assigned_to")?.map(UserId),
        created_by: UserId(parse_uuid(&row.try_get::<String, _>("created_by")?)?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<StatusTransitionRecord> {
    let context = row
        .try_get::<Option<String>, _>("context")?
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("invalid transition context json")?;
    Ok(StatusTransitionRecord {
        id: TransitionId(row.try_get("id")?),
        mission_id: MissionId(parse_uuid(&row.try_get::<String, _>("mission_id")?)?),
        from_status: label::<MissionStatus>(row, "from_status")?,
        to_status: label::<MissionStatus>(row, "to_status")?,
        channel: label::<TransitionChannel>(row, "channel")?,
        note: row.try_get("note")?,
        context,
        actor_id: UserId(parse_uuid(&row.try_get::<String, _>("actor_id")?)?),
        created_at: row.try_get("created_at")?,
    })
}

fn offer_from_row(row: &SqliteRow) -> Result<Offer> {
    Ok(Offer {
        id: OfferId(row.try_get("id")?),
        mission_id: MissionId(parse_uuid(&row.try_get::<String, _>("mission_id")?)?),
        recipient_id: UserId(parse_uuid(&row.try_get::<String, _>("recipient_id")?)?),
        status: label::<OfferStatus>(row, "status")?,
        sent_at: row.try_get("sent_at")?,
        expires_at: row.try_get("expires_at")?,
        responded_at: row.try_get("responded_at")?,
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    Ok(Notification {
        id: NotificationId(row.try_get("id")?),
        recipient_id: UserId(parse_uuid(&row.try_get::<String, _>("recipient_id")?)?),
        kind: label::<NotificationKind>(row, "kind")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        mission_id: optional_uuid(row, "mission_id")?.map(MissionId),
        read_at: row.try_get("read_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn chat_message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: ChatMessageId(row.try_get("id")?),
        mission_id: MissionId(parse_uuid(&row.try_get::<String, _>("mission_id")?)?),
        author_id: UserId(parse_uuid(&row.try_get::<String, _>("author_id")?)?),
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

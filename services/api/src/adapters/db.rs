//! services/api/src/adapters/db.rs
//!
//! This module contains the Postgres adapter, which implements both the
//! `SessionStore` and the `PersistenceService` ports from the `core` crate.
//! It handles all interactions with the database using `sqlx`.
//!
//! Every statement is bounded by the configured persistence timeout so a slow
//! database can never hold a webhook past the platform's own deadline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use waste_ivr_core::domain::{
    CallEvent, CallEventKind, CallSession, CallStatus, CallStep, Language, LookupState, Rating,
    RatingRecord, SubscriberRecord,
};
use waste_ivr_core::ports::{Lookup, PersistenceService, PortError, PortResult, SessionStore};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `SessionStore` and `PersistenceService` ports.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    /// Creates a new `PgStore`.
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Runs one statement under the persistence timeout.
    async fn bounded<T, F>(&self, operation: &'static str, query: F) -> PortResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(|e| map_sqlx_error(operation, e)),
            Err(_) => Err(PortError::Unavailable(format!(
                "{} timed out after {}ms",
                operation,
                self.timeout.as_millis()
            ))),
        }
    }

    /// Inserts a subscriber, or renames it if the identifier already exists.
    pub async fn upsert_subscriber(
        &self,
        identifier: &str,
        display_name: &str,
        user_id: Option<&str>,
    ) -> PortResult<SubscriberRecord> {
        let record = self
            .bounded(
                "upsert subscriber",
                sqlx::query_as::<_, SubscriberRow>(
                    "INSERT INTO subscribers (id, identifier, display_name, user_id) VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (identifier) DO UPDATE SET display_name = EXCLUDED.display_name, user_id = EXCLUDED.user_id \
                     RETURNING id, identifier, display_name, user_id",
                )
                .bind(Uuid::new_v4())
                .bind(identifier)
                .bind(display_name)
                .bind(user_id)
                .fetch_one(&self.pool),
            )
            .await?;
        Ok(record.to_domain())
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound(operation.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PortError::Unavailable(format!("{}: {}", operation, e))
        }
        _ => PortError::Unexpected(format!("{}: {}", operation, e)),
    }
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> PortError {
    PortError::Unexpected(format!("Corrupt value in column {}: {}", column, detail))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct CallRow {
    call_id: String,
    from_number: String,
    to_number: String,
    step: String,
    status: String,
    language: Option<String>,
    service_identifier: Option<String>,
    rating: Option<i16>,
    subscriber_lookup: String,
    subscriber_id: Option<String>,
    subscriber_name: Option<String>,
    subscriber_user_id: Option<String>,
    duration_secs: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl CallRow {
    fn to_domain(self) -> PortResult<CallSession> {
        let subscriber = match (self.subscriber_id, self.subscriber_name) {
            (Some(id), Some(display_name)) => Some(SubscriberRecord {
                id,
                identifier: self.service_identifier.clone().unwrap_or_default(),
                display_name,
                user_id: self.subscriber_user_id,
            }),
            _ => None,
        };
        Ok(CallSession {
            call_id: self.call_id,
            from_number: self.from_number,
            to_number: self.to_number,
            step: self.step.parse::<CallStep>().map_err(|e| corrupt("step", e))?,
            status: self.status.parse::<CallStatus>().map_err(|e| corrupt("status", e))?,
            language: self
                .language
                .map(|l| l.parse::<Language>())
                .transpose()
                .map_err(|e| corrupt("language", e))?,
            service_identifier: self.service_identifier,
            rating: self
                .rating
                .map(|r| Rating::try_from(i64::from(r)))
                .transpose()
                .map_err(|e| corrupt("rating", e))?,
            subscriber_lookup: self
                .subscriber_lookup
                .parse::<LookupState>()
                .map_err(|e| corrupt("subscriber_lookup", e))?,
            subscriber,
            duration_secs: self.duration_secs.and_then(|d| u32::try_from(d).ok()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SubscriberRow {
    id: Uuid,
    identifier: String,
    display_name: String,
    user_id: Option<String>,
}
impl SubscriberRow {
    fn to_domain(self) -> SubscriberRecord {
        SubscriberRecord {
            id: self.id.to_string(),
            identifier: self.identifier,
            display_name: self.display_name,
            user_id: self.user_id,
        }
    }
}

#[derive(FromRow)]
struct RatingRow {
    id: Uuid,
    subscriber_id: Uuid,
    display_name: String,
    identifier: String,
    user_id: Option<String>,
    call_id: Option<String>,
    rating: i16,
    recorded_at: DateTime<Utc>,
}
impl RatingRow {
    fn to_domain(self) -> PortResult<RatingRecord> {
        Ok(RatingRecord {
            id: self.id.to_string(),
            subscriber_id: self.subscriber_id.to_string(),
            subscriber_name: self.display_name,
            identifier: self.identifier,
            user_id: self.user_id,
            call_id: self.call_id,
            rating: Rating::try_from(i64::from(self.rating)).map_err(|e| corrupt("rating", e))?,
            recorded_at: self.recorded_at,
        })
    }
}

#[derive(FromRow)]
struct CallEventRow {
    id: Uuid,
    call_id: String,
    kind: String,
    payload: serde_json::Value,
    recorded_at: DateTime<Utc>,
}
impl CallEventRow {
    fn to_domain(self) -> PortResult<CallEvent> {
        let payload: BTreeMap<String, String> =
            serde_json::from_value(self.payload).map_err(|e| corrupt("payload", e))?;
        Ok(CallEvent {
            id: self.id,
            call_id: self.call_id,
            kind: self.kind.parse::<CallEventKind>().map_err(|e| corrupt("kind", e))?,
            payload,
            recorded_at: self.recorded_at,
        })
    }
}

const CALL_COLUMNS: &str = "call_id, from_number, to_number, step, status, language, service_identifier, \
     rating, subscriber_lookup, subscriber_id, subscriber_name, subscriber_user_id, duration_secs, \
     created_at, updated_at";

//=========================================================================================
// `SessionStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionStore for PgStore {
    async fn get(&self, call_id: &str) -> PortResult<Option<CallSession>> {
        let sql = format!("SELECT {} FROM calls WHERE call_id = $1", CALL_COLUMNS);
        let record = self
            .bounded(
                "get call",
                sqlx::query_as::<_, CallRow>(&sql)
                    .bind(call_id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        record.map(CallRow::to_domain).transpose()
    }

    async fn put(&self, session: CallSession) -> PortResult<()> {
        self.bounded(
            "save call",
            sqlx::query(
                "INSERT INTO calls (call_id, from_number, to_number, step, status, language, service_identifier, \
                 rating, subscriber_lookup, subscriber_id, subscriber_name, subscriber_user_id, duration_secs, \
                 created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 ON CONFLICT (call_id) DO UPDATE SET \
                 step = EXCLUDED.step, status = EXCLUDED.status, language = EXCLUDED.language, \
                 service_identifier = EXCLUDED.service_identifier, rating = EXCLUDED.rating, \
                 subscriber_lookup = EXCLUDED.subscriber_lookup, subscriber_id = EXCLUDED.subscriber_id, \
                 subscriber_name = EXCLUDED.subscriber_name, subscriber_user_id = EXCLUDED.subscriber_user_id, \
                 duration_secs = EXCLUDED.duration_secs, updated_at = EXCLUDED.updated_at",
            )
            .bind(&session.call_id)
            .bind(&session.from_number)
            .bind(&session.to_number)
            .bind(session.step.as_str())
            .bind(session.status.as_str())
            .bind(session.language.map(|l| l.key()))
            .bind(&session.service_identifier)
            .bind(session.rating.map(|r| i16::from(r.value())))
            .bind(session.subscriber_lookup.as_str())
            .bind(session.subscriber.as_ref().map(|s| s.id.as_str()))
            .bind(session.subscriber.as_ref().map(|s| s.display_name.as_str()))
            .bind(session.subscriber.as_ref().and_then(|s| s.user_id.as_deref()))
            .bind(session.duration_secs.and_then(|d| i32::try_from(d).ok()))
            .bind(session.created_at)
            .bind(session.updated_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_secs: Option<u32>,
        now: DateTime<Utc>,
    ) -> PortResult<Option<CallSession>> {
        // One statement, so a concurrent step write is never overwritten.
        let sql = format!(
            "UPDATE calls SET status = $2, duration_secs = COALESCE($3, duration_secs), \
             step = CASE WHEN step = 'rated' AND $2 = 'completed' THEN 'completed' ELSE step END, \
             updated_at = $4 WHERE call_id = $1 RETURNING {}",
            CALL_COLUMNS
        );
        let record = self
            .bounded(
                "update call status",
                sqlx::query_as::<_, CallRow>(&sql)
                    .bind(call_id)
                    .bind(status.as_str())
                    .bind(duration_secs.and_then(|d| i32::try_from(d).ok()))
                    .bind(now)
                    .fetch_optional(&self.pool),
            )
            .await?;
        record.map(CallRow::to_domain).transpose()
    }

    async fn delete(&self, call_id: &str) -> PortResult<bool> {
        let result = self
            .bounded(
                "delete call",
                sqlx::query("DELETE FROM calls WHERE call_id = $1")
                    .bind(call_id)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> PortResult<Vec<CallSession>> {
        let sql = format!("SELECT {} FROM calls ORDER BY created_at DESC", CALL_COLUMNS);
        let records = self
            .bounded(
                "list calls",
                sqlx::query_as::<_, CallRow>(&sql).fetch_all(&self.pool),
            )
            .await?;
        records.into_iter().map(CallRow::to_domain).collect()
    }

    async fn clear(&self) -> PortResult<usize> {
        let result = self
            .bounded("clear calls", sqlx::query("DELETE FROM calls").execute(&self.pool))
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> PortResult<usize> {
        let result = self
            .bounded(
                "purge calls",
                sqlx::query("DELETE FROM calls WHERE updated_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

//=========================================================================================
// `PersistenceService` Trait Implementation
//=========================================================================================

#[async_trait]
impl PersistenceService for PgStore {
    async fn find_subscriber_by_identifier(&self, identifier: &str) -> Lookup<SubscriberRecord> {
        let result = self
            .bounded(
                "find subscriber",
                sqlx::query_as::<_, SubscriberRow>(
                    "SELECT id, identifier, display_name, user_id FROM subscribers WHERE identifier = $1",
                )
                .bind(identifier)
                .fetch_optional(&self.pool),
            )
            .await;
        Lookup::from(result.map(|row| row.map(SubscriberRow::to_domain)))
    }

    async fn record_rating(
        &self,
        subscriber: &SubscriberRecord,
        rating: Rating,
        call_id: Option<&str>,
    ) -> PortResult<RatingRecord> {
        let subscriber_id = Uuid::parse_str(&subscriber.id)
            .map_err(|e| PortError::Unexpected(format!("Invalid subscriber id {}: {}", subscriber.id, e)))?;
        let id = Uuid::new_v4();
        let recorded_at: DateTime<Utc> = self
            .bounded(
                "save rating",
                sqlx::query_scalar::<_, DateTime<Utc>>(
                    "INSERT INTO ratings (id, subscriber_id, call_id, rating) VALUES ($1, $2, $3, $4) RETURNING recorded_at",
                )
                .bind(id)
                .bind(subscriber_id)
                .bind(call_id)
                .bind(i16::from(rating.value()))
                .fetch_one(&self.pool),
            )
            .await?;
        debug!(rating_id = %id, identifier = %subscriber.identifier, "Rating row inserted");

        Ok(RatingRecord {
            id: id.to_string(),
            subscriber_id: subscriber.id.clone(),
            subscriber_name: subscriber.display_name.clone(),
            identifier: subscriber.identifier.clone(),
            user_id: subscriber.user_id.clone(),
            call_id: call_id.map(str::to_string),
            rating,
            recorded_at,
        })
    }

    async fn append_call_event(&self, event: CallEvent) -> PortResult<()> {
        let payload = serde_json::to_value(&event.payload)
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        self.bounded(
            "append call event",
            sqlx::query(
                "INSERT INTO call_events (id, call_id, kind, payload, recorded_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.id)
            .bind(&event.call_id)
            .bind(event.kind.as_str())
            .bind(payload)
            .bind(event.recorded_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn list_ratings(&self) -> PortResult<Vec<RatingRecord>> {
        let records = self
            .bounded(
                "list ratings",
                sqlx::query_as::<_, RatingRow>(
                    "SELECT r.id, r.subscriber_id, s.display_name, s.identifier, s.user_id, r.call_id, r.rating, r.recorded_at \
                     FROM ratings r JOIN subscribers s ON s.id = r.subscriber_id \
                     ORDER BY r.recorded_at DESC",
                )
                .fetch_all(&self.pool),
            )
            .await?;
        records.into_iter().map(RatingRow::to_domain).collect()
    }

    async fn list_subscribers(&self) -> PortResult<Vec<SubscriberRecord>> {
        let records = self
            .bounded(
                "list subscribers",
                sqlx::query_as::<_, SubscriberRow>(
                    "SELECT id, identifier, display_name, user_id FROM subscribers ORDER BY identifier ASC",
                )
                .fetch_all(&self.pool),
            )
            .await?;
        Ok(records.into_iter().map(SubscriberRow::to_domain).collect())
    }

    async fn list_call_events(&self, call_id: &str) -> PortResult<Vec<CallEvent>> {
        let records = self
            .bounded(
                "list call events",
                sqlx::query_as::<_, CallEventRow>(
                    "SELECT id, call_id, kind, payload, recorded_at FROM call_events \
                     WHERE call_id = $1 ORDER BY recorded_at ASC",
                )
                .bind(call_id)
                .fetch_all(&self.pool),
            )
            .await?;
        records.into_iter().map(CallEventRow::to_domain).collect()
    }

    async fn check_health(&self) -> PortResult<()> {
        self.bounded(
            "health check",
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

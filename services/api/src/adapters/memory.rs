//! services/api/src/adapters/memory.rs
//!
//! In-process implementations of the `SessionStore` and `PersistenceService`
//! ports. Sessions are always kept here unless Postgres is configured; the
//! persistence side backs the `memory` storage backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;
use waste_ivr_core::domain::{
    CallEvent, CallSession, CallStatus, Rating, RatingRecord, SubscriberRecord,
};
use waste_ivr_core::ports::{Lookup, PersistenceService, PortResult, SessionStore};

use crate::error::ApiError;

//=========================================================================================
// Session Store
//=========================================================================================

/// Sessions keyed by call id. Writes for different calls never contend on a global lock.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, CallSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, call_id: &str) -> PortResult<Option<CallSession>> {
        Ok(self.sessions.get(call_id).map(|s| s.clone()))
    }

    async fn put(&self, session: CallSession) -> PortResult<()> {
        self.sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_secs: Option<u32>,
        now: DateTime<Utc>,
    ) -> PortResult<Option<CallSession>> {
        // The entry guard holds the shard lock, so no step callback can interleave.
        Ok(self.sessions.get_mut(call_id).map(|mut session| {
            session.apply_status(status, duration_secs, now);
            session.clone()
        }))
    }

    async fn delete(&self, call_id: &str) -> PortResult<bool> {
        Ok(self.sessions.remove(call_id).is_some())
    }

    async fn list(&self) -> PortResult<Vec<CallSession>> {
        let mut sessions: Vec<CallSession> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn clear(&self) -> PortResult<usize> {
        let removed = self.sessions.len();
        self.sessions.clear();
        Ok(removed)
    }

    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> PortResult<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.updated_at >= cutoff);
        Ok(before.saturating_sub(self.sessions.len()))
    }
}

//=========================================================================================
// Persistence
//=========================================================================================

/// One entry of the subscriber seed file. Field names follow the `user-house` collection.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberSeed {
    #[serde(rename = "houseNo")]
    pub identifier: String,
    #[serde(rename = "username")]
    pub display_name: String,
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
}

/// Parses a JSON array of `{ "houseNo", "username", "userId" }` objects.
pub fn parse_seed(raw: &str) -> Result<Vec<SubscriberSeed>, ApiError> {
    serde_json::from_str(raw)
        .map_err(|e| ApiError::Internal(format!("Invalid subscriber seed: {}", e)))
}

pub async fn read_seed_file(path: &Path) -> Result<Vec<SubscriberSeed>, ApiError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let seed = parse_seed(&raw)?;
    info!("Read {} subscribers from {}", seed.len(), path.display());
    Ok(seed)
}

/// Subscribers, ratings and call events held in memory.
#[derive(Default)]
pub struct InMemoryPersistence {
    /// Keyed by service identifier.
    subscribers: DashMap<String, SubscriberRecord>,
    ratings: RwLock<Vec<RatingRecord>>,
    events: DashMap<String, Vec<CallEvent>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscribers(subscribers: impl IntoIterator<Item = SubscriberRecord>) -> Self {
        let store = Self::new();
        for subscriber in subscribers {
            store
                .subscribers
                .insert(subscriber.identifier.clone(), subscriber);
        }
        store
    }

    pub fn from_seed(seed: Vec<SubscriberSeed>) -> Self {
        Self::with_subscribers(seed.into_iter().map(|s| SubscriberRecord {
            id: Uuid::new_v4().to_string(),
            identifier: s.identifier,
            display_name: s.display_name,
            user_id: s.user_id,
        }))
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn find_subscriber_by_identifier(&self, identifier: &str) -> Lookup<SubscriberRecord> {
        match self.subscribers.get(identifier) {
            Some(subscriber) => Lookup::Found(subscriber.clone()),
            None => Lookup::NotFound,
        }
    }

    async fn record_rating(
        &self,
        subscriber: &SubscriberRecord,
        rating: Rating,
        call_id: Option<&str>,
    ) -> PortResult<RatingRecord> {
        let record = RatingRecord {
            id: Uuid::new_v4().to_string(),
            subscriber_id: subscriber.id.clone(),
            subscriber_name: subscriber.display_name.clone(),
            identifier: subscriber.identifier.clone(),
            user_id: subscriber.user_id.clone(),
            call_id: call_id.map(str::to_string),
            rating,
            recorded_at: Utc::now(),
        };
        self.ratings.write().await.push(record.clone());
        Ok(record)
    }

    async fn append_call_event(&self, event: CallEvent) -> PortResult<()> {
        self.events
            .entry(event.call_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_ratings(&self) -> PortResult<Vec<RatingRecord>> {
        let mut ratings = self.ratings.read().await.clone();
        ratings.reverse();
        Ok(ratings)
    }

    async fn list_subscribers(&self) -> PortResult<Vec<SubscriberRecord>> {
        let mut subscribers: Vec<SubscriberRecord> = self
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        subscribers.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(subscribers)
    }

    async fn list_call_events(&self, call_id: &str) -> PortResult<Vec<CallEvent>> {
        Ok(self
            .events
            .get(call_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }

    async fn check_health(&self) -> PortResult<()> {
        Ok(())
    }
}

//! crates/waste_ivr_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the call flow.
//! These traits form the boundary of the hexagonal architecture, so the flow
//! never depends on a particular datastore or telephony vendor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{CallEvent, CallSession, CallStatus, Rating, RatingRecord, SubscriberRecord};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// The result of a best-effort lookup against an external datastore.
///
/// Keeps "nothing matched" apart from "the datastore could not be asked".
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Unavailable(String),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<PortResult<Option<T>>> for Lookup<T> {
    fn from(result: PortResult<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Lookup::Found(value),
            Ok(None) | Err(PortError::NotFound(_)) => Lookup::NotFound,
            Err(PortError::Unavailable(reason)) | Err(PortError::Unexpected(reason)) => {
                Lookup::Unavailable(reason)
            }
        }
    }
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Per-call transient state, keyed by the platform's call id.
///
/// Callbacks for one call arrive strictly in sequence, so implementations only
/// need to be safe across different call ids.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, call_id: &str) -> PortResult<Option<CallSession>>;

    /// Inserts or replaces the session stored under `session.call_id`.
    async fn put(&self, session: CallSession) -> PortResult<()>;

    /// Applies a status callback in place, as `CallSession::apply_status` does, without
    /// rewriting collected fields. Status callbacks race with step callbacks, so
    /// this must not be a read followed by a whole-session `put`.
    ///
    /// Returns the updated session, or `None` if the call is unknown.
    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_secs: Option<u32>,
        now: DateTime<Utc>,
    ) -> PortResult<Option<CallSession>>;

    /// Returns `true` if a session was removed.
    async fn delete(&self, call_id: &str) -> PortResult<bool>;

    /// All sessions, newest first.
    async fn list(&self) -> PortResult<Vec<CallSession>>;

    /// Removes every session. Administrative use only.
    async fn clear(&self) -> PortResult<usize>;

    /// Removes sessions not updated since `cutoff`, returning how many were dropped.
    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> PortResult<usize>;
}

/// The external datastore holding subscribers, ratings and the call audit trail.
///
/// Every method may fail; the call flow never lets a failure here change what
/// the caller hears.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn find_subscriber_by_identifier(&self, identifier: &str) -> Lookup<SubscriberRecord>;

    async fn record_rating(
        &self,
        subscriber: &SubscriberRecord,
        rating: Rating,
        call_id: Option<&str>,
    ) -> PortResult<RatingRecord>;

    async fn append_call_event(&self, event: CallEvent) -> PortResult<()>;

    /// All ratings, newest first.
    async fn list_ratings(&self) -> PortResult<Vec<RatingRecord>>;

    async fn list_subscribers(&self) -> PortResult<Vec<SubscriberRecord>>;

    /// Events for one call, oldest first.
    async fn list_call_events(&self, call_id: &str) -> PortResult<Vec<CallEvent>>;

    /// Verifies the datastore is reachable and provisioned.
    async fn check_health(&self) -> PortResult<()>;
}

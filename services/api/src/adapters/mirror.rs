//! services/api/src/adapters/mirror.rs
//!
//! A `SessionStore` that keeps every session in memory and copies it to a
//! durable store on a best-effort basis. A call in progress never depends on
//! the database being reachable; the durable copy feeds the admin API and
//! survives restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use waste_ivr_core::domain::{CallSession, CallStatus};
use waste_ivr_core::ports::{PortResult, SessionStore};

use super::memory::InMemorySessionStore;

pub struct MirroredSessionStore {
    primary: InMemorySessionStore,
    durable: Arc<dyn SessionStore>,
}

impl MirroredSessionStore {
    pub fn new(durable: Arc<dyn SessionStore>) -> Self {
        Self {
            primary: InMemorySessionStore::new(),
            durable,
        }
    }
}

#[async_trait]
impl SessionStore for MirroredSessionStore {
    async fn get(&self, call_id: &str) -> PortResult<Option<CallSession>> {
        if let Some(session) = self.primary.get(call_id).await? {
            return Ok(Some(session));
        }
        // Calls that began before a restart are only in the durable copy.
        match self.durable.get(call_id).await {
            Ok(Some(session)) => {
                self.primary.put(session.clone()).await?;
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(call_sid = %call_id, error = %e, "Durable session read failed; using memory only");
                Ok(None)
            }
        }
    }

    async fn put(&self, session: CallSession) -> PortResult<()> {
        self.primary.put(session.clone()).await?;
        if let Err(e) = self.durable.put(session).await {
            warn!(error = %e, "Failed to mirror call session");
        }
        Ok(())
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_secs: Option<u32>,
        now: DateTime<Utc>,
    ) -> PortResult<Option<CallSession>> {
        let in_memory = self
            .primary
            .update_status(call_id, status, duration_secs, now)
            .await?;
        match self
            .durable
            .update_status(call_id, status, duration_secs, now)
            .await
        {
            Ok(durable) => Ok(in_memory.or(durable)),
            Err(e) => {
                warn!(call_sid = %call_id, error = %e, "Failed to mirror call status");
                Ok(in_memory)
            }
        }
    }

    async fn delete(&self, call_id: &str) -> PortResult<bool> {
        let removed = self.primary.delete(call_id).await?;
        match self.durable.delete(call_id).await {
            Ok(durable_removed) => Ok(removed || durable_removed),
            Err(e) => {
                warn!(call_sid = %call_id, error = %e, "Failed to delete mirrored call session");
                Ok(removed)
            }
        }
    }

    /// The durable list overlaid with the in-memory sessions, newest first.
    async fn list(&self) -> PortResult<Vec<CallSession>> {
        let in_memory = self.primary.list().await?;
        let durable = match self.durable.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Durable session list failed; listing memory only");
                return Ok(in_memory);
            }
        };
        let mut merged: HashMap<String, CallSession> = durable
            .into_iter()
            .map(|s| (s.call_id.clone(), s))
            .collect();
        for session in in_memory {
            merged.insert(session.call_id.clone(), session);
        }
        let mut sessions: Vec<CallSession> = merged.into_values().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn clear(&self) -> PortResult<usize> {
        let cleared = self.primary.clear().await?;
        match self.durable.clear().await {
            Ok(durable_cleared) => Ok(cleared.max(durable_cleared)),
            Err(e) => {
                warn!(error = %e, "Failed to clear mirrored call sessions");
                Ok(cleared)
            }
        }
    }

    async fn purge_idle(&self, cutoff: DateTime<Utc>) -> PortResult<usize> {
        let purged = self.primary.purge_idle(cutoff).await?;
        match self.durable.purge_idle(cutoff).await {
            Ok(durable_purged) => Ok(purged.max(durable_purged)),
            Err(e) => {
                warn!(error = %e, "Failed to purge mirrored call sessions");
                Ok(purged)
            }
        }
    }
}

//! services/api/src/adapters/disabled.rs
//!
//! Stands in for the external datastore when it cannot be used, e.g. the hosted
//! database has no credentials. The call flow keeps working; nothing is saved.

use async_trait::async_trait;
use waste_ivr_core::domain::{CallEvent, Rating, RatingRecord, SubscriberRecord};
use waste_ivr_core::ports::{Lookup, PersistenceService, PortError, PortResult};

pub struct DisabledPersistence {
    reason: String,
}

impl DisabledPersistence {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable(&self) -> PortError {
        PortError::Unavailable(self.reason.clone())
    }
}

#[async_trait]
impl PersistenceService for DisabledPersistence {
    async fn find_subscriber_by_identifier(&self, _identifier: &str) -> Lookup<SubscriberRecord> {
        Lookup::Unavailable(self.reason.clone())
    }

    async fn record_rating(
        &self,
        _subscriber: &SubscriberRecord,
        _rating: Rating,
        _call_id: Option<&str>,
    ) -> PortResult<RatingRecord> {
        Err(self.unavailable())
    }

    async fn append_call_event(&self, _event: CallEvent) -> PortResult<()> {
        Err(self.unavailable())
    }

    async fn list_ratings(&self) -> PortResult<Vec<RatingRecord>> {
        Ok(Vec::new())
    }

    async fn list_subscribers(&self) -> PortResult<Vec<SubscriberRecord>> {
        Ok(Vec::new())
    }

    async fn list_call_events(&self, _call_id: &str) -> PortResult<Vec<CallEvent>> {
        Ok(Vec::new())
    }

    async fn check_health(&self) -> PortResult<()> {
        Err(self.unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookups_are_unavailable_and_lists_empty() {
        let store = DisabledPersistence::new("no credentials");
        assert_eq!(
            store.find_subscriber_by_identifier("1002").await,
            Lookup::Unavailable("no credentials".to_string())
        );
        assert!(store.list_ratings().await.unwrap().is_empty());
        assert!(matches!(
            store.check_health().await,
            Err(PortError::Unavailable(_))
        ));
    }
}

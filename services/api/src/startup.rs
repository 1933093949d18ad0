//! services/api/src/startup.rs
//!
//! Builds the session store and persistence adapters for the configured
//! storage backend and wires them into the shared `AppState`.

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use waste_ivr_core::ports::{PersistenceService, SessionStore};

use crate::adapters::{
    memory::read_seed_file, AppwriteAdapter, DisabledPersistence, InMemoryPersistence,
    InMemorySessionStore, MirroredSessionStore, PgStore,
};
use crate::config::{Config, StorageBackend};
use crate::error::ApiError;
use crate::web::state::AppState;

pub async fn build_state(config: Arc<Config>) -> Result<Arc<AppState>, ApiError> {
    let (sessions, persistence): (Arc<dyn SessionStore>, Arc<dyn PersistenceService>) =
        match &config.storage {
            StorageBackend::Memory => {
                let persistence = match &config.subscriber_seed_path {
                    Some(path) => InMemoryPersistence::from_seed(read_seed_file(path).await?),
                    None => {
                        warn!("No SUBSCRIBER_SEED_PATH set; every caller will be treated as unregistered.");
                        InMemoryPersistence::new()
                    }
                };
                let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
                let persistence: Arc<dyn PersistenceService> = Arc::new(persistence);
                (sessions, persistence)
            }
            StorageBackend::Postgres {
                database_url,
                max_connections,
            } => {
                // --- Connect to Database & Run Migrations ---
                info!("Connecting to database...");
                let db_pool = PgPoolOptions::new()
                    .max_connections(*max_connections)
                    .acquire_timeout(config.persistence_timeout)
                    .connect(database_url)
                    .await?;
                let store = Arc::new(PgStore::new(db_pool, config.persistence_timeout));
                info!("Running database migrations...");
                store.run_migrations().await?;
                info!("Database migrations complete.");

                if let Some(path) = &config.subscriber_seed_path {
                    let seed = read_seed_file(path).await?;
                    for subscriber in &seed {
                        store
                            .upsert_subscriber(
                                &subscriber.identifier,
                                &subscriber.display_name,
                                subscriber.user_id.as_deref(),
                            )
                            .await?;
                    }
                    info!("Seeded {} subscribers", seed.len());
                }
                // Calls run from memory; the calls table is a best-effort mirror.
                let sessions: Arc<dyn SessionStore> =
                    Arc::new(MirroredSessionStore::new(store.clone()));
                let persistence: Arc<dyn PersistenceService> = store;
                (sessions, persistence)
            }
            StorageBackend::Appwrite(appwrite) => {
                let adapter = AppwriteAdapter::new(appwrite.clone(), config.persistence_timeout)?;
                info!(
                    endpoint = %appwrite.endpoint,
                    database = %appwrite.database_id,
                    "Checking Appwrite database and collections..."
                );
                // The line keeps answering calls even if the datastore is down at boot.
                match adapter.check_health().await {
                    Ok(()) => info!("Appwrite collections verified."),
                    Err(e) => warn!("Appwrite is not reachable yet: {}", e),
                }
                let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
                let persistence: Arc<dyn PersistenceService> = Arc::new(adapter);
                (sessions, persistence)
            }
            StorageBackend::Disabled { reason } => {
                warn!("Persistence disabled: {}. Using in-memory sessions only.", reason);
                let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
                let persistence: Arc<dyn PersistenceService> =
                    Arc::new(DisabledPersistence::new(reason.clone()));
                (sessions, persistence)
            }
        };

    info!("Storage backend: {}", config.storage.name());
    Ok(Arc::new(AppState::new(config, sessions, persistence)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_builds_without_seed() {
        let config = Config::from_lookup(|_| None).unwrap();
        let state = build_state(Arc::new(config)).await.unwrap();
        assert!(state.sessions.list().await.unwrap().is_empty());
        assert!(state.persistence.check_health().await.is_ok());
    }

    #[tokio::test]
    async fn appwrite_without_credentials_still_answers_calls() {
        let config = Config::from_lookup(|key| match key {
            "STORAGE_BACKEND" => Some("appwrite".to_string()),
            "APPWRITE_API_KEY" => Some("your_appwrite_api_key".to_string()),
            _ => None,
        })
        .unwrap();
        let state = build_state(Arc::new(config)).await.unwrap();
        assert!(state.persistence.check_health().await.is_err());
        assert!(state.persistence.list_subscribers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_seed_file_is_an_error() {
        let config = Config::from_lookup(|key| match key {
            "SUBSCRIBER_SEED_PATH" => Some("/nonexistent/subscribers.json".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(matches!(
            build_state(Arc::new(config)).await,
            Err(ApiError::Io(_))
        ));
    }
}

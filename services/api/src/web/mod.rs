pub mod middleware;
pub mod rest;
pub mod state;
pub mod twiml;
pub mod webhooks;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::web::state::AppState;

pub use middleware::require_admin_token;
pub use rest::ApiDoc;
pub use webhooks::{
    call_status_webhook, house_number_webhook, language_selection_webhook, rating_webhook,
    voice_webhook,
};

/// Builds the webhook, admin and health routes. Middleware layers are added by the binary.
pub fn router(app_state: Arc<AppState>) -> Router {
    let routes = &app_state.flow.settings().routes;
    let status_route = format!("{}/call-status", app_state.config.webhook_base_path);

    // Platform callbacks (no auth; the platform cannot send a bearer token)
    let webhook_routes = Router::new()
        .route(&routes.voice, post(voice_webhook))
        .route(&routes.language, post(language_selection_webhook))
        .route(&routes.identifier, post(house_number_webhook))
        .route(&routes.rating, post(rating_webhook))
        .route(&status_route, post(call_status_webhook));

    // Admin routes (bearer token required when configured)
    let admin_routes = Router::new()
        .route(
            "/api/calls",
            get(rest::list_calls_handler).delete(rest::clear_calls_handler),
        )
        .route("/api/calls/stats", get(rest::call_stats_handler))
        .route("/api/calls/date-range", get(rest::calls_by_date_range_handler))
        .route(
            "/api/calls/number/{phone_number}",
            get(rest::calls_by_number_handler),
        )
        .route("/api/calls/status/{status}", get(rest::calls_by_status_handler))
        .route(
            "/api/calls/{call_sid}",
            get(rest::get_call_handler).delete(rest::delete_call_handler),
        )
        .route("/api/calls/{call_sid}/logs", get(rest::call_logs_handler))
        .route("/api/ratings", get(rest::list_ratings_handler))
        .route("/api/users", get(rest::list_users_handler))
        .route("/api/users/{id}/ratings", get(rest::user_ratings_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_admin_token,
        ));

    Router::new()
        .route("/health", get(rest::health_handler))
        .merge(webhook_routes)
        .merge(admin_routes)
        .with_state(app_state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::state::AppState;
    use crate::adapters::memory::{InMemoryPersistence, InMemorySessionStore};
    use crate::config::Config;
    use axum::response::Response;
    use std::sync::Arc;
    use waste_ivr_core::domain::SubscriberRecord;

    /// In-memory state with 4-digit identifiers and one subscriber, "1002" (Asha).
    pub fn test_state() -> Arc<AppState> {
        test_state_with(&[])
    }

    /// Like `test_state`, with extra environment overrides.
    pub fn test_state_with(overrides: &[(&str, &str)]) -> Arc<AppState> {
        let config = Config::from_lookup(|key| {
            if key == "IDENTIFIER_LENGTH" {
                return Some("4".to_string());
            }
            overrides
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        })
        .expect("test config");
        let persistence = InMemoryPersistence::with_subscribers([SubscriberRecord {
            id: "sub-1".to_string(),
            identifier: "1002".to_string(),
            display_name: "Asha".to_string(),
            user_id: Some("user-1".to_string()),
        }]);
        Arc::new(AppState::new(
            Arc::new(config),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(persistence),
        ))
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).expect("json body")
    }
}

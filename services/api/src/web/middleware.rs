//! services/api/src/web/middleware.rs
//!
//! Bearer-token guard for the admin API.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::AppState;

/// Middleware that checks `Authorization: Bearer <ADMIN_TOKEN>`.
///
/// When no admin token is configured the admin routes are open.
/// A missing or wrong token returns 401 Unauthorized.
pub async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !is_authorized(req.headers(), state.config.admin_token.as_deref()) {
        warn!("Rejected admin request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn is_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token.trim() == expected)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn open_when_no_token_is_configured() {
        assert!(is_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn bearer_token_must_match() {
        assert!(is_authorized(&headers("Bearer s3cret"), Some("s3cret")));
        assert!(!is_authorized(&headers("Bearer wrong"), Some("s3cret")));
        assert!(!is_authorized(&headers("s3cret"), Some("s3cret")));
        assert!(!is_authorized(&HeaderMap::new(), Some("s3cret")));
    }
}

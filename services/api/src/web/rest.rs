//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the admin REST API and the health check,
//! and the master definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;
use waste_ivr_core::domain::{CallEvent, CallSession, CallStatus, RatingRecord, SubscriberRecord};
use waste_ivr_core::ports::PortError;
use waste_ivr_core::stats::CallStats;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        list_calls_handler,
        call_stats_handler,
        calls_by_number_handler,
        calls_by_status_handler,
        calls_by_date_range_handler,
        get_call_handler,
        delete_call_handler,
        call_logs_handler,
        clear_calls_handler,
        list_ratings_handler,
        list_users_handler,
        user_ratings_handler,
    ),
    components(
        schemas(
            HealthResponse, ErrorResponse, CallDto, CallListResponse, CallResponse, DeleteResponse,
            StatsDto, RatingBucketDto, IdentifierCountDto, StatsResponse,
            CallEventDto, CallLogsResponse, ClearResponse, RatingDto, RatingListResponse,
            UserDto, UserListResponse
        )
    ),
    tags(
        (name = "Waste IVR Admin API", description = "Inspection endpoints for the waste management feedback line.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    message: String,
    timestamp: DateTime<Utc>,
}

/// The body of every failed admin request.
#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    success: bool,
    error: String,
}

/// One call session as shown to operators.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallDto {
    call_sid: String,
    from_number: String,
    to_number: String,
    step: String,
    call_status: String,
    language: Option<String>,
    house_number: Option<String>,
    rating: Option<u8>,
    rating_text: Option<String>,
    subscriber_lookup: String,
    subscriber_id: Option<String>,
    subscriber_name: Option<String>,
    call_duration: Option<u32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CallSession> for CallDto {
    fn from(session: CallSession) -> Self {
        let rating_text = session.rating_label().map(str::to_string);
        let (subscriber_id, subscriber_name) = match session.subscriber {
            Some(subscriber) => (Some(subscriber.id), Some(subscriber.display_name)),
            None => (None, None),
        };
        Self {
            rating_text,
            call_sid: session.call_id,
            from_number: session.from_number,
            to_number: session.to_number,
            step: session.step.as_str().to_string(),
            call_status: session.status.as_str().to_string(),
            language: session.language.map(|l| l.name().to_string()),
            house_number: session.service_identifier,
            rating: session.rating.map(|r| r.value()),
            subscriber_lookup: session.subscriber_lookup.as_str().to_string(),
            subscriber_id,
            subscriber_name,
            call_duration: session.duration_secs,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct CallListResponse {
    success: bool,
    data: Vec<CallDto>,
    total: usize,
}

#[derive(Serialize, ToSchema)]
pub struct CallResponse {
    success: bool,
    data: CallDto,
}

#[derive(Serialize, ToSchema)]
pub struct DeleteResponse {
    success: bool,
    message: String,
}

#[derive(Serialize, ToSchema)]
pub struct RatingBucketDto {
    rating: u8,
    label: String,
    count: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierCountDto {
    house_number: String,
    count: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsDto {
    total_calls: usize,
    finished_calls: usize,
    in_flight_calls: usize,
    status_totals: BTreeMap<String, usize>,
    average_duration_secs: Option<f64>,
    average_rating: Option<f64>,
    rating_distribution: Vec<RatingBucketDto>,
    language_distribution: BTreeMap<String, usize>,
    top_house_numbers: Vec<IdentifierCountDto>,
}

impl From<CallStats> for StatsDto {
    fn from(stats: CallStats) -> Self {
        Self {
            in_flight_calls: stats.in_flight(),
            total_calls: stats.total_calls,
            finished_calls: stats.finished_calls,
            status_totals: stats.status_totals,
            average_duration_secs: stats.average_duration_secs,
            average_rating: stats.average_rating,
            rating_distribution: stats
                .rating_distribution
                .into_iter()
                .map(|b| RatingBucketDto {
                    rating: b.rating,
                    label: b.label.to_string(),
                    count: b.count,
                })
                .collect(),
            language_distribution: stats.language_distribution,
            top_house_numbers: stats
                .top_identifiers
                .into_iter()
                .map(|(house_number, count)| IdentifierCountDto {
                    house_number,
                    count,
                })
                .collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct StatsResponse {
    success: bool,
    data: StatsDto,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallEventDto {
    id: Uuid,
    call_sid: String,
    #[serde(rename = "type")]
    kind: String,
    payload: BTreeMap<String, String>,
    recorded_at: DateTime<Utc>,
}

impl From<CallEvent> for CallEventDto {
    fn from(event: CallEvent) -> Self {
        Self {
            id: event.id,
            call_sid: event.call_id,
            kind: event.kind.as_str().to_string(),
            payload: event.payload,
            recorded_at: event.recorded_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct CallLogsResponse {
    success: bool,
    data: Vec<CallEventDto>,
    total: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ClearResponse {
    success: bool,
    message: String,
    cleared: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RatingDto {
    id: String,
    subscriber_id: String,
    user_id: Option<String>,
    username: String,
    house_number: String,
    call_sid: Option<String>,
    rating: u8,
    rating_text: String,
    recorded_at: DateTime<Utc>,
}

impl From<RatingRecord> for RatingDto {
    fn from(record: RatingRecord) -> Self {
        Self {
            id: record.id,
            subscriber_id: record.subscriber_id,
            user_id: record.user_id,
            username: record.subscriber_name,
            house_number: record.identifier,
            call_sid: record.call_id,
            rating: record.rating.value(),
            rating_text: record.rating.label().to_string(),
            recorded_at: record.recorded_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct RatingListResponse {
    success: bool,
    data: Vec<RatingDto>,
    total: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    id: String,
    house_number: String,
    username: String,
    user_id: Option<String>,
}

impl From<SubscriberRecord> for UserDto {
    fn from(record: SubscriberRecord) -> Self {
        Self {
            id: record.id,
            house_number: record.identifier,
            username: record.display_name,
            user_id: record.user_id,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct UserListResponse {
    success: bool,
    data: Vec<UserDto>,
    total: usize,
}

/// Bounds for `/api/calls/date-range`. Either RFC 3339 timestamps or plain
/// `YYYY-MM-DD` dates; a plain end date covers that whole day.
#[derive(Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct DateRangeQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

type AdminError = (StatusCode, Json<ErrorResponse>);

fn failure(status: StatusCode, message: &str) -> AdminError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message.to_string(),
        }),
    )
}

fn call_list(sessions: Vec<CallSession>) -> Json<CallListResponse> {
    let data: Vec<CallDto> = sessions.into_iter().map(CallDto::from).collect();
    Json(CallListResponse {
        success: true,
        total: data.len(),
        data,
    })
}

fn parse_bound(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let naive = if end_of_day {
        date.and_hms_nano_opt(23, 59, 59, 999_999_999)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(Utc.from_utc_datetime(&naive))
}

/// Logs a port failure and hides its details from the client.
fn internal(context: &'static str) -> impl FnOnce(PortError) -> AdminError {
    move |e| {
        error!("{}: {:?}", context, e);
        failure(StatusCode::INTERNAL_SERVER_ERROR, context)
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is running", body = HealthResponse))
)]
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "OK".to_string(),
        message: "Waste Management IVR System is running".to_string(),
        timestamp: Utc::now(),
    })
}

/// List every live call session, newest first.
#[utoipa::path(
    get,
    path = "/api/calls",
    responses(
        (status = 200, description = "All call sessions", body = CallListResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_calls_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AdminError> {
    let sessions = app_state
        .sessions
        .list()
        .await
        .map_err(internal("Failed to fetch calls"))?;
    Ok(call_list(sessions))
}

/// Aggregate figures over the live call sessions.
#[utoipa::path(
    get,
    path = "/api/calls/stats",
    responses(
        (status = 200, description = "Call statistics", body = StatsResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn call_stats_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AdminError> {
    let sessions = app_state
        .sessions
        .list()
        .await
        .map_err(internal("Failed to compute call statistics"))?;
    Ok(Json(StatsResponse {
        success: true,
        data: CallStats::from_sessions(&sessions).into(),
    }))
}

/// Calls placed from or to a phone number.
#[utoipa::path(
    get,
    path = "/api/calls/number/{phone_number}",
    params(("phone_number" = String, Path, description = "Caller or called number, as the platform sends it.")),
    responses(
        (status = 200, description = "Matching call sessions", body = CallListResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn calls_by_number_handler(
    State(app_state): State<Arc<AppState>>,
    Path(phone_number): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let sessions = app_state
        .sessions
        .list()
        .await
        .map_err(internal("Failed to fetch calls by phone number"))?;
    Ok(call_list(
        sessions
            .into_iter()
            .filter(|s| s.from_number == phone_number || s.to_number == phone_number)
            .collect(),
    ))
}

/// Calls currently in one platform status.
#[utoipa::path(
    get,
    path = "/api/calls/status/{status}",
    params(("status" = String, Path, description = "A platform call status such as `in-progress` or `completed`.")),
    responses(
        (status = 200, description = "Matching call sessions", body = CallListResponse),
        (status = 400, description = "Unknown call status", body = ErrorResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn calls_by_status_handler(
    State(app_state): State<Arc<AppState>>,
    Path(status): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let status = status
        .parse::<CallStatus>()
        .map_err(|e| failure(StatusCode::BAD_REQUEST, &e.to_string()))?;
    let sessions = app_state
        .sessions
        .list()
        .await
        .map_err(internal("Failed to fetch calls by status"))?;
    Ok(call_list(
        sessions.into_iter().filter(|s| s.status == status).collect(),
    ))
}

/// Calls created within a date range, both ends inclusive.
#[utoipa::path(
    get,
    path = "/api/calls/date-range",
    params(DateRangeQuery),
    responses(
        (status = 200, description = "Matching call sessions", body = CallListResponse),
        (status = 400, description = "Missing or unparseable dates", body = ErrorResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn calls_by_date_range_handler(
    State(app_state): State<Arc<AppState>>,
    Query(range): Query<DateRangeQuery>,
) -> Result<impl IntoResponse, AdminError> {
    let (Some(start), Some(end)) = (range.start_date.as_deref(), range.end_date.as_deref()) else {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "Start date and end date are required",
        ));
    };
    let (Some(start), Some(end)) = (parse_bound(start, false), parse_bound(end, true)) else {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "Dates must be YYYY-MM-DD or RFC 3339 timestamps",
        ));
    };
    let sessions = app_state
        .sessions
        .list()
        .await
        .map_err(internal("Failed to fetch calls by date range"))?;
    Ok(call_list(
        sessions
            .into_iter()
            .filter(|s| s.created_at >= start && s.created_at <= end)
            .collect(),
    ))
}

/// Fetch one call session.
#[utoipa::path(
    get,
    path = "/api/calls/{call_sid}",
    params(("call_sid" = String, Path, description = "The platform's call id.")),
    responses(
        (status = 200, description = "The call session", body = CallResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "Call not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_call_handler(
    State(app_state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let session = app_state
        .sessions
        .get(&call_sid)
        .await
        .map_err(internal("Failed to fetch call"))?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, "Call not found"))?;
    Ok(Json(CallResponse {
        success: true,
        data: session.into(),
    }))
}

/// Drop one call session. Its rating and events are kept.
#[utoipa::path(
    delete,
    path = "/api/calls/{call_sid}",
    params(("call_sid" = String, Path, description = "The platform's call id.")),
    responses(
        (status = 200, description = "The call session was removed", body = DeleteResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "Call not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn delete_call_handler(
    State(app_state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let removed = app_state
        .sessions
        .delete(&call_sid)
        .await
        .map_err(internal("Failed to delete call"))?;
    if !removed {
        return Err(failure(StatusCode::NOT_FOUND, "Call not found"));
    }
    info!(call_sid = %call_sid, "Deleted call session");
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Call {} deleted", call_sid),
    }))
}

/// The audit trail of one call, oldest first.
#[utoipa::path(
    get,
    path = "/api/calls/{call_sid}/logs",
    params(("call_sid" = String, Path, description = "The platform's call id.")),
    responses(
        (status = 200, description = "Events recorded for the call", body = CallLogsResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn call_logs_handler(
    State(app_state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let events = app_state
        .persistence
        .list_call_events(&call_sid)
        .await
        .map_err(internal("Failed to fetch call logs"))?;
    let data: Vec<CallEventDto> = events.into_iter().map(CallEventDto::from).collect();
    Ok(Json(CallLogsResponse {
        success: true,
        total: data.len(),
        data,
    }))
}

/// Drop every call session. Ratings and events are kept.
#[utoipa::path(
    delete,
    path = "/api/calls",
    responses(
        (status = 200, description = "All call sessions removed", body = ClearResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn clear_calls_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AdminError> {
    let cleared = app_state
        .sessions
        .clear()
        .await
        .map_err(internal("Failed to clear calls"))?;
    info!("Cleared {} call sessions", cleared);
    Ok(Json(ClearResponse {
        success: true,
        message: "All call data cleared".to_string(),
        cleared,
    }))
}

/// Every saved rating, newest first.
#[utoipa::path(
    get,
    path = "/api/ratings",
    responses(
        (status = 200, description = "Saved ratings", body = RatingListResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_ratings_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AdminError> {
    let ratings = app_state
        .persistence
        .list_ratings()
        .await
        .map_err(internal("Failed to fetch ratings"))?;
    let data: Vec<RatingDto> = ratings.into_iter().map(RatingDto::from).collect();
    Ok(Json(RatingListResponse {
        success: true,
        total: data.len(),
        data,
    }))
}

/// Every registered subscriber.
#[utoipa::path(
    get,
    path = "/api/users",
    responses(
        (status = 200, description = "Registered subscribers", body = UserListResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_users_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AdminError> {
    let subscribers = app_state
        .persistence
        .list_subscribers()
        .await
        .map_err(internal("Failed to fetch users"))?;
    let data: Vec<UserDto> = subscribers.into_iter().map(UserDto::from).collect();
    Ok(Json(UserListResponse {
        success: true,
        total: data.len(),
        data,
    }))
}

/// Ratings left by one subscriber, matched on the subscriber id or the linked user id.
#[utoipa::path(
    get,
    path = "/api/users/{id}/ratings",
    params(("id" = String, Path, description = "Subscriber id or linked user id.")),
    responses(
        (status = 200, description = "The subscriber's ratings", body = RatingListResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn user_ratings_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let ratings = app_state
        .persistence
        .list_ratings()
        .await
        .map_err(internal("Failed to fetch user ratings"))?;
    let data: Vec<RatingDto> = ratings
        .into_iter()
        .filter(|r| r.subscriber_id == id || r.user_id.as_deref() == Some(id.as_str()))
        .map(RatingDto::from)
        .collect();
    Ok(Json(RatingListResponse {
        success: true,
        total: data.len(),
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::test_support::{body_json, test_state};
    use crate::web::webhooks::{
        house_number_webhook, language_selection_webhook, rating_webhook, voice_webhook,
        WebhookForm,
    };
    use axum::Form;

    async fn rated_call(state: &Arc<AppState>, call_sid: &str, rating: &str) {
        let form = |digits: Option<&str>| {
            Ok(Form(WebhookForm {
                call_sid: Some(call_sid.to_string()),
                digits: digits.map(str::to_string),
                ..Default::default()
            }))
        };
        voice_webhook(State(state.clone()), form(None)).await;
        language_selection_webhook(State(state.clone()), form(Some("1"))).await;
        house_number_webhook(State(state.clone()), form(Some("1002"))).await;
        rating_webhook(State(state.clone()), form(Some(rating))).await;
    }

    fn range(start: Option<&str>, end: Option<&str>) -> Query<DateRangeQuery> {
        Query(DateRangeQuery {
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn calls_are_listed_with_envelope_and_total() {
        let state = test_state();
        rated_call(&state, "CA1", "4").await;

        let json = body_json(list_calls_handler(State(state)).await.into_response()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["total"], 1);
        assert_eq!(json["data"][0]["callSid"], "CA1");
        assert_eq!(json["data"][0]["houseNumber"], "1002");
        assert_eq!(json["data"][0]["ratingText"], "very good");
        assert_eq!(json["data"][0]["language"], "English");
        assert_eq!(json["data"][0]["subscriberId"], "sub-1");
        assert_eq!(json["data"][0]["subscriberName"], "Asha");
    }

    #[tokio::test]
    async fn calls_are_filtered_by_number_and_status() {
        let state = test_state();
        state
            .sessions
            .put(CallSession::new("CA1", "+1555", "+1800", CallStatus::InProgress, Utc::now()))
            .await
            .unwrap();
        state
            .sessions
            .put(CallSession::new("CA2", "+1666", "+1555", CallStatus::Completed, Utc::now()))
            .await
            .unwrap();
        state
            .sessions
            .put(CallSession::new("CA3", "+1777", "+1800", CallStatus::Completed, Utc::now()))
            .await
            .unwrap();

        let json = body_json(
            calls_by_number_handler(State(state.clone()), Path("+1555".to_string()))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(json["total"], 2);

        let json = body_json(
            calls_by_status_handler(State(state.clone()), Path("completed".to_string()))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(json["total"], 2);
        assert!(json["data"]
            .as_array()
            .unwrap()
            .iter()
            .all(|c| c["callStatus"] == "completed"));

        let response = calls_by_status_handler(State(state), Path("exploded".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn calls_are_filtered_by_date_range() {
        let state = test_state();
        let day = |d: u32| Utc.with_ymd_and_hms(2024, 3, d, 18, 30, 0).unwrap();
        for (sid, d) in [("CA1", 1), ("CA2", 2), ("CA3", 3)] {
            state
                .sessions
                .put(CallSession::new(sid, "+1", "+2", CallStatus::Completed, day(d)))
                .await
                .unwrap();
        }

        let json = body_json(
            calls_by_date_range_handler(
                State(state.clone()),
                range(Some("2024-03-02"), Some("2024-03-03")),
            )
            .await
            .into_response(),
        )
        .await;
        assert_eq!(json["total"], 2);

        let json = body_json(
            calls_by_date_range_handler(
                State(state.clone()),
                range(Some("2024-03-01T00:00:00Z"), Some("2024-03-01T12:00:00Z")),
            )
            .await
            .into_response(),
        )
        .await;
        assert_eq!(json["total"], 0);

        let response =
            calls_by_date_range_handler(State(state.clone()), range(Some("2024-03-01"), None))
                .await
                .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "Start date and end date are required");

        let response =
            calls_by_date_range_handler(State(state), range(Some("yesterday"), Some("2024-03-03")))
                .await
                .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn one_call_can_be_deleted() {
        let state = test_state();
        rated_call(&state, "CA1", "3").await;
        rated_call(&state, "CA2", "4").await;

        let response = delete_call_handler(State(state.clone()), Path("CA1".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.sessions.get("CA1").await.unwrap().is_none());
        assert!(state.sessions.get("CA2").await.unwrap().is_some());
        assert_eq!(state.persistence.list_ratings().await.unwrap().len(), 2);

        let response = delete_call_handler(State(state), Path("CA1".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ratings_are_listed_per_subscriber() {
        let state = test_state();
        rated_call(&state, "CA1", "5").await;
        rated_call(&state, "CA2", "1").await;

        for id in ["sub-1", "user-1"] {
            let json = body_json(
                user_ratings_handler(State(state.clone()), Path(id.to_string()))
                    .await
                    .into_response(),
            )
            .await;
            assert_eq!(json["total"], 2);
            assert_eq!(json["data"][0]["userId"], "user-1");
        }

        let json = body_json(
            user_ratings_handler(State(state), Path("someone-else".to_string()))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn unknown_call_is_a_404() {
        let state = test_state();
        let response = get_call_handler(State(state), Path("CA-missing".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Call not found");
    }

    #[tokio::test]
    async fn stats_logs_and_ratings_reflect_completed_calls() {
        let state = test_state();
        rated_call(&state, "CA1", "4").await;
        rated_call(&state, "CA2", "2").await;

        let stats = body_json(call_stats_handler(State(state.clone())).await.into_response()).await;
        assert_eq!(stats["data"]["totalCalls"], 2);
        assert_eq!(stats["data"]["averageRating"], 3.0);
        assert_eq!(stats["data"]["topHouseNumbers"][0]["houseNumber"], "1002");
        assert_eq!(stats["data"]["topHouseNumbers"][0]["count"], 2);

        let logs = body_json(
            call_logs_handler(State(state.clone()), Path("CA1".to_string()))
                .await
                .into_response(),
        )
        .await;
        assert_eq!(logs["total"], 4);
        assert_eq!(logs["data"][0]["type"], "call_started");
        assert_eq!(logs["data"][3]["payload"]["rating_text"], "very good");

        let ratings = body_json(list_ratings_handler(State(state.clone())).await.into_response()).await;
        assert_eq!(ratings["total"], 2);
        assert_eq!(ratings["data"][0]["callSid"], "CA2");
        assert_eq!(ratings["data"][0]["username"], "Asha");

        let users = body_json(list_users_handler(State(state)).await.into_response()).await;
        assert_eq!(users["data"][0]["houseNumber"], "1002");
    }

    #[tokio::test]
    async fn clearing_removes_sessions_only() {
        let state = test_state();
        rated_call(&state, "CA1", "5").await;

        let json = body_json(clear_calls_handler(State(state.clone())).await.into_response()).await;
        assert_eq!(json["cleared"], 1);
        assert!(state.sessions.list().await.unwrap().is_empty());
        assert!(state.sessions.get("CA1").await.unwrap().is_none());
        assert_eq!(state.persistence.list_ratings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let json = body_json(health_handler().await.into_response()).await;
        assert_eq!(json["status"], "OK");
        assert_eq!(json["message"], "Waste Management IVR System is running");
    }

    #[test]
    fn openapi_document_lists_admin_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/calls/{call_sid}/logs"));
        assert!(doc.paths.paths.contains_key("/api/calls/number/{phone_number}"));
        assert!(doc.paths.paths.contains_key("/api/calls/status/{status}"));
        assert!(doc.paths.paths.contains_key("/api/calls/date-range"));
        assert!(doc.paths.paths.contains_key("/api/users/{id}/ratings"));
        assert!(doc.paths.paths.contains_key("/health"));
    }
}

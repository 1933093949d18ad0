//! services/api/src/web/webhooks.rs
//!
//! Axum handlers for the telephony platform's voice webhooks. Each handler
//! feeds one callback into the call flow and answers with TwiML.

use crate::web::state::AppState;
use crate::web::twiml::{render, Twiml};
use axum::{
    extract::{rejection::FormRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Form,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use waste_ivr_core::domain::{CallStatus, Language};
use waste_ivr_core::flow::CallStart;
use waste_ivr_core::ports::PortError;
use waste_ivr_core::prompts;
use waste_ivr_core::voice::VoiceReply;

//=========================================================================================
// Payload and Error Types
//=========================================================================================

/// The form fields the platform posts to every webhook. Only `CallSid` is always needed.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookForm {
    #[serde(rename = "CallSid")]
    pub call_sid: Option<String>,
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "To")]
    pub to: Option<String>,
    #[serde(rename = "CallStatus")]
    pub call_status: Option<String>,
    #[serde(rename = "Digits")]
    pub digits: Option<String>,
    #[serde(rename = "CallDuration")]
    pub call_duration: Option<String>,
}

impl WebhookForm {
    fn call_sid(&self) -> Result<&str, WebhookError> {
        self.call_sid
            .as_deref()
            .map(str::trim)
            .filter(|sid| !sid.is_empty())
            .ok_or(WebhookError::MissingCallSid)
    }
}

/// Anything that stops a webhook from producing its normal reply.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Malformed webhook payload: {0}")]
    Malformed(String),
    #[error("Webhook payload has no CallSid")]
    MissingCallSid,
    #[error("Call flow failed: {0}")]
    Flow(#[from] PortError),
}

fn accept(payload: Result<Form<WebhookForm>, FormRejection>) -> Result<WebhookForm, WebhookError> {
    payload
        .map(|Form(form)| form)
        .map_err(|rejection| WebhookError::Malformed(rejection.body_text()))
}

/// Renders the flow's reply, or an apology and hangup in the configured voice.
/// Details of a failure stay in the log.
fn respond(app_state: &AppState, outcome: Result<VoiceReply, WebhookError>) -> Twiml {
    match outcome {
        Ok(reply) => Twiml::ok(&reply),
        Err(e) => {
            error!("Voice webhook failed: {}", e);
            let reply = VoiceReply::new()
                .say(
                    prompts::APOLOGY,
                    &app_state.flow.settings().voice,
                    Language::English.locale(),
                )
                .hangup();
            Twiml {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: render(&reply),
            }
        }
    }
}

//=========================================================================================
// Voice Webhooks
//=========================================================================================

/// Entry point for a new call, and the target of "no input" redirects before a language is chosen.
pub async fn voice_webhook(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Form<WebhookForm>, FormRejection>,
) -> Twiml {
    let outcome = start_call(&app_state, payload).await;
    respond(&app_state, outcome)
}

async fn start_call(
    app_state: &AppState,
    payload: Result<Form<WebhookForm>, FormRejection>,
) -> Result<VoiceReply, WebhookError> {
    let form = accept(payload)?;
    let call_id = form.call_sid()?.to_string();
    let status = form
        .call_status
        .as_deref()
        .and_then(|s| s.parse::<CallStatus>().ok())
        .unwrap_or(CallStatus::Ringing);

    let reply = app_state
        .flow
        .start_call(CallStart {
            call_id,
            from_number: form.from.unwrap_or_default(),
            to_number: form.to.unwrap_or_default(),
            status,
        })
        .await?;
    Ok(reply)
}

pub async fn language_selection_webhook(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Form<WebhookForm>, FormRejection>,
) -> Twiml {
    let outcome = match accept(payload) {
        Ok(form) => match form.call_sid() {
            Ok(call_id) => app_state
                .flow
                .select_language(call_id, form.digits.as_deref())
                .await
                .map_err(WebhookError::from),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    respond(&app_state, outcome)
}

pub async fn house_number_webhook(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Form<WebhookForm>, FormRejection>,
) -> Twiml {
    let outcome = match accept(payload) {
        Ok(form) => match form.call_sid() {
            Ok(call_id) => app_state
                .flow
                .enter_identifier(call_id, form.digits.as_deref())
                .await
                .map_err(WebhookError::from),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    respond(&app_state, outcome)
}

pub async fn rating_webhook(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Form<WebhookForm>, FormRejection>,
) -> Twiml {
    let outcome = match accept(payload) {
        Ok(form) => match form.call_sid() {
            Ok(call_id) => app_state
                .flow
                .submit_rating(call_id, form.digits.as_deref())
                .await
                .map_err(WebhookError::from),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    respond(&app_state, outcome)
}

//=========================================================================================
// Status Callback
//=========================================================================================

/// Out-of-band lifecycle updates. Answers in plain text, never TwiML.
pub async fn call_status_webhook(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Form<WebhookForm>, FormRejection>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let form = payload
        .map(|Form(form)| form)
        .map_err(|rejection| (StatusCode::BAD_REQUEST, rejection.body_text()))?;
    let call_id = form
        .call_sid()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let raw_status = form.call_status.as_deref().unwrap_or_default();
    let status = raw_status.parse::<CallStatus>().map_err(|e| {
        warn!(call_sid = %call_id, "Rejected status callback: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    let duration = match form.call_duration.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => match raw.parse::<u32>() {
            Ok(secs) => Some(secs),
            Err(_) => {
                warn!(call_sid = %call_id, duration = raw, "Ignoring unparseable CallDuration");
                None
            }
        },
        _ => None,
    };

    info!(call_sid = %call_id, %status, "Call status update");
    app_state
        .flow
        .update_status(call_id, status, duration)
        .await
        .map_err(|e| {
            error!("Failed to update call status: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error updating call status".to_string(),
            )
        })?;
    Ok((StatusCode::OK, "Status updated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::test_support::{body_text, test_state, test_state_with};
    use waste_ivr_core::domain::{CallStep, LookupState};

    fn form(call_sid: &str, digits: Option<&str>) -> Result<Form<WebhookForm>, FormRejection> {
        Ok(Form(WebhookForm {
            call_sid: Some(call_sid.to_string()),
            from: Some("+15550001111".to_string()),
            to: Some("+18005550000".to_string()),
            call_status: Some("in-progress".to_string()),
            digits: digits.map(str::to_string),
            call_duration: None,
        }))
    }

    async fn twiml(reply: Twiml) -> (StatusCode, String) {
        let response = reply.into_response();
        let status = response.status();
        (status, body_text(response).await)
    }

    #[tokio::test]
    async fn full_call_walks_through_every_menu() {
        let state = test_state();

        let (status, body) = twiml(voice_webhook(State(state.clone()), form("CA1", None)).await).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Welcome to Waste Management Services."));
        assert!(body.contains(r#"action="/api/twilio/language-selection""#));
        assert!(body.contains("Press 1 for English, 2 for Hindi, 3 for Tamil, 4 for Kannada."));

        let (_, body) =
            twiml(language_selection_webhook(State(state.clone()), form("CA1", Some("2"))).await).await;
        assert!(body.contains(r#"action="/api/twilio/house-number""#));
        assert!(body.contains(r#"numDigits="4""#));
        assert!(body.contains(r#"language="en-IN""#));

        let (_, body) =
            twiml(house_number_webhook(State(state.clone()), form("CA1", Some("1002"))).await).await;
        assert!(body.contains("Welcome Asha. Your house number is 1 0 0 2."));
        assert!(body.contains(r#"action="/api/twilio/rating""#));

        let (_, body) = twiml(rating_webhook(State(state.clone()), form("CA1", Some("5"))).await).await;
        assert!(body.contains("Thank you for your feedback."));
        assert!(body.ends_with("<Hangup/></Response>"));

        let session = state.sessions.get("CA1").await.unwrap().unwrap();
        assert_eq!(session.step, CallStep::Rated);
        assert_eq!(session.subscriber_lookup, LookupState::Found);
        assert_eq!(state.persistence.list_ratings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_call_sid_gets_an_apology() {
        let state = test_state();
        let payload = Ok(Form(WebhookForm::default()));
        let (status, body) = twiml(voice_webhook(State(state), payload).await).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains(prompts::APOLOGY));
        assert!(body.contains("<Hangup/>"));
    }

    #[tokio::test]
    async fn apology_uses_the_configured_voice() {
        let state = test_state_with(&[("TTS_VOICE", "Polly.Aditi")]);
        let payload = Ok(Form(WebhookForm::default()));
        let (status, body) = twiml(rating_webhook(State(state), payload).await).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains(r#"voice="Polly.Aditi""#));
        assert!(!body.contains(r#"voice="alice""#));
        assert!(body.contains(prompts::APOLOGY));
    }

    #[tokio::test]
    async fn invalid_rating_reprompts() {
        let state = test_state();
        voice_webhook(State(state.clone()), form("CA2", None)).await;
        language_selection_webhook(State(state.clone()), form("CA2", Some("1"))).await;
        house_number_webhook(State(state.clone()), form("CA2", Some("4040"))).await;

        let (status, body) = twiml(rating_webhook(State(state.clone()), form("CA2", Some("9"))).await).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(prompts::INVALID_RATING));
        assert!(!body.contains("<Hangup/>"));
        assert!(state.persistence.list_ratings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_callback_updates_status_and_rejects_unknown_values() {
        let state = test_state();
        voice_webhook(State(state.clone()), form("CA3", None)).await;

        let mut update = WebhookForm {
            call_sid: Some("CA3".to_string()),
            call_status: Some("completed".to_string()),
            call_duration: Some("42".to_string()),
            ..Default::default()
        };
        let response = call_status_webhook(State(state.clone()), Ok(Form(update)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Status updated");

        let session = state.sessions.get("CA3").await.unwrap().unwrap();
        assert_eq!(session.status, CallStatus::Completed);
        assert_eq!(session.duration_secs, Some(42));
        assert_eq!(session.step, CallStep::Started);

        update = WebhookForm {
            call_sid: Some("CA3".to_string()),
            call_status: Some("exploded".to_string()),
            ..Default::default()
        };
        let response = call_status_webhook(State(state), Ok(Form(update)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

//! crates/waste_ivr_core/src/domain.rs
//!
//! Defines the pure, core data structures for the feedback line.
//! These types are independent of any database, HTTP or markup format.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Errors raised when a stored or received string does not name a known value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("Unknown call step: {0}")]
    UnknownStep(String),
    #[error("Unknown call status: {0}")]
    UnknownStatus(String),
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),
    #[error("Rating out of range: {0}")]
    InvalidRating(String),
    #[error("Unknown event type: {0}")]
    UnknownEventKind(String),
    #[error("Unknown lookup state: {0}")]
    UnknownLookupState(String),
}

//=========================================================================================
// Call Step
//=========================================================================================

/// Position of a call within the feedback menu. Steps only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallStep {
    Started,
    LanguageSelected,
    IdentifierEntered,
    Rated,
    /// Reached from `Rated` once the platform reports the call as completed.
    Completed,
}

impl CallStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStep::Started => "started",
            CallStep::LanguageSelected => "language_selected",
            CallStep::IdentifierEntered => "identifier_entered",
            CallStep::Rated => "rated",
            CallStep::Completed => "completed",
        }
    }

    /// True once the caller has answered every question.
    pub fn is_finished(&self) -> bool {
        matches!(self, CallStep::Rated | CallStep::Completed)
    }
}

impl fmt::Display for CallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStep {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(CallStep::Started),
            "language_selected" => Ok(CallStep::LanguageSelected),
            "identifier_entered" => Ok(CallStep::IdentifierEntered),
            "rated" => Ok(CallStep::Rated),
            "completed" => Ok(CallStep::Completed),
            other => Err(DomainError::UnknownStep(other.to_string())),
        }
    }
}

//=========================================================================================
// Call Status
//=========================================================================================

/// Lifecycle status reported by the telephony platform, independent of the menu step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Canceled,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
            CallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(CallStatus::Queued),
            "initiated" => Ok(CallStatus::Initiated),
            "ringing" => Ok(CallStatus::Ringing),
            "in-progress" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "busy" => Ok(CallStatus::Busy),
            "no-answer" => Ok(CallStatus::NoAnswer),
            "canceled" => Ok(CallStatus::Canceled),
            "failed" => Ok(CallStatus::Failed),
            _ => Err(DomainError::UnknownStatus(s.to_string())),
        }
    }
}

//=========================================================================================
// Language
//=========================================================================================

/// A language the caller can pick from the first menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    English,
    Hindi,
    Tamil,
    Kannada,
    Spanish,
    French,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::English,
        Language::Hindi,
        Language::Tamil,
        Language::Kannada,
        Language::Spanish,
        Language::French,
    ];

    /// Human-readable name, as spoken in the menu and stored on the session.
    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Hindi => "Hindi",
            Language::Tamil => "Tamil",
            Language::Kannada => "Kannada",
            Language::Spanish => "Spanish",
            Language::French => "French",
        }
    }

    /// Lowercase key used in configuration and prerecorded prompt file names.
    pub fn key(&self) -> &'static str {
        match self {
            Language::English => "english",
            Language::Hindi => "hindi",
            Language::Tamil => "tamil",
            Language::Kannada => "kannada",
            Language::Spanish => "spanish",
            Language::French => "french",
        }
    }

    /// Speech locale handed to the platform's text-to-speech voice.
    pub fn locale(&self) -> &'static str {
        match self {
            Language::Hindi => "en-IN",
            Language::Spanish => "es-ES",
            Language::French => "fr-FR",
            Language::English | Language::Tamil | Language::Kannada => "en-US",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Language::ALL
            .into_iter()
            .find(|lang| lang.key().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DomainError::UnknownLanguage(s.to_string()))
    }
}

//=========================================================================================
// Rating
//=========================================================================================

/// A satisfaction score between 1 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// Parses a keypad entry. Exactly one digit in `1..=5` is accepted.
    pub fn from_digits(digits: &str) -> Option<Self> {
        let mut chars = digits.chars();
        let first = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        let value = first.to_digit(10)?;
        Self::new(value as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn label(&self) -> &'static str {
        match self.0 {
            1 => "poor",
            2 => "fair",
            3 => "good",
            4 => "very good",
            _ => "excellent",
        }
    }
}

impl TryFrom<i64> for Rating {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Rating::new)
            .ok_or_else(|| DomainError::InvalidRating(value.to_string()))
    }
}

//=========================================================================================
// Subscriber lookup state
//=========================================================================================

/// Outcome of the best-effort subscriber lookup, remembered on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    /// No identifier has been looked up yet.
    Pending,
    Found,
    NotFound,
    /// The datastore could not answer; the lookup is retried when the rating is saved.
    Unavailable,
}

impl LookupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupState::Pending => "pending",
            LookupState::Found => "found",
            LookupState::NotFound => "not_found",
            LookupState::Unavailable => "unavailable",
        }
    }
}

impl FromStr for LookupState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LookupState::Pending),
            "found" => Ok(LookupState::Found),
            "not_found" => Ok(LookupState::NotFound),
            "unavailable" => Ok(LookupState::Unavailable),
            other => Err(DomainError::UnknownLookupState(other.to_string())),
        }
    }
}

//=========================================================================================
// Call Session
//=========================================================================================

/// Transient state for a single phone call, keyed by the platform's call id.
///
/// Each collected field is written at most once, by the transition that
/// introduces it. Once the session is rated only `status` and
/// `duration_secs` may still change.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub step: CallStep,
    pub status: CallStatus,
    pub language: Option<Language>,
    pub service_identifier: Option<String>,
    pub rating: Option<Rating>,
    pub subscriber_lookup: LookupState,
    /// The subscriber matched at the identifier step, kept so the rating can be linked without a second lookup.
    pub subscriber: Option<SubscriberRecord>,
    pub duration_secs: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        from_number: impl Into<String>,
        to_number: impl Into<String>,
        status: CallStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_number: from_number.into(),
            to_number: to_number.into(),
            step: CallStep::Started,
            status,
            language: None,
            service_identifier: None,
            rating: None,
            subscriber_lookup: LookupState::Pending,
            subscriber: None,
            duration_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stores the chosen language. Returns `false` if the step has already passed.
    pub fn choose_language(&mut self, language: Language, now: DateTime<Utc>) -> bool {
        if self.step != CallStep::Started {
            return false;
        }
        self.language = Some(language);
        self.step = CallStep::LanguageSelected;
        self.updated_at = now;
        true
    }

    /// Stores the service identifier. Returns `false` if the step is not expecting it.
    pub fn enter_identifier(&mut self, identifier: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.step != CallStep::LanguageSelected {
            return false;
        }
        self.service_identifier = Some(identifier.into());
        self.step = CallStep::IdentifierEntered;
        self.updated_at = now;
        true
    }

    /// Remembers the subscriber lookup made right after the identifier was entered.
    pub fn note_lookup(&mut self, state: LookupState, subscriber: Option<SubscriberRecord>) {
        if self.step != CallStep::IdentifierEntered {
            return;
        }
        self.subscriber_lookup = state;
        self.subscriber = subscriber;
    }

    pub fn subscriber_name(&self) -> Option<&str> {
        self.subscriber.as_ref().map(|s| s.display_name.as_str())
    }

    /// Stores the rating. Returns `false` if the step is not expecting it.
    pub fn rate(&mut self, rating: Rating, now: DateTime<Utc>) -> bool {
        if self.step != CallStep::IdentifierEntered {
            return false;
        }
        self.rating = Some(rating);
        self.step = CallStep::Rated;
        self.updated_at = now;
        true
    }

    /// Applies an out-of-band status callback. Collected fields are never touched.
    pub fn apply_status(&mut self, status: CallStatus, duration_secs: Option<u32>, now: DateTime<Utc>) {
        self.status = status;
        if duration_secs.is_some() {
            self.duration_secs = duration_secs;
        }
        if self.step == CallStep::Rated && status == CallStatus::Completed {
            self.step = CallStep::Completed;
        }
        self.updated_at = now;
    }

    pub fn rating_label(&self) -> Option<&'static str> {
        self.rating.map(|r| r.label())
    }
}

//=========================================================================================
// Subscribers, Ratings and Events
//=========================================================================================

/// A registered household, looked up by its service identifier. Never mutated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberRecord {
    pub id: String,
    pub identifier: String,
    pub display_name: String,
    pub user_id: Option<String>,
}

/// An append-only rating linked to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingRecord {
    pub id: String,
    pub subscriber_id: String,
    pub subscriber_name: String,
    pub identifier: String,
    /// External user id of the subscriber, when the datastore keeps one.
    pub user_id: Option<String>,
    pub call_id: Option<String>,
    pub rating: Rating,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    CallStarted,
    LanguageSelected,
    IdentifierEntered,
    RatingRecorded,
    StatusUpdated,
}

impl CallEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallEventKind::CallStarted => "call_started",
            CallEventKind::LanguageSelected => "language_selected",
            CallEventKind::IdentifierEntered => "identifier_entered",
            CallEventKind::RatingRecorded => "rating_recorded",
            CallEventKind::StatusUpdated => "status_updated",
        }
    }
}

impl FromStr for CallEventKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call_started" => Ok(CallEventKind::CallStarted),
            "language_selected" => Ok(CallEventKind::LanguageSelected),
            "identifier_entered" => Ok(CallEventKind::IdentifierEntered),
            "rating_recorded" => Ok(CallEventKind::RatingRecorded),
            "status_updated" => Ok(CallEventKind::StatusUpdated),
            other => Err(DomainError::UnknownEventKind(other.to_string())),
        }
    }
}

/// An audit entry describing one step of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    pub id: Uuid,
    pub call_id: String,
    pub kind: CallEventKind,
    pub payload: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl CallEvent {
    pub fn new(call_id: impl Into<String>, kind: CallEventKind, payload: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id: call_id.into(),
            kind,
            payload,
            recorded_at: Utc::now(),
        }
    }
}

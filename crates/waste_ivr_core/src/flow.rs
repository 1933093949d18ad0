//! crates/waste_ivr_core/src/flow.rs
//!
//! The call flow controller. Each webhook callback is mapped to a transition
//! of the per-call state machine:
//!
//! ```text
//! (none) --call--> Started --language--> LanguageSelected --identifier-->
//!     IdentifierEntered --rating--> Rated --status: completed--> Completed
//! ```
//!
//! Missing or invalid input re-prompts the same question. The datastore is
//! consulted on a best-effort basis and its failures never change the script.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    CallEvent, CallEventKind, CallSession, CallStatus, CallStep, Language, LookupState, Rating,
};
use crate::ports::{Lookup, PersistenceService, PortResult, SessionStore};
use crate::prompts::{self, PromptKey};
use crate::voice::{Verb, VoiceReply};

//=========================================================================================
// Settings
//=========================================================================================

/// Webhook URLs the platform is told to post the next input to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRoutes {
    pub voice: String,
    pub language: String,
    pub identifier: String,
    pub rating: String,
}

impl WebhookRoutes {
    /// Builds the route set under a base path such as `/api/twilio`.
    pub fn under(base_path: &str) -> Self {
        let base = base_path.trim_end_matches('/');
        Self {
            voice: format!("{base}/voice"),
            language: format!("{base}/language-selection"),
            identifier: format!("{base}/house-number"),
            rating: format!("{base}/rating"),
        }
    }
}

/// Deployment-specific knobs of the menu.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Digit `n` selects `languages[n - 1]`.
    pub languages: Vec<Language>,
    pub identifier_length: usize,
    pub language_timeout_secs: u32,
    pub identifier_timeout_secs: u32,
    pub rating_timeout_secs: u32,
    pub voice: String,
    /// When set, per-language prompts are played from `{base}/{prompt}-{language}.mp3`.
    pub prompt_audio_base_url: Option<String>,
    pub routes: WebhookRoutes,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            languages: vec![
                Language::English,
                Language::Hindi,
                Language::Tamil,
                Language::Kannada,
            ],
            identifier_length: 10,
            language_timeout_secs: 10,
            identifier_timeout_secs: 12,
            rating_timeout_secs: 8,
            voice: "alice".to_string(),
            prompt_audio_base_url: None,
            routes: WebhookRoutes::under("/api/twilio"),
        }
    }
}

impl FlowSettings {
    pub fn language_for_digits(&self, digits: &str) -> Option<Language> {
        let mut chars = digits.chars();
        let first = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        let index = first.to_digit(10)? as usize;
        if index == 0 {
            return None;
        }
        self.languages.get(index - 1).copied()
    }

    pub fn is_valid_identifier(&self, digits: &str) -> bool {
        digits.len() == self.identifier_length && digits.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Metadata of a freshly connected call.
#[derive(Debug, Clone)]
pub struct CallStart {
    pub call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub status: CallStatus,
}

//=========================================================================================
// Controller
//=========================================================================================

pub struct CallFlow {
    sessions: Arc<dyn SessionStore>,
    persistence: Arc<dyn PersistenceService>,
    settings: FlowSettings,
}

impl CallFlow {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        persistence: Arc<dyn PersistenceService>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            sessions,
            persistence,
            settings,
        }
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Entry point: creates the session and offers the language menu.
    ///
    /// A repeated entry callback for a known call resumes at its current step.
    pub async fn start_call(&self, start: CallStart) -> PortResult<VoiceReply> {
        if let Some(session) = self.sessions.get(&start.call_id).await? {
            debug!(call_sid = %session.call_id, step = %session.step, "Known call re-entered; replaying current step");
            return Ok(self.replay(&session));
        }

        info!(
            call_sid = %start.call_id,
            from = %start.from_number,
            to = %start.to_number,
            "Incoming call"
        );
        let session = CallSession::new(
            start.call_id.clone(),
            start.from_number.clone(),
            start.to_number.clone(),
            start.status,
            Utc::now(),
        );
        self.sessions.put(session).await?;
        self.audit(
            &start.call_id,
            CallEventKind::CallStarted,
            [
                ("from", start.from_number),
                ("to", start.to_number),
                ("status", start.status.to_string()),
            ],
        )
        .await;

        Ok(self.welcome())
    }

    pub async fn select_language(&self, call_id: &str, digits: Option<&str>) -> PortResult<VoiceReply> {
        let Some(mut session) = self.sessions.get(call_id).await? else {
            return self.restart(call_id).await;
        };
        if session.step != CallStep::Started {
            return Ok(self.replay(&session));
        }
        let Some(digits) = present(digits) else {
            return Ok(self.language_menu(VoiceReply::new()));
        };
        let Some(language) = self.settings.language_for_digits(digits) else {
            info!(call_sid = %call_id, digits, "Invalid language selection");
            let reply = self.say(VoiceReply::new(), prompts::INVALID_SELECTION, Language::English);
            return Ok(self.language_menu(reply));
        };

        session.choose_language(language, Utc::now());
        self.sessions.put(session).await?;
        info!(call_sid = %call_id, language = %language, "Language selected");
        self.audit(
            call_id,
            CallEventKind::LanguageSelected,
            [("language", language.name().to_string()), ("digits", digits.to_string())],
        )
        .await;

        Ok(self.identifier_prompt(VoiceReply::new(), language))
    }

    pub async fn enter_identifier(&self, call_id: &str, digits: Option<&str>) -> PortResult<VoiceReply> {
        let Some(mut session) = self.sessions.get(call_id).await? else {
            return self.restart(call_id).await;
        };
        if session.step != CallStep::LanguageSelected {
            return Ok(self.replay(&session));
        }
        let language = session.language.unwrap_or(Language::English);
        let Some(digits) = present(digits) else {
            return Ok(self.identifier_prompt(VoiceReply::new(), language));
        };
        if !self.settings.is_valid_identifier(digits) {
            info!(call_sid = %call_id, digits, "Invalid service identifier");
            let message = prompts::invalid_identifier(self.settings.identifier_length);
            let reply = self.say(VoiceReply::new(), message, language);
            return Ok(self.identifier_prompt(reply, language));
        }

        session.enter_identifier(digits, Utc::now());
        let greeting = match self.persistence.find_subscriber_by_identifier(digits).await {
            Lookup::Found(subscriber) => {
                info!(call_sid = %call_id, subscriber = %subscriber.display_name, "Subscriber found");
                let greeting = prompts::subscriber_greeting(&subscriber.display_name, digits);
                session.note_lookup(LookupState::Found, Some(subscriber));
                greeting
            }
            Lookup::NotFound => {
                info!(call_sid = %call_id, identifier = digits, "No subscriber for identifier");
                session.note_lookup(LookupState::NotFound, None);
                prompts::anonymous_greeting(digits)
            }
            Lookup::Unavailable(reason) => {
                warn!(call_sid = %call_id, %reason, "Subscriber lookup unavailable");
                session.note_lookup(LookupState::Unavailable, None);
                prompts::anonymous_greeting(digits)
            }
        };
        let found = session.subscriber_lookup == LookupState::Found;
        self.sessions.put(session).await?;
        self.audit(
            call_id,
            CallEventKind::IdentifierEntered,
            [("identifier", digits.to_string()), ("subscriber_found", found.to_string())],
        )
        .await;

        let reply = self.say(VoiceReply::new(), greeting, language);
        Ok(self.rating_prompt(reply, language))
    }

    pub async fn submit_rating(&self, call_id: &str, digits: Option<&str>) -> PortResult<VoiceReply> {
        let Some(mut session) = self.sessions.get(call_id).await? else {
            return self.restart(call_id).await;
        };
        if session.step != CallStep::IdentifierEntered {
            return Ok(self.replay(&session));
        }
        let language = session.language.unwrap_or(Language::English);
        let Some(digits) = present(digits) else {
            return Ok(self.rating_prompt(VoiceReply::new(), language));
        };
        let Some(rating) = Rating::from_digits(digits) else {
            info!(call_sid = %call_id, digits, "Invalid rating");
            let reply = self.say(VoiceReply::new(), prompts::INVALID_RATING, language);
            return Ok(self.rating_prompt(reply, language));
        };

        session.rate(rating, Utc::now());
        self.sessions.put(session.clone()).await?;
        info!(call_sid = %call_id, rating = rating.value(), label = rating.label(), "Rating stored");

        let saved = self.persist_rating(&session, rating).await;
        self.audit(
            call_id,
            CallEventKind::RatingRecorded,
            [
                ("rating", rating.value().to_string()),
                ("rating_text", rating.label().to_string()),
                ("saved", saved.to_string()),
            ],
        )
        .await;

        Ok(self.closing(VoiceReply::new(), language))
    }

    /// Out-of-band status callback. Only status and duration are touched.
    pub async fn update_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_secs: Option<u32>,
    ) -> PortResult<()> {
        let updated = self
            .sessions
            .update_status(call_id, status, duration_secs, Utc::now())
            .await?;
        let Some(session) = updated else {
            warn!(call_sid = %call_id, %status, "Status update for unknown call ignored");
            return Ok(());
        };
        info!(call_sid = %call_id, %status, step = %session.step, "Call status updated");

        let duration = duration_secs.map(|d| d.to_string()).unwrap_or_default();
        self.audit(
            call_id,
            CallEventKind::StatusUpdated,
            [("status", status.to_string()), ("duration", duration)],
        )
        .await;
        Ok(())
    }

    //=====================================================================================
    // Best-effort persistence
    //=====================================================================================

    /// Links the rating to the subscriber if one is known. Only a lookup that
    /// could not be answered earlier is retried. Returns whether it was saved.
    async fn persist_rating(&self, session: &CallSession, rating: Rating) -> bool {
        let subscriber = match (session.subscriber_lookup, &session.subscriber) {
            (LookupState::Found, Some(subscriber)) => subscriber.clone(),
            (LookupState::Unavailable, _) => {
                let Some(identifier) = session.service_identifier.as_deref() else {
                    return false;
                };
                match self.persistence.find_subscriber_by_identifier(identifier).await {
                    Lookup::Found(subscriber) => subscriber,
                    Lookup::NotFound => {
                        info!(call_sid = %session.call_id, identifier, "No subscriber; rating not saved");
                        return false;
                    }
                    Lookup::Unavailable(reason) => {
                        warn!(call_sid = %session.call_id, %reason, "Could not look up subscriber for rating");
                        return false;
                    }
                }
            }
            _ => {
                debug!(call_sid = %session.call_id, "No subscriber; rating kept on the session only");
                return false;
            }
        };

        match self
            .persistence
            .record_rating(&subscriber, rating, Some(&session.call_id))
            .await
        {
            Ok(record) => {
                info!(call_sid = %session.call_id, rating_id = %record.id, "Rating saved");
                true
            }
            Err(e) => {
                warn!(call_sid = %session.call_id, error = %e, "Could not save rating");
                false
            }
        }
    }

    async fn audit<const N: usize>(
        &self,
        call_id: &str,
        kind: CallEventKind,
        fields: [(&str, String); N],
    ) {
        let payload: BTreeMap<String, String> = fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        let event = CallEvent::new(call_id, kind, payload);
        if let Err(e) = self.persistence.append_call_event(event).await {
            warn!(call_sid = %call_id, event = kind.as_str(), error = %e, "Could not append call event");
        }
    }

    /// A step callback arrived for a call we hold no session for.
    async fn restart(&self, call_id: &str) -> PortResult<VoiceReply> {
        warn!(call_sid = %call_id, "Callback for unknown call; starting over");
        self.start_call(CallStart {
            call_id: call_id.to_string(),
            from_number: String::new(),
            to_number: String::new(),
            status: CallStatus::InProgress,
        })
        .await
    }

    //=====================================================================================
    // Replies
    //=====================================================================================

    fn replay(&self, session: &CallSession) -> VoiceReply {
        let language = session.language.unwrap_or(Language::English);
        match session.step {
            CallStep::Started => self.language_menu(VoiceReply::new()),
            CallStep::LanguageSelected => self.identifier_prompt(VoiceReply::new(), language),
            CallStep::IdentifierEntered => self.rating_prompt(VoiceReply::new(), language),
            CallStep::Rated | CallStep::Completed => self.closing(VoiceReply::new(), language),
        }
    }

    fn welcome(&self) -> VoiceReply {
        let reply = self.say(VoiceReply::new(), prompts::WELCOME, Language::English);
        self.language_menu(reply)
    }

    fn language_menu(&self, reply: VoiceReply) -> VoiceReply {
        let menu = prompts::language_menu(&self.settings.languages);
        self.gather(
            reply,
            &self.settings.routes.language,
            1,
            self.settings.language_timeout_secs,
            self.say_verb(menu, Language::English),
            Language::English,
        )
    }

    fn identifier_prompt(&self, reply: VoiceReply, language: Language) -> VoiceReply {
        self.gather(
            reply,
            &self.settings.routes.identifier,
            self.settings.identifier_length,
            self.settings.identifier_timeout_secs,
            self.prompt(PromptKey::EnterNumber, language),
            language,
        )
    }

    fn rating_prompt(&self, reply: VoiceReply, language: Language) -> VoiceReply {
        self.gather(
            reply,
            &self.settings.routes.rating,
            1,
            self.settings.rating_timeout_secs,
            self.prompt(PromptKey::RatingPrompt, language),
            language,
        )
    }

    fn closing(&self, reply: VoiceReply, language: Language) -> VoiceReply {
        reply.push(self.prompt(PromptKey::ThankYou, language)).hangup()
    }

    /// Collects digits, then falls back to "no input" and posts back to the same step.
    fn gather(
        &self,
        reply: VoiceReply,
        action: &str,
        num_digits: usize,
        timeout_secs: u32,
        prompt: Verb,
        language: Language,
    ) -> VoiceReply {
        let reply = reply.push(Verb::Gather {
            action: action.to_string(),
            num_digits,
            timeout_secs,
            prompt: vec![prompt],
        });
        self.say(reply, prompts::NO_INPUT, language).redirect(action)
    }

    fn prompt(&self, key: PromptKey, language: Language) -> Verb {
        match &self.settings.prompt_audio_base_url {
            Some(base) => Verb::Play {
                url: key.audio_url(base, language),
            },
            None => self.say_verb(key.text(), language),
        }
    }

    fn say(&self, reply: VoiceReply, text: impl Into<String>, language: Language) -> VoiceReply {
        reply.say(text, &self.settings.voice, language.locale())
    }

    fn say_verb(&self, text: impl Into<String>, language: Language) -> Verb {
        Verb::Say {
            text: text.into(),
            voice: self.settings.voice.clone(),
            locale: language.locale().to_string(),
        }
    }
}

/// Treats an absent or blank `Digits` field as "no input".
fn present(digits: Option<&str>) -> Option<&str> {
    digits.map(str::trim).filter(|d| !d.is_empty())
}

//=========================================================================================
// Tests
//=========================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RatingRecord, SubscriberRecord};
    use crate::ports::PortError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MapStore {
        sessions: Mutex<HashMap<String, CallSession>>,
    }

    #[async_trait]
    impl SessionStore for MapStore {
        async fn get(&self, call_id: &str) -> PortResult<Option<CallSession>> {
            Ok(self.sessions.lock().unwrap().get(call_id).cloned())
        }
        async fn put(&self, session: CallSession) -> PortResult<()> {
            self.sessions
                .lock()
                .unwrap()
                .insert(session.call_id.clone(), session);
            Ok(())
        }
        async fn update_status(
            &self,
            call_id: &str,
            status: CallStatus,
            duration_secs: Option<u32>,
            now: DateTime<Utc>,
        ) -> PortResult<Option<CallSession>> {
            let mut map = self.sessions.lock().unwrap();
            Ok(map.get_mut(call_id).map(|session| {
                session.apply_status(status, duration_secs, now);
                session.clone()
            }))
        }
        async fn delete(&self, call_id: &str) -> PortResult<bool> {
            Ok(self.sessions.lock().unwrap().remove(call_id).is_some())
        }
        async fn list(&self) -> PortResult<Vec<CallSession>> {
            Ok(self.sessions.lock().unwrap().values().cloned().collect())
        }
        async fn clear(&self) -> PortResult<usize> {
            let mut map = self.sessions.lock().unwrap();
            let n = map.len();
            map.clear();
            Ok(n)
        }
        async fn purge_idle(&self, cutoff: DateTime<Utc>) -> PortResult<usize> {
            let mut map = self.sessions.lock().unwrap();
            let before = map.len();
            map.retain(|_, s| s.updated_at >= cutoff);
            Ok(before - map.len())
        }
    }

    /// Holds every status update until released, so step callbacks can run in between.
    #[derive(Default)]
    struct PausingStore {
        inner: MapStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SessionStore for PausingStore {
        async fn get(&self, call_id: &str) -> PortResult<Option<CallSession>> {
            self.inner.get(call_id).await
        }
        async fn put(&self, session: CallSession) -> PortResult<()> {
            self.inner.put(session).await
        }
        async fn update_status(
            &self,
            call_id: &str,
            status: CallStatus,
            duration_secs: Option<u32>,
            now: DateTime<Utc>,
        ) -> PortResult<Option<CallSession>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.update_status(call_id, status, duration_secs, now).await
        }
        async fn delete(&self, call_id: &str) -> PortResult<bool> {
            self.inner.delete(call_id).await
        }
        async fn list(&self) -> PortResult<Vec<CallSession>> {
            self.inner.list().await
        }
        async fn clear(&self) -> PortResult<usize> {
            self.inner.clear().await
        }
        async fn purge_idle(&self, cutoff: DateTime<Utc>) -> PortResult<usize> {
            self.inner.purge_idle(cutoff).await
        }
    }

    #[derive(Default)]
    struct FakeDatastore {
        unreachable: bool,
        /// Fails lookups only; writes still succeed.
        lookups_down: AtomicBool,
        subscribers: Vec<SubscriberRecord>,
        ratings: Mutex<Vec<RatingRecord>>,
        events: Mutex<Vec<CallEvent>>,
        lookups: Mutex<usize>,
    }

    impl FakeDatastore {
        fn with_subscriber(identifier: &str, name: &str) -> Self {
            Self {
                subscribers: vec![SubscriberRecord {
                    id: format!("sub-{identifier}"),
                    identifier: identifier.to_string(),
                    display_name: name.to_string(),
                    user_id: Some("user-1".to_string()),
                }],
                ..Default::default()
            }
        }

        fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PersistenceService for FakeDatastore {
        async fn find_subscriber_by_identifier(&self, identifier: &str) -> Lookup<SubscriberRecord> {
            *self.lookups.lock().unwrap() += 1;
            if self.unreachable || self.lookups_down.load(Ordering::SeqCst) {
                return Lookup::Unavailable("connection refused".into());
            }
            match self.subscribers.iter().find(|s| s.identifier == identifier) {
                Some(s) => Lookup::Found(s.clone()),
                None => Lookup::NotFound,
            }
        }
        async fn record_rating(
            &self,
            subscriber: &SubscriberRecord,
            rating: Rating,
            call_id: Option<&str>,
        ) -> PortResult<RatingRecord> {
            if self.unreachable {
                return Err(PortError::Unavailable("connection refused".into()));
            }
            let record = RatingRecord {
                id: format!("rating-{}", self.ratings.lock().unwrap().len() + 1),
                subscriber_id: subscriber.id.clone(),
                subscriber_name: subscriber.display_name.clone(),
                identifier: subscriber.identifier.clone(),
                user_id: subscriber.user_id.clone(),
                call_id: call_id.map(str::to_string),
                rating,
                recorded_at: Utc::now(),
            };
            self.ratings.lock().unwrap().push(record.clone());
            Ok(record)
        }
        async fn append_call_event(&self, event: CallEvent) -> PortResult<()> {
            if self.unreachable {
                return Err(PortError::Unavailable("connection refused".into()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
        async fn list_ratings(&self) -> PortResult<Vec<RatingRecord>> {
            Ok(self.ratings.lock().unwrap().clone())
        }
        async fn list_subscribers(&self) -> PortResult<Vec<SubscriberRecord>> {
            Ok(self.subscribers.clone())
        }
        async fn list_call_events(&self, call_id: &str) -> PortResult<Vec<CallEvent>> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.call_id == call_id)
                .cloned()
                .collect())
        }
        async fn check_health(&self) -> PortResult<()> {
            Ok(())
        }
    }

    fn settings() -> FlowSettings {
        FlowSettings {
            identifier_length: 4,
            ..FlowSettings::default()
        }
    }

    fn flow_with(datastore: Arc<FakeDatastore>) -> (CallFlow, Arc<MapStore>) {
        let store = Arc::new(MapStore::default());
        let flow = CallFlow::new(store.clone(), datastore, settings());
        (flow, store)
    }

    fn call(id: &str) -> CallStart {
        CallStart {
            call_id: id.to_string(),
            from_number: "+1555".to_string(),
            to_number: "+1800".to_string(),
            status: CallStatus::Ringing,
        }
    }

    fn gather_action(reply: &VoiceReply) -> Option<(String, usize)> {
        match reply.gather() {
            Some(Verb::Gather {
                action, num_digits, ..
            }) => Some((action.clone(), *num_digits)),
            _ => None,
        }
    }

    async fn session(store: &MapStore, id: &str) -> CallSession {
        store.get(id).await.unwrap().expect("session exists")
    }

    #[tokio::test]
    async fn full_call_records_every_field_once() {
        let datastore = Arc::new(FakeDatastore::with_subscriber("1002", "Asha"));
        let (flow, store) = flow_with(datastore.clone());

        let reply = flow.start_call(call("CA1")).await.unwrap();
        assert_eq!(reply.spoken()[0], prompts::WELCOME);
        assert_eq!(
            gather_action(&reply),
            Some(("/api/twilio/language-selection".to_string(), 1))
        );

        let reply = flow.select_language("CA1", Some("1")).await.unwrap();
        assert_eq!(
            gather_action(&reply),
            Some(("/api/twilio/house-number".to_string(), 4))
        );

        let reply = flow.enter_identifier("CA1", Some("1002")).await.unwrap();
        assert_eq!(reply.spoken()[0], "Welcome Asha. Your house number is 1 0 0 2.");
        assert_eq!(gather_action(&reply), Some(("/api/twilio/rating".to_string(), 1)));

        let reply = flow.submit_rating("CA1", Some("4")).await.unwrap();
        assert!(reply.ends_call());
        assert_eq!(reply.spoken(), vec![PromptKey::ThankYou.text()]);

        let s = session(&store, "CA1").await;
        assert_eq!(s.step, CallStep::Rated);
        assert_eq!(s.language, Some(Language::English));
        assert_eq!(s.service_identifier.as_deref(), Some("1002"));
        assert_eq!(s.rating.map(|r| r.value()), Some(4));
        assert_eq!(s.rating_label(), Some("very good"));
        assert_eq!(s.from_number, "+1555");

        let ratings = datastore.ratings.lock().unwrap();
        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0].subscriber_id, "sub-1002");
        assert_eq!(ratings[0].call_id.as_deref(), Some("CA1"));

        let kinds: Vec<_> = datastore
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                CallEventKind::CallStarted,
                CallEventKind::LanguageSelected,
                CallEventKind::IdentifierEntered,
                CallEventKind::RatingRecorded,
            ]
        );
    }

    #[tokio::test]
    async fn invalid_input_reprompts_without_touching_fields() {
        let (flow, store) = flow_with(Arc::new(FakeDatastore::default()));
        flow.start_call(call("CA2")).await.unwrap();

        let reply = flow.select_language("CA2", Some("9")).await.unwrap();
        assert_eq!(reply.spoken()[0], prompts::INVALID_SELECTION);
        assert_eq!(
            gather_action(&reply),
            Some(("/api/twilio/language-selection".to_string(), 1))
        );
        assert_eq!(session(&store, "CA2").await.step, CallStep::Started);

        flow.select_language("CA2", Some("2")).await.unwrap();
        let reply = flow.enter_identifier("CA2", Some("12")).await.unwrap();
        assert_eq!(reply.spoken()[0], prompts::invalid_identifier(4));
        let reply = flow.enter_identifier("CA2", Some("12a4")).await.unwrap();
        assert_eq!(
            gather_action(&reply),
            Some(("/api/twilio/house-number".to_string(), 4))
        );
        let s = session(&store, "CA2").await;
        assert_eq!(s.step, CallStep::LanguageSelected);
        assert_eq!(s.language, Some(Language::Hindi));
        assert_eq!(s.service_identifier, None);

        flow.enter_identifier("CA2", Some("5555")).await.unwrap();
        for bad in ["0", "6", "12", "#"] {
            let reply = flow.submit_rating("CA2", Some(bad)).await.unwrap();
            assert_eq!(reply.spoken()[0], prompts::INVALID_RATING);
            assert!(!reply.ends_call());
        }
        let s = session(&store, "CA2").await;
        assert_eq!(s.step, CallStep::IdentifierEntered);
        assert_eq!(s.rating, None);
        assert_eq!(s.service_identifier.as_deref(), Some("5555"));
    }

    #[tokio::test]
    async fn missing_digits_repeat_the_question_silently() {
        let (flow, store) = flow_with(Arc::new(FakeDatastore::default()));
        flow.start_call(call("CA3")).await.unwrap();

        let reply = flow.select_language("CA3", None).await.unwrap();
        assert!(!reply.spoken().contains(&prompts::INVALID_SELECTION));
        assert!(reply.spoken()[0].starts_with("Select language:"));

        flow.select_language("CA3", Some("1")).await.unwrap();
        let reply = flow.enter_identifier("CA3", Some("  ")).await.unwrap();
        assert_eq!(reply.spoken()[0], PromptKey::EnterNumber.text());
        assert_eq!(session(&store, "CA3").await.step, CallStep::LanguageSelected);
    }

    #[tokio::test]
    async fn every_gather_falls_back_to_its_own_step() {
        let (flow, _store) = flow_with(Arc::new(FakeDatastore::default()));
        let reply = flow.start_call(call("CA4")).await.unwrap();
        let last = reply.verbs().last().cloned();
        assert_eq!(
            last,
            Some(Verb::Redirect {
                url: "/api/twilio/language-selection".to_string()
            })
        );
        assert!(reply.spoken().contains(&prompts::NO_INPUT));
    }

    #[tokio::test]
    async fn unreachable_datastore_does_not_change_the_script() {
        let datastore = Arc::new(FakeDatastore::unreachable());
        let (flow, store) = flow_with(datastore.clone());

        flow.start_call(call("CA5")).await.unwrap();
        flow.select_language("CA5", Some("3")).await.unwrap();
        let reply = flow.enter_identifier("CA5", Some("1002")).await.unwrap();
        assert_eq!(reply.spoken()[0], prompts::anonymous_greeting("1002"));
        let reply = flow.submit_rating("CA5", Some("5")).await.unwrap();
        assert!(reply.ends_call());

        let s = session(&store, "CA5").await;
        assert_eq!(s.step, CallStep::Rated);
        assert_eq!(s.language, Some(Language::Tamil));
        assert_eq!(s.service_identifier.as_deref(), Some("1002"));
        assert_eq!(s.rating.map(|r| r.value()), Some(5));
        assert_eq!(s.subscriber_lookup, LookupState::Unavailable);
        // The lookup is retried once when the rating is saved.
        assert_eq!(*datastore.lookups.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_subscriber_creates_no_rating_record() {
        let datastore = Arc::new(FakeDatastore::with_subscriber("1002", "Asha"));
        let (flow, _store) = flow_with(datastore.clone());

        flow.start_call(call("CA6")).await.unwrap();
        flow.select_language("CA6", Some("1")).await.unwrap();
        flow.enter_identifier("CA6", Some("4040")).await.unwrap();
        flow.submit_rating("CA6", Some("2")).await.unwrap();

        assert!(datastore.ratings.lock().unwrap().is_empty());
        assert_eq!(*datastore.lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn out_of_order_callbacks_replay_the_current_step() {
        let datastore = Arc::new(FakeDatastore::with_subscriber("1002", "Asha"));
        let (flow, store) = flow_with(datastore.clone());
        flow.start_call(call("CA7")).await.unwrap();

        // Rating before language: nothing stored, language menu replayed.
        let reply = flow.submit_rating("CA7", Some("5")).await.unwrap();
        assert_eq!(
            gather_action(&reply),
            Some(("/api/twilio/language-selection".to_string(), 1))
        );
        assert_eq!(session(&store, "CA7").await.rating, None);

        flow.select_language("CA7", Some("1")).await.unwrap();
        flow.enter_identifier("CA7", Some("1002")).await.unwrap();
        flow.submit_rating("CA7", Some("3")).await.unwrap();

        // A duplicated rating callback neither re-rates nor writes a second record.
        let reply = flow.submit_rating("CA7", Some("1")).await.unwrap();
        assert!(reply.ends_call());
        assert_eq!(session(&store, "CA7").await.rating.map(|r| r.value()), Some(3));
        assert_eq!(datastore.ratings.lock().unwrap().len(), 1);

        // A repeated entry callback does not reset the session.
        flow.start_call(call("CA7")).await.unwrap();
        assert_eq!(session(&store, "CA7").await.step, CallStep::Rated);
    }

    #[tokio::test]
    async fn callback_for_unknown_call_starts_over() {
        let (flow, store) = flow_with(Arc::new(FakeDatastore::default()));
        let reply = flow.enter_identifier("CA-lost", Some("1234")).await.unwrap();
        assert_eq!(reply.spoken()[0], prompts::WELCOME);
        let s = session(&store, "CA-lost").await;
        assert_eq!(s.step, CallStep::Started);
        assert_eq!(s.service_identifier, None);
    }

    #[tokio::test]
    async fn status_updates_only_touch_status_and_duration() {
        let (flow, store) = flow_with(Arc::new(FakeDatastore::default()));
        flow.start_call(call("CA8")).await.unwrap();
        flow.select_language("CA8", Some("1")).await.unwrap();
        flow.enter_identifier("CA8", Some("1002")).await.unwrap();
        flow.submit_rating("CA8", Some("4")).await.unwrap();

        flow.update_status("CA8", CallStatus::Completed, Some(63))
            .await
            .unwrap();
        let s = session(&store, "CA8").await;
        assert_eq!(s.status, CallStatus::Completed);
        assert_eq!(s.duration_secs, Some(63));
        assert_eq!(s.step, CallStep::Completed);
        assert_eq!(s.rating.map(|r| r.value()), Some(4));

        // Unknown calls are ignored rather than created.
        flow.update_status("CA-none", CallStatus::Busy, None)
            .await
            .unwrap();
        assert!(store.get("CA-none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_callback_racing_the_rating_keeps_the_rating() {
        let store = Arc::new(PausingStore::default());
        let flow = Arc::new(CallFlow::new(
            store.clone(),
            Arc::new(FakeDatastore::default()),
            settings(),
        ));
        flow.start_call(call("CA10")).await.unwrap();
        flow.select_language("CA10", Some("1")).await.unwrap();
        flow.enter_identifier("CA10", Some("1002")).await.unwrap();

        let status_flow = flow.clone();
        let status_update = tokio::spawn(async move {
            status_flow
                .update_status("CA10", CallStatus::InProgress, Some(20))
                .await
                .unwrap();
        });
        store.entered.notified().await;
        flow.submit_rating("CA10", Some("4")).await.unwrap();
        store.release.notify_one();
        status_update.await.unwrap();

        let s = session(&store.inner, "CA10").await;
        assert_eq!(s.step, CallStep::Rated);
        assert_eq!(s.rating.map(|r| r.value()), Some(4));
        assert_eq!(s.status, CallStatus::InProgress);
        assert_eq!(s.duration_secs, Some(20));
    }

    #[tokio::test]
    async fn found_subscriber_is_not_looked_up_again_for_the_rating() {
        let datastore = Arc::new(FakeDatastore::with_subscriber("1002", "Asha"));
        let (flow, store) = flow_with(datastore.clone());
        flow.start_call(call("CA11")).await.unwrap();
        flow.select_language("CA11", Some("1")).await.unwrap();
        flow.enter_identifier("CA11", Some("1002")).await.unwrap();
        assert_eq!(session(&store, "CA11").await.subscriber_name(), Some("Asha"));

        // Lookups fail from here on; the subscriber found earlier still gets the rating.
        datastore.lookups_down.store(true, Ordering::SeqCst);
        flow.submit_rating("CA11", Some("5")).await.unwrap();

        let ratings = datastore.ratings.lock().unwrap();
        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings[0].subscriber_id, "sub-1002");
        assert_eq!(ratings[0].user_id.as_deref(), Some("user-1"));
        assert_eq!(*datastore.lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn prerecorded_prompts_follow_the_chosen_language() {
        let store = Arc::new(MapStore::default());
        let flow = CallFlow::new(
            store,
            Arc::new(FakeDatastore::default()),
            FlowSettings {
                prompt_audio_base_url: Some("https://cdn.example.com/audio".to_string()),
                ..settings()
            },
        );
        flow.start_call(call("CA9")).await.unwrap();
        let reply = flow.select_language("CA9", Some("4")).await.unwrap();

        match reply.gather() {
            Some(Verb::Gather { prompt, .. }) => assert_eq!(
                prompt,
                &vec![Verb::Play {
                    url: "https://cdn.example.com/audio/enterNumber-kannada.mp3".to_string()
                }]
            ),
            other => panic!("expected a gather, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_calls_keep_their_own_fields() {
        let store = Arc::new(MapStore::default());
        let flow = Arc::new(CallFlow::new(
            store.clone(),
            Arc::new(FakeDatastore::default()),
            settings(),
        ));

        let mut handles = Vec::new();
        for n in 0..8u32 {
            let flow = flow.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("CA-{n}");
                let lang = ((n % 4) + 1).to_string();
                let identifier = format!("{:04}", 1000 + n);
                let rating = ((n % 5) + 1).to_string();
                flow.start_call(call(&id)).await.unwrap();
                flow.select_language(&id, Some(&lang)).await.unwrap();
                flow.enter_identifier(&id, Some(&identifier)).await.unwrap();
                flow.submit_rating(&id, Some(&rating)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for n in 0..8u32 {
            let s = session(&store, &format!("CA-{n}")).await;
            assert_eq!(s.service_identifier, Some(format!("{:04}", 1000 + n)));
            assert_eq!(s.rating.map(|r| r.value() as u32), Some((n % 5) + 1));
            assert_eq!(s.language, Some(settings().languages[(n % 4) as usize]));
        }
    }

    #[test]
    fn language_digits_map_to_configured_order() {
        let s = settings();
        assert_eq!(s.language_for_digits("2"), Some(Language::Hindi));
        assert_eq!(s.language_for_digits("0"), None);
        assert_eq!(s.language_for_digits("5"), None);
        assert_eq!(s.language_for_digits("12"), None);
        assert!(s.is_valid_identifier("0042"));
        assert!(!s.is_valid_identifier("004"));
        assert!(!s.is_valid_identifier("00*2"));
    }
}

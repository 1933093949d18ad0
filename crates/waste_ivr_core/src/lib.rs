pub mod domain;
pub mod flow;
pub mod ports;
pub mod prompts;
pub mod stats;
pub mod voice;

pub use domain::{
    CallEvent, CallEventKind, CallSession, CallStatus, CallStep, DomainError, Language,
    LookupState, Rating, RatingRecord, SubscriberRecord,
};
pub use flow::{CallFlow, CallStart, FlowSettings, WebhookRoutes};
pub use ports::{Lookup, PersistenceService, PortError, PortResult, SessionStore};
pub use stats::{CallStats, RatingBucket};
pub use voice::{Verb, VoiceReply};

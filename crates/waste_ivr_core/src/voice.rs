//! crates/waste_ivr_core/src/voice.rs
//!
//! A vendor-neutral description of what the telephony platform should do next:
//! speak, play audio, collect digits, redirect, or hang up.

/// One instruction in a voice reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Say {
        text: String,
        voice: String,
        locale: String,
    },
    Play {
        url: String,
    },
    /// Collects keypad input and posts it to `action`.
    Gather {
        action: String,
        num_digits: usize,
        timeout_secs: u32,
        prompt: Vec<Verb>,
    },
    Redirect {
        url: String,
    },
    Hangup,
}

/// An ordered list of verbs returned for a single webhook callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceReply {
    verbs: Vec<Verb>,
}

impl VoiceReply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, verb: Verb) -> Self {
        self.verbs.push(verb);
        self
    }

    pub fn say(self, text: impl Into<String>, voice: &str, locale: &str) -> Self {
        self.push(Verb::Say {
            text: text.into(),
            voice: voice.to_string(),
            locale: locale.to_string(),
        })
    }

    pub fn redirect(self, url: impl Into<String>) -> Self {
        self.push(Verb::Redirect { url: url.into() })
    }

    pub fn hangup(self) -> Self {
        self.push(Verb::Hangup)
    }

    pub fn verbs(&self) -> &[Verb] {
        &self.verbs
    }

    pub fn ends_call(&self) -> bool {
        self.verbs.iter().any(|v| matches!(v, Verb::Hangup))
    }

    /// The first digit collection in the reply, if any.
    pub fn gather(&self) -> Option<&Verb> {
        self.verbs.iter().find(|v| matches!(v, Verb::Gather { .. }))
    }

    /// Every spoken sentence in order, including those nested inside a gather.
    pub fn spoken(&self) -> Vec<&str> {
        fn walk<'a>(verbs: &'a [Verb], out: &mut Vec<&'a str>) {
            for verb in verbs {
                match verb {
                    Verb::Say { text, .. } => out.push(text),
                    Verb::Gather { prompt, .. } => walk(prompt, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.verbs, &mut out);
        out
    }
}

//! services/api/src/web/twiml.rs
//!
//! Renders a `VoiceReply` as TwiML, the XML dialect the telephony platform
//! expects in response to a voice webhook.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::fmt::Write;
use waste_ivr_core::voice::{Verb, VoiceReply};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// A rendered TwiML document together with the HTTP status to send it with.
#[derive(Debug)]
pub struct Twiml {
    pub status: StatusCode,
    pub body: String,
}

impl Twiml {
    pub fn ok(reply: &VoiceReply) -> Self {
        Self {
            status: StatusCode::OK,
            body: render(reply),
        }
    }
}

impl IntoResponse for Twiml {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
            self.body,
        )
            .into_response()
    }
}

pub fn render(reply: &VoiceReply) -> String {
    let mut out = String::from(XML_DECLARATION);
    out.push_str("<Response>");
    for verb in reply.verbs() {
        render_verb(&mut out, verb);
    }
    out.push_str("</Response>");
    out
}

fn render_verb(out: &mut String, verb: &Verb) {
    // Writing into a String cannot fail.
    let _ = match verb {
        Verb::Say {
            text,
            voice,
            locale,
        } => write!(
            out,
            r#"<Say voice="{}" language="{}">{}</Say>"#,
            escape(voice),
            escape(locale),
            escape(text)
        ),
        Verb::Play { url } => write!(out, "<Play>{}</Play>", escape(url)),
        Verb::Gather {
            action,
            num_digits,
            timeout_secs,
            prompt,
        } => {
            let _ = write!(
                out,
                r#"<Gather input="dtmf" action="{}" method="POST" numDigits="{}" timeout="{}">"#,
                escape(action),
                num_digits,
                timeout_secs
            );
            for inner in prompt {
                render_verb(out, inner);
            }
            write!(out, "</Gather>")
        }
        Verb::Redirect { url } => write!(out, r#"<Redirect method="POST">{}</Redirect>"#, escape(url)),
        Verb::Hangup => write!(out, "<Hangup/>"),
    };
}

fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

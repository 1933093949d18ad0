//! crates/waste_ivr_core/src/prompts.rs
//!
//! The fixed sentences of the feedback line.

use crate::domain::Language;

pub const WELCOME: &str =
    "Welcome to Waste Management Services. Please listen carefully to the following questions.";
pub const NO_INPUT: &str = "We didn't receive any input. Please try again.";
pub const INVALID_SELECTION: &str = "Invalid selection. Please try again.";
pub const INVALID_RATING: &str = "Invalid rating. Please try again.";
pub const APOLOGY: &str = "Sorry, an error occurred. Please try again later.";

/// Prompts that exist once per language, either spoken or prerecorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKey {
    EnterNumber,
    RatingPrompt,
    ThankYou,
}

impl PromptKey {
    pub fn text(&self) -> &'static str {
        match self {
            PromptKey::EnterNumber => "Please enter your waste management number using the keypad.",
            PromptKey::RatingPrompt => {
                "Please rate our waste management service. Press 1 for poor, 2 for fair, 3 for good, 4 for very good, or 5 for excellent."
            }
            PromptKey::ThankYou => {
                "Thank you for your feedback. Your rating has been recorded. Have a great day!"
            }
        }
    }

    /// Stem of the prerecorded file, e.g. `ratingPrompt` in `ratingPrompt-hindi.mp3`.
    pub fn file_stem(&self) -> &'static str {
        match self {
            PromptKey::EnterNumber => "enterNumber",
            PromptKey::RatingPrompt => "ratingPrompt",
            PromptKey::ThankYou => "thankYou",
        }
    }

    pub fn audio_url(&self, base_url: &str, language: Language) -> String {
        format!(
            "{}/{}-{}.mp3",
            base_url.trim_end_matches('/'),
            self.file_stem(),
            language.key()
        )
    }
}

/// "Select language: Press 1 for English, 2 for Hindi."
pub fn language_menu(languages: &[Language]) -> String {
    let mut text = String::from("Select language:");
    for (index, language) in languages.iter().enumerate() {
        if index == 0 {
            text.push_str(&format!(" Press {} for {}", index + 1, language.name()));
        } else {
            text.push_str(&format!(", {} for {}", index + 1, language.name()));
        }
    }
    text.push('.');
    text
}

pub fn invalid_identifier(length: usize) -> String {
    format!("Invalid number. Please enter your {length}-digit waste management number.")
}

pub fn subscriber_greeting(name: &str, identifier: &str) -> String {
    format!("Welcome {}. Your house number is {}.", name, spell_digits(identifier))
}

pub fn anonymous_greeting(identifier: &str) -> String {
    format!(
        "Thank you for calling. Your waste management number is {}.",
        spell_digits(identifier)
    )
}

/// Separates digits so text-to-speech reads "1 0 0 2" instead of "one thousand two".
pub fn spell_digits(digits: &str) -> String {
    digits
        .chars()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_menu_lists_configured_languages_in_order() {
        let menu = language_menu(&[
            Language::English,
            Language::Hindi,
            Language::Tamil,
            Language::Kannada,
        ]);
        assert_eq!(
            menu,
            "Select language: Press 1 for English, 2 for Hindi, 3 for Tamil, 4 for Kannada."
        );
        assert_eq!(language_menu(&[Language::French]), "Select language: Press 1 for French.");
    }

    #[test]
    fn audio_url_joins_base_stem_and_language() {
        assert_eq!(
            PromptKey::ThankYou.audio_url("https://cdn.example.com/audio/", Language::Tamil),
            "https://cdn.example.com/audio/thankYou-tamil.mp3"
        );
    }

    #[test]
    fn greetings_spell_out_the_identifier() {
        assert_eq!(
            subscriber_greeting("Asha", "1002"),
            "Welcome Asha. Your house number is 1 0 0 2."
        );
        assert!(anonymous_greeting("77").ends_with("is 7 7."));
    }
}

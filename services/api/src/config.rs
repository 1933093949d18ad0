//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use waste_ivr_core::{FlowSettings, Language, WebhookRoutes};

/// Treated as "no key configured"; it is the value shipped in the sample env file.
const PLACEHOLDER_API_KEY: &str = "your_appwrite_api_key";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Connection settings for the hosted document database.
#[derive(Clone, Debug)]
pub struct AppwriteConfig {
    pub endpoint: String,
    pub project_id: String,
    pub api_key: String,
    pub database_id: String,
    pub user_house_collection_id: String,
    pub leaderboard_ratings_collection_id: String,
    pub call_events_collection_id: Option<String>,
}

/// Where sessions, subscribers and ratings live.
#[derive(Clone, Debug)]
pub enum StorageBackend {
    /// Everything in process memory.
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
    /// Subscribers and ratings in Appwrite; sessions stay in memory.
    Appwrite(AppwriteConfig),
    /// Appwrite was requested without usable credentials. Calls are still
    /// answered but nothing is looked up or saved.
    Disabled { reason: String },
}

impl StorageBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Postgres { .. } => "postgres",
            StorageBackend::Appwrite(_) => "appwrite",
            StorageBackend::Disabled { .. } => "disabled",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub storage: StorageBackend,
    /// JSON file of subscribers loaded at startup by the memory and postgres backends.
    pub subscriber_seed_path: Option<PathBuf>,
    pub flow: FlowSettings,
    pub webhook_base_path: String,
    pub persistence_timeout: Duration,
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    pub admin_token: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // --- Load Server Settings ---
        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let mut bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;
        if let Some(port) = var("PORT") {
            let port = parse_value::<u16>("PORT", &port)?;
            bind_address.set_port(port);
        }

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Storage Settings ---
        let backend = var("STORAGE_BACKEND").unwrap_or_else(|| "memory".to_string());
        let storage = match backend.to_ascii_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "postgres" => StorageBackend::Postgres {
                database_url: var("DATABASE_URL")
                    .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?,
                max_connections: optional_value("DATABASE_MAX_CONNECTIONS", var("DATABASE_MAX_CONNECTIONS"), 5)?,
            },
            "appwrite" => {
                let api_key = var("APPWRITE_API_KEY").filter(|key| key != PLACEHOLDER_API_KEY);
                let project_id = var("APPWRITE_PROJECT_ID");
                match (api_key, project_id) {
                    (Some(api_key), Some(project_id)) => StorageBackend::Appwrite(AppwriteConfig {
                        endpoint: var("APPWRITE_ENDPOINT")
                            .ok_or_else(|| ConfigError::MissingVar("APPWRITE_ENDPOINT".to_string()))?,
                        project_id,
                        api_key,
                        database_id: var("APPWRITE_DATABASE_ID")
                            .unwrap_or_else(|| "ivr_database".to_string()),
                        user_house_collection_id: var("APPWRITE_USER_HOUSE_COLLECTION_ID")
                            .unwrap_or_else(|| "user-house".to_string()),
                        leaderboard_ratings_collection_id: var(
                            "APPWRITE_LEADERBOARD_RATINGS_COLLECTION_ID",
                        )
                        .unwrap_or_else(|| "leaderboard_ratings".to_string()),
                        call_events_collection_id: var("APPWRITE_CALL_EVENTS_COLLECTION_ID"),
                    }),
                    (None, _) => StorageBackend::Disabled {
                        reason: "APPWRITE_API_KEY is not set".to_string(),
                    },
                    (_, None) => StorageBackend::Disabled {
                        reason: "APPWRITE_PROJECT_ID is not set".to_string(),
                    },
                }
            }
            other => {
                return Err(ConfigError::InvalidValue(
                    "STORAGE_BACKEND".to_string(),
                    format!("'{}' is not one of memory, postgres, appwrite", other),
                ))
            }
        };

        // --- Load Call Flow Settings ---
        let defaults = FlowSettings::default();
        let languages = match var("IVR_LANGUAGES") {
            Some(list) => parse_languages(&list)?,
            None => defaults.languages,
        };
        let identifier_length: usize =
            optional_value("IDENTIFIER_LENGTH", var("IDENTIFIER_LENGTH"), defaults.identifier_length)?;
        if identifier_length == 0 {
            return Err(ConfigError::InvalidValue(
                "IDENTIFIER_LENGTH".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let webhook_base_path = var("WEBHOOK_BASE_PATH").unwrap_or_else(|| "/api/twilio".to_string());
        if !webhook_base_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_BASE_PATH".to_string(),
                "must start with '/'".to_string(),
            ));
        }
        let webhook_base_path = webhook_base_path.trim_end_matches('/').to_string();

        let flow = FlowSettings {
            languages,
            identifier_length,
            language_timeout_secs: optional_value(
                "LANGUAGE_TIMEOUT_SECS",
                var("LANGUAGE_TIMEOUT_SECS"),
                defaults.language_timeout_secs,
            )?,
            identifier_timeout_secs: optional_value(
                "IDENTIFIER_TIMEOUT_SECS",
                var("IDENTIFIER_TIMEOUT_SECS"),
                defaults.identifier_timeout_secs,
            )?,
            rating_timeout_secs: optional_value(
                "RATING_TIMEOUT_SECS",
                var("RATING_TIMEOUT_SECS"),
                defaults.rating_timeout_secs,
            )?,
            voice: var("TTS_VOICE").unwrap_or(defaults.voice),
            prompt_audio_base_url: var("PROMPT_AUDIO_BASE_URL"),
            routes: WebhookRoutes::under(&webhook_base_path),
        };

        // --- Load Runtime Settings ---
        let persistence_timeout = Duration::from_millis(optional_value(
            "PERSISTENCE_TIMEOUT_MS",
            var("PERSISTENCE_TIMEOUT_MS"),
            3000,
        )?);
        let session_ttl =
            Duration::from_secs(optional_value("SESSION_TTL_SECS", var("SESSION_TTL_SECS"), 3600)?);
        let session_sweep_interval = Duration::from_secs(optional_value(
            "SESSION_SWEEP_INTERVAL_SECS",
            var("SESSION_SWEEP_INTERVAL_SECS"),
            300,
        )?);
        if session_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SESSION_SWEEP_INTERVAL_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            log_level,
            storage,
            subscriber_seed_path: var("SUBSCRIBER_SEED_PATH").map(PathBuf::from),
            flow,
            webhook_base_path,
            persistence_timeout,
            session_ttl,
            session_sweep_interval,
            admin_token: var("ADMIN_TOKEN"),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("'{}': {}", raw, e)))
}

fn optional_value<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// Parses a comma-separated, ordered language list such as `english,hindi`.
fn parse_languages(list: &str) -> Result<Vec<Language>, ConfigError> {
    let mut languages = Vec::new();
    for key in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        let language = parse_value::<Language>("IVR_LANGUAGES", key)?;
        if languages.contains(&language) {
            return Err(ConfigError::InvalidValue(
                "IVR_LANGUAGES".to_string(),
                format!("'{}' is listed twice", key),
            ));
        }
        languages.push(language);
    }
    // Selection is a single keypad digit.
    if languages.is_empty() || languages.len() > 9 {
        return Err(ConfigError::InvalidValue(
            "IVR_LANGUAGES".to_string(),
            "must list between 1 and 9 languages".to_string(),
        ));
    }
    Ok(languages)
}

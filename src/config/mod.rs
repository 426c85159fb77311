use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub ws_path: String,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
    /// Body sent with every 429 answer.
    pub rate_limit_message: Value,
    /// Take the caller address from `X-Real-IP` / `X-Forwarded-For`.
    pub trust_proxy: bool,
    /// Token subjects allowed to push through `POST /realtime/notify`.
    pub notify_subjects: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let jwt_secret = optional("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let jwt_expiration = optional("JWT_EXPIRATION")
            .map(|v| {
                v.trim_end_matches('h')
                    .parse::<u64>()
                    .map_err(|_| ConfigError::Invalid {
                        name: "JWT_EXPIRATION",
                        value: v.clone(),
                    })
            })
            .transpose()?
            .unwrap_or(24);

        Ok(Config {
            server_host: optional("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            server_port: parse_or("SERVER_PORT", 3000)?,
            api_base_uri: optional("API_BASE_URI").unwrap_or_else(|| "/api".into()),
            ws_path: optional("WS_PATH").unwrap_or_else(|| "/ws".into()),
            jwt_secret,
            jwt_expiration_secs: jwt_expiration * 3600,
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            rate_limit_window_ms: parse_or("RATE_LIMIT_WINDOW_MS", 60_000)?,
            rate_limit_max: parse_or("RATE_LIMIT_MAX", 100)?,
            rate_limit_message: optional("RATE_LIMIT_MESSAGE")
                .map(|raw| parse_message(&raw))
                .unwrap_or_else(default_rate_limit_message),
            trust_proxy: parse_or("TRUST_PROXY", false)?,
            notify_subjects: optional("NOTIFY_SUBJECTS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
        })
    }

    /// Defaults for everything except the token secret. No database or Redis.
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Config {
            server_host: "127.0.0.1".into(),
            server_port: 3000,
            api_base_uri: "/api".into(),
            ws_path: "/ws".into(),
            jwt_secret: jwt_secret.into(),
            jwt_expiration_secs: 24 * 3600,
            database_url: None,
            redis_url: None,
            rate_limit_window_ms: 60_000,
            rate_limit_max: 100,
            rate_limit_message: default_rate_limit_message(),
            trust_proxy: false,
            notify_subjects: Vec::new(),
        }
    }

    pub fn jwt_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn may_notify(&self, subject: &str) -> bool {
        self.notify_subjects.iter().any(|s| s == subject)
    }
}

pub fn default_rate_limit_message() -> Value {
    json!({ "error": "Too many requests, please try again later." })
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

// JSON when it parses, plain text otherwise.
fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

//! Channel configuration.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::backoff::BackoffPolicy;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported URL scheme: {0} (expected ws or wss)")]
    UnsupportedScheme(String),
    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),
    #[error("Keep-alive interval must be greater than zero")]
    InvalidKeepAlive,
    #[error("Connect timeout must be greater than zero")]
    InvalidConnectTimeout,
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Settings for one real-time channel.
///
/// Durations are stored in milliseconds so the struct maps directly onto
/// JSON/TOML configuration files; the accessor methods return `Duration`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Credential appended to the URL as a query parameter.
    pub token: Option<String>,
    /// Query parameter name carrying `token`.
    pub token_param: String,
    /// Name sent in the `connect` announcement.
    pub client_name: String,
    /// Initial retry latency.
    pub base_delay_ms: u64,
    /// Ceiling for any single retry delay.
    pub max_delay_ms: u64,
    /// Retries before giving up; `0` retries indefinitely.
    pub max_attempts: u32,
    pub keep_alive_interval_ms: u64,
    /// Close the link when a ping goes unanswered this long. Unset keeps
    /// keep-alive advisory and leaves liveness to the transport.
    pub pong_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".to_string(),
            token: None,
            token_param: "token".to_string(),
            client_name: "pulsewire".to_string(),
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            keep_alive_interval_ms: 30_000,
            pong_timeout_ms: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_param", &self.token_param)
            .field("client_name", &self.client_name)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("max_attempts", &self.max_attempts)
            .field("keep_alive_interval_ms", &self.keep_alive_interval_ms)
            .field("pong_timeout_ms", &self.pong_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl ChannelConfig {
    /// Defaults pointed at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read overrides from `PULSEWIRE_*` environment variables on top of
    /// the defaults.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("PULSEWIRE_URL") {
            config.url = url;
        }
        if let Ok(token) = std::env::var("PULSEWIRE_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }
        if let Some(v) = env_number("PULSEWIRE_MAX_ATTEMPTS")? {
            config.max_attempts = u32::try_from(v).map_err(|_| ConfigError::InvalidEnv {
                var: "PULSEWIRE_MAX_ATTEMPTS",
                value: v.to_string(),
            })?;
        }
        if let Some(v) = env_number("PULSEWIRE_BASE_DELAY_MS")? {
            config.base_delay_ms = v;
        }
        if let Some(v) = env_number("PULSEWIRE_MAX_DELAY_MS")? {
            config.max_delay_ms = v;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Set the retry schedule.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration, max_attempts: u32) -> Self {
        self.base_delay_ms = millis(base);
        self.max_delay_ms = millis(max);
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval_ms = millis(interval);
        self
    }

    #[must_use]
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout_ms = Some(millis(timeout));
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = millis(timeout);
        self
    }

    #[must_use]
    pub const fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }

    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    #[must_use]
    pub fn pong_timeout(&self) -> Option<Duration> {
        self.pong_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the settings for values the channel cannot run with.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidBackoff(
                "base delay must be greater than zero".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidBackoff(format!(
                "max delay {}ms is below base delay {}ms",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(ConfigError::InvalidKeepAlive);
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConnectTimeout);
        }
        Ok(())
    }

    /// Connection URL with the credential token attached, if any.
    ///
    /// # Errors
    /// Returns error if the base URL does not parse or is not `ws`/`wss`.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair(&self.token_param, token);
        }
        Ok(url)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn env_number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

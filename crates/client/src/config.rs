//! Client configuration.

use std::time::Duration;

use crate::error::RoomFeedError;

const DEFAULT_WS_URL: &str = "ws://localhost:8080/api/ws";

/// Configuration for auto-reconnect behavior.
///
/// The connection loop retries forever while a session is referenced; only
/// the delay between attempts is configurable.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let exponent = attempt.min(64) as i32;
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(exponent);
        (delay as u32).min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_for_attempt(attempt) as u64)
    }
}

/// Settings shared by every session the process opens.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub ws_url: String,
    pub reconnect: ReconnectConfig,
    /// Default for [`FeedOptions::optimistic_send`](crate::feed::FeedOptions).
    pub optimistic_send: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WS_URL)
    }
}

impl ClientConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnect: ReconnectConfig::default(),
            optimistic_send: false,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_optimistic_send(mut self, optimistic_send: bool) -> Self {
        self.optimistic_send = optimistic_send;
        self
    }

    /// Read configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ROOMFEED_WS_URL`: WebSocket endpoint (default: "ws://localhost:8080/api/ws")
    /// - `ROOMFEED_RECONNECT_INITIAL_MS`: first backoff delay (default: 1000)
    /// - `ROOMFEED_RECONNECT_MAX_MS`: backoff cap (default: 30000)
    /// - `ROOMFEED_OPTIMISTIC_SEND`: "true" | "false" (default: "false")
    pub fn from_env() -> Result<Self, RoomFeedError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RoomFeedError> {
        let mut config =
            Self::new(lookup("ROOMFEED_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string()));

        if let Some(raw) = lookup("ROOMFEED_RECONNECT_INITIAL_MS") {
            config.reconnect.initial_delay_ms = parse_number("ROOMFEED_RECONNECT_INITIAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("ROOMFEED_RECONNECT_MAX_MS") {
            config.reconnect.max_delay_ms = parse_number("ROOMFEED_RECONNECT_MAX_MS", &raw)?;
        }
        if let Some(raw) = lookup("ROOMFEED_OPTIMISTIC_SEND") {
            config.optimistic_send = match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(RoomFeedError::InvalidConfig(format!(
                        "ROOMFEED_OPTIMISTIC_SEND: expected a boolean, got `{}`",
                        other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RoomFeedError> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| RoomFeedError::InvalidConfig(format!("ws_url: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RoomFeedError::InvalidConfig(format!(
                "ws_url: unsupported scheme `{}`",
                url.scheme()
            )));
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(RoomFeedError::InvalidConfig(
                "reconnect delays must satisfy 0 < initial <= max".to_string(),
            ));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(RoomFeedError::InvalidConfig(
                "reconnect backoff multiplier must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u32, RoomFeedError> {
    raw.trim()
        .parse()
        .map_err(|_| RoomFeedError::InvalidConfig(format!("{}: expected a number, got `{}`", key, raw)))
}

//! Relay configuration from environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{bail, Context};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// Accepted bearer tokens and the author id each one signs in as.
    pub tokens: HashMap<String, String>,
    /// Messages kept per conversation for `room:fetchRecent`.
    pub history_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tokens: HashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ROOMFEED_RELAY_ADDR`: listen address (default: "0.0.0.0:8080")
    /// - `ROOMFEED_RELAY_TOKENS`: "token=author,token=author"
    /// - `ROOMFEED_HISTORY_LIMIT`: messages kept per conversation (default: 100)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let addr = lookup("ROOMFEED_RELAY_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr
            .parse()
            .with_context(|| format!("ROOMFEED_RELAY_ADDR is not a socket address: {}", addr))?;

        let tokens = match lookup("ROOMFEED_RELAY_TOKENS") {
            Some(raw) => parse_tokens(&raw)?,
            None => HashMap::new(),
        };

        let history_limit = match lookup("ROOMFEED_HISTORY_LIMIT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("ROOMFEED_HISTORY_LIMIT is not a number: {}", raw))?,
            None => DEFAULT_HISTORY_LIMIT,
        };

        Ok(Self {
            addr,
            tokens,
            history_limit,
        })
    }
}

fn parse_tokens(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((token, author)) = entry.split_once('=') else {
            bail!("token entry without '=': {}", entry);
        };
        let (token, author) = (token.trim(), author.trim());
        if token.is_empty() || author.is_empty() {
            bail!("token entry with an empty side: {}", entry);
        }
        tokens.insert(token.to_string(), author.to_string());
    }
    Ok(tokens)
}

// Logging defaults follow the build profile; release builds stay quiet.

use crate::error::{ParleyError, ParleyResult};
use crate::peer::types::ServerConfig;
use serde::Deserialize;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence the default subscriber in debug builds.
    // Only honoured by debug builds.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RETENTION_MS: u64 = 30 * 60 * 1_000;
pub const DEFAULT_HISTORY_CAP: usize = 50;

const GOOGLE_STUN_POOL: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Per-session tunables. Relay servers are handed to the negotiation
/// object untouched apart from scheme normalisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub retention_ms: u64,
    pub history_cap: usize,
    pub ice_servers: Vec<ServerConfig>,
    /// Base URL of the HTTP signaling store, when one is used.
    pub signal_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retention_ms: DEFAULT_RETENTION_MS,
            history_cap: DEFAULT_HISTORY_CAP,
            ice_servers: default_ice_servers(),
            signal_url: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `PARLEY_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("PARLEY_CONNECT_TIMEOUT_SECS") {
            config.set_connect_timeout_secs(secs);
        }
        if let Some(ms) = env_u64("PARLEY_POLL_INTERVAL_MS") {
            config.poll_interval_ms = ms;
        }
        if let Ok(url) = std::env::var("PARLEY_SIGNAL_URL") {
            if !url.trim().is_empty() {
                config.signal_url = Some(url);
            }
        }
        config
    }

    /// Whole-second timeout; absurdly large values clamp instead of wrapping.
    pub fn set_connect_timeout_secs(&mut self, secs: u64) {
        self.connect_timeout_ms = secs.saturating_mul(1_000);
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn validate(&self) -> ParleyResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ParleyError::Config("poll interval must be non-zero".into()));
        }
        if self.history_cap == 0 {
            return Err(ParleyError::Config("history cap must be non-zero".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ParleyError::Config(format!(
                    "server {} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ParleyError::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    GOOGLE_STUN_POOL
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{i}"),
            r#type: "stun".into(),
            url: (*url).into(),
            username: None,
            credential: None,
        })
        .collect()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

//! Relay configuration.
//!
//! Only the listening port is read from the environment (`PORT`); everything
//! else is set programmatically and keeps its default in the shipped binary.

use std::time::Duration;

use crate::error::{RelayError, Result};

/// Port used when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 1234;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per member before it is evicted
    pub outbound_capacity: usize,
    /// Upper bound on a single socket write to a member
    pub send_timeout: Duration,
    /// Upper bound on answering one HTTP request, upgrade response included
    pub handshake_timeout: Duration,
    /// Body returned to plain HTTP requests
    pub health_body: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            outbound_capacity: 256,
            send_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            health_body: "y-websocket server running".to_string(),
        }
    }
}

impl RelayConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|e| RelayError::Config(format!("PORT={raw:?}: {e}")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            bind_addr: format!("0.0.0.0:{port}"),
            ..Self::default()
        })
    }

    /// Port component of `bind_addr`, if it has one.
    pub fn port(&self) -> Option<u16> {
        self.bind_addr.rsplit_once(':')?.1.parse().ok()
    }
}

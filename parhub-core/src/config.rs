//! Hub configuration
//!
//! Defaults mirror a single-host deployment; every field can be overridden
//! from the environment.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::{DEFAULT_HEARTBEAT_INTERVAL_MS, MIN_REGISTRATION_TIMEOUT_MS};

/// Configuration for a hub instance
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interface the hub binds to
    pub ip: String,
    /// Transport scheme used in advertised addresses
    pub transport: String,
    /// First port handed out by the port pool
    pub start_port: u16,
    /// Time between heartbeat pings
    pub heartbeat_interval: Duration,
    /// Explicit registration timeout; derived from the interval when unset
    pub registration_timeout: Option<Duration>,
    /// Delay between acknowledging a shutdown request and stopping
    pub shutdown_delay: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            transport: "tcp".to_string(),
            start_port: 5000,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            registration_timeout: None,
            shutdown_delay: Duration::from_millis(1000),
        }
    }
}

impl HubConfig {
    /// Defaults overridden by `PARHUB_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(ip) = env::var("PARHUB_IP") {
            config.ip = ip;
        }
        if let Ok(transport) = env::var("PARHUB_TRANSPORT") {
            config.transport = transport;
        }
        if let Some(port) = parse_var::<u16>("PARHUB_PORT") {
            config.start_port = port;
        }
        if let Some(ms) = parse_var::<u64>("PARHUB_HEARTBEAT_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("PARHUB_REGISTRATION_TIMEOUT_MS") {
            config.registration_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>("PARHUB_SHUTDOWN_DELAY_MS") {
            config.shutdown_delay = Duration::from_millis(ms);
        }
        config
    }

    /// How long a pending registration waits for its heart
    pub fn registration_timeout(&self) -> Duration {
        self.registration_timeout.unwrap_or_else(|| {
            Duration::from_millis(MIN_REGISTRATION_TIMEOUT_MS).max(self.heartbeat_interval * 2)
        })
    }

    /// `{transport}://{ip}:{port}`
    pub fn address(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={}: not a valid value", key, raw);
            None
        }
    }
}

/// Hands out consecutive ports
#[derive(Debug, Clone)]
pub struct PortPool {
    next: u16,
}

impl PortPool {
    pub fn new(start: u16) -> Self {
        Self { next: start }
    }

    pub fn get(&mut self) -> u16 {
        let port = self.next;
        self.next = self.next.wrapping_add(1);
        port
    }

    pub fn pair(&mut self) -> [u16; 2] {
        [self.get(), self.get()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_timeout_floor() {
        let mut config = HubConfig::default();
        assert_eq!(config.registration_timeout(), Duration::from_millis(5000));

        config.heartbeat_interval = Duration::from_millis(4000);
        assert_eq!(config.registration_timeout(), Duration::from_millis(8000));

        config.registration_timeout = Some(Duration::from_millis(300));
        assert_eq!(config.registration_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_port_pool_is_consecutive() {
        let mut pool = PortPool::new(10101);
        assert_eq!(pool.pair(), [10101, 10102]);
        assert_eq!(pool.get(), 10103);
        assert_eq!(pool.pair(), [10104, 10105]);
    }

    #[test]
    fn test_address_format() {
        let config = HubConfig::default();
        assert_eq!(config.address(5001), "tcp://127.0.0.1:5001");
    }
}

//! Server configuration.

use std::net::SocketAddr;

/// Default bind address.
pub const DEFAULT_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 3030);
/// Default capacity of each room's broadcast channel.
pub const CHANNEL_CAPACITY: usize = 256;
/// Default number of operation records returned by the history endpoint.
pub const MAX_ROOM_HISTORY: usize = 100;

/// Runtime settings for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Frames buffered per room before slow receivers start lagging.
    pub channel_capacity: usize,
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(DEFAULT_ADDR),
            channel_capacity: CHANNEL_CAPACITY,
            history_limit: MAX_ROOM_HISTORY,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SHAREDRAW_ADDR`, `SHAREDRAW_CHANNEL_CAPACITY`
    /// and `SHAREDRAW_HISTORY_LIMIT`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = parse_var(&lookup, "SHAREDRAW_ADDR") {
            config.addr = addr;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "SHAREDRAW_CHANNEL_CAPACITY") {
            config.channel_capacity = capacity.max(1);
        }
        if let Some(limit) = parse_var(&lookup, "SHAREDRAW_HISTORY_LIMIT") {
            config.history_limit = limit;
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

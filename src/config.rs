//! Tunable configuration (§10.1). Built with plain `Default` plus setters --
//! no `serde`, since nothing here is persisted as structured config, only
//! as the flat bootstrap file handled by [`crate::peerstore`].

use crate::query::{MAX_QUERY_AGE, MIN_QUERY_AGE};
use crate::routing::{BUCKET_STALE_PERIOD, SEND_REFRESH_PERIOD};
use std::net::SocketAddr;
use std::time::Duration;

/// Outbound rate class (§4.7, "Outbound budget"): messages allowed per
/// `iteration()` tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    High,
    Medium,
    Low,
    Trickle,
}

impl RateClass {
    pub fn max_msgs(self) -> usize {
        match self {
            RateClass::High => 100,
            RateClass::Medium => 50,
            RateClass::Low => 20,
            RateClass::Trickle => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub k: usize,
    pub bucket_stale_period: Duration,
    pub send_refresh_period: Duration,
    pub min_query_age: Duration,
    pub max_query_age: Duration,
    pub expected_reply_window: Duration,
    pub max_startup_time: Duration,
    pub max_refresh_time: Duration,
    pub rate_class: RateClass,
    pub bootstrap_path: Option<std::path::PathBuf>,
    pub peer_store_capacity: usize,
    pub dht_version: String,
    pub bind_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            k: crate::routing::K,
            bucket_stale_period: BUCKET_STALE_PERIOD,
            send_refresh_period: SEND_REFRESH_PERIOD,
            min_query_age: MIN_QUERY_AGE,
            max_query_age: MAX_QUERY_AGE,
            expected_reply_window: crate::query::EXPECTED_REPLY_WINDOW,
            max_startup_time: Duration::from_secs(10),
            max_refresh_time: Duration::from_secs(10 * 60),
            rate_class: RateClass::Medium,
            bootstrap_path: None,
            peer_store_capacity: 500,
            dht_version: "BD01".to_string(),
            bind_addr: "0.0.0.0:6775".parse().unwrap(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_bootstrap_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.bootstrap_path = Some(path.into());
        self
    }

    pub fn with_rate_class(mut self, rate_class: RateClass) -> Self {
        self.rate_class = rate_class;
        self
    }
}

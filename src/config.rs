//! Application Configuration
//!
//! All knobs come from the environment; `.env` is loaded by main before
//! this module reads anything.

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP/WebSocket listen port
    pub port: u16,
    /// External store host (Redis mirror); empty disables the mirror
    pub store_host: String,
    pub store_port: u16,
    pub store_password: Option<String>,
    /// When true, do not wipe mirrored order/book keys at startup
    pub no_clear_data: bool,
    /// Matching engine periodic tick interval
    pub match_tick_ms: u64,
    /// Orderbook snapshot broadcast interval
    pub snapshot_ms: u64,
    /// Latency heartbeat interval
    pub latency_ms: u64,
    /// Maker/taker fee rates; zero by default
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            store_host: String::new(),
            store_port: 6379,
            store_password: None,
            no_clear_data: false,
            match_tick_ms: 100,
            snapshot_ms: 100,
            latency_ms: 5000,
            maker_fee_rate: Decimal::ZERO,
            taker_fee_rate: Decimal::ZERO,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parse_env("OES_PORT", defaults.port),
            store_host: env::var("STORE_HOST").unwrap_or_default(),
            store_port: parse_env("STORE_PORT", defaults.store_port),
            store_password: env::var("STORE_PASSWORD").ok().filter(|p| !p.is_empty()),
            no_clear_data: env::var("OES_NO_CLEAR_DATA").map(|v| v == "1").unwrap_or(false),
            match_tick_ms: parse_env("OES_MATCH_TICK_MS", defaults.match_tick_ms),
            snapshot_ms: parse_env("OES_SNAPSHOT_MS", defaults.snapshot_ms),
            latency_ms: parse_env("OES_LATENCY_MS", defaults.latency_ms),
            maker_fee_rate: parse_env("OES_MAKER_FEE_RATE", defaults.maker_fee_rate),
            taker_fee_rate: parse_env("OES_TAKER_FEE_RATE", defaults.taker_fee_rate),
        }
    }

    /// Whether an external store mirror is configured.
    pub fn mirror_enabled(&self) -> bool {
        !self.store_host.is_empty()
    }

    /// Connection URL for the external store.
    pub fn store_url(&self) -> String {
        match &self.store_password {
            Some(password) => format!("redis://:{}@{}:{}", password, self.store_host, self.store_port),
            None => format!("redis://{}:{}", self.store_host, self.store_port),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.match_tick_ms, 100);
        assert_eq!(config.snapshot_ms, 100);
        assert_eq!(config.latency_ms, 5000);
        assert!(!config.mirror_enabled());
        assert_eq!(config.maker_fee_rate, Decimal::ZERO);
    }

    #[test]
    fn test_store_url() {
        let mut config = AppConfig::default();
        config.store_host = "10.0.0.5".to_string();
        assert_eq!(config.store_url(), "redis://10.0.0.5:6379");

        config.store_password = Some("hunter2".to_string());
        assert_eq!(config.store_url(), "redis://:hunter2@10.0.0.5:6379");
    }
}

//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use inventory_store::DEFAULT_LOCK_TIMEOUT;
use reservation::{ReconcilerConfig, ReservationConfig};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset runs on the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `LOCK_TIMEOUT_MS`: ledger entry lock wait (default: `2000`)
/// - `RESERVE_MAX_ATTEMPTS`, `RESERVE_RETRY_BASE_DELAY_MS`: contention retry policy
/// - `RECONCILE_INTERVAL_SECS` (`0` disables), `RECONCILE_GRACE_SECS`, `RECONCILE_BATCH_SIZE`
/// - `KAFKA_BROKERS`: bootstrap servers; unset logs events instead of producing them
/// - `SIGNAL_MAX_DELIVERIES`: deliveries of one order signal before dead-lettering (default: `5`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub lock_timeout: Duration,
    pub reservation: ReservationConfig,
    pub reconciler: ReconcilerConfig,
    pub kafka_brokers: Option<String>,
    pub signal_max_deliveries: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            lock_timeout: parsed(&lookup, "LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            reservation: ReservationConfig {
                max_attempts: parsed(&lookup, "RESERVE_MAX_ATTEMPTS")
                    .unwrap_or(defaults.reservation.max_attempts),
                retry_base_delay: parsed(&lookup, "RESERVE_RETRY_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reservation.retry_base_delay),
            },
            reconciler: ReconcilerConfig {
                interval: parsed(&lookup, "RECONCILE_INTERVAL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.reconciler.interval),
                grace: parsed(&lookup, "RECONCILE_GRACE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.reconciler.grace),
                batch_size: parsed(&lookup, "RECONCILE_BATCH_SIZE")
                    .unwrap_or(defaults.reconciler.batch_size),
            },
            kafka_brokers: non_empty("KAFKA_BROKERS"),
            signal_max_deliveries: parsed(&lookup, "SIGNAL_MAX_DELIVERIES")
                .unwrap_or(defaults.signal_max_deliveries),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting, using default");
            None
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            database_max_connections: 10,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            reservation: ReservationConfig::default(),
            reconciler: ReconcilerConfig::default(),
            kafka_brokers: None,
            signal_max_deliveries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.reservation.max_attempts, 3);
        assert_eq!(config.signal_max_deliveries, 5);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_reads_overrides() {
        let config = from_pairs(&[
            ("PORT", "8081"),
            ("DATABASE_URL", "postgres://localhost/inventory"),
            ("LOCK_TIMEOUT_MS", "250"),
            ("RESERVE_MAX_ATTEMPTS", "5"),
            ("RESERVE_RETRY_BASE_DELAY_MS", "20"),
            ("RECONCILE_INTERVAL_SECS", "0"),
            ("RECONCILE_BATCH_SIZE", "7"),
            ("KAFKA_BROKERS", "localhost:9092"),
            ("SIGNAL_MAX_DELIVERIES", "2"),
        ]);

        assert_eq!(config.port, 8081);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/inventory")
        );
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.reservation.max_attempts, 5);
        assert_eq!(config.reservation.retry_base_delay, Duration::from_millis(20));
        assert!(!config.reconciler.is_enabled());
        assert_eq!(config.reconciler.batch_size, 7);
        assert_eq!(config.kafka_brokers.as_deref(), Some("localhost:9092"));
        assert_eq!(config.signal_max_deliveries, 2);
    }

    #[test]
    fn test_unparsable_and_empty_values_fall_back() {
        let config = from_pairs(&[("PORT", "eighty"), ("DATABASE_URL", "  ")]);
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
    }
}

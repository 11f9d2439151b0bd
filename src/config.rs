use std::time::Duration;

use serde::Deserialize;

use crate::{address::QueueAddress, transaction::TransactionMode};

/// Settings read from `TABLEMQ_*` environment variables.
///
/// Durations are given in whole milliseconds or seconds, as the field name says.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    pub busy_timeout_ms: u64,

    pub input_queue: QueueAddress,
    pub error_queue: QueueAddress,
    pub transaction_mode: TransactionMode,
    pub scope_timeout_secs: u64,
    pub max_concurrency: usize,
    pub peek_delay_ms: u64,
    pub peek_timeout_ms: u64,
    pub breaker_wait_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub purge_on_startup: bool,
    pub failure_store_capacity: usize,
    pub immediate_retries: u32,

    pub purge_expired: bool,
    pub purge_expired_interval_secs: u64,
    pub purge_expired_batch_size: u32,

    pub delayed_delivery: bool,
    pub delayed_batch_size: u32,
    pub delayed_max_interval_secs: u64,

    pub subscription_table: QueueAddress,
    /// Subscriber lookups are cached for this long. Zero disables the cache.
    pub subscription_cache_ttl_secs: u64,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("TABLEMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn scope_timeout(&self) -> Duration {
        Duration::from_secs(self.scope_timeout_secs)
    }

    pub fn peek_delay(&self) -> Duration {
        Duration::from_millis(self.peek_delay_ms)
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn breaker_wait(&self) -> Duration {
        Duration::from_secs(self.breaker_wait_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn purge_expired_interval(&self) -> Duration {
        Duration::from_secs(self.purge_expired_interval_secs)
    }

    pub fn delayed_max_interval(&self) -> Duration {
        Duration::from_secs(self.delayed_max_interval_secs)
    }

    pub fn subscription_cache_ttl(&self) -> Option<Duration> {
        (self.subscription_cache_ttl_secs > 0)
            .then(|| Duration::from_secs(self.subscription_cache_ttl_secs))
    }

    /// The table delayed messages of the input queue are parked in.
    pub fn delayed_table(&self) -> QueueAddress {
        let table = QueueAddress::new(format!("{}.Delayed", self.input_queue.table()));
        match self.input_queue.schema() {
            Some(schema) => table.with_schema(schema),
            None => table,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "tablemq.db".to_owned(),
            busy_timeout_ms: 5_000,
            input_queue: QueueAddress::new("tablemq"),
            error_queue: QueueAddress::new("error"),
            transaction_mode: TransactionMode::default(),
            scope_timeout_secs: 60,
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            peek_delay_ms: 1_000,
            peek_timeout_ms: 5_000,
            breaker_wait_secs: 120,
            shutdown_timeout_secs: 30,
            purge_on_startup: false,
            failure_store_capacity: 1_000,
            immediate_retries: 5,
            purge_expired: true,
            purge_expired_interval_secs: 300,
            purge_expired_batch_size: 10_000,
            delayed_delivery: true,
            delayed_batch_size: 100,
            delayed_max_interval_secs: 60,
            subscription_table: QueueAddress::new("SubscriptionRouting"),
            subscription_cache_ttl_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_environment() {
        let config = envy::prefixed("TABLEMQ_")
            .from_iter::<_, Config>(Vec::<(String, String)>::new())
            .unwrap();

        assert_eq!(config.db_path(), "tablemq.db");
        assert_eq!(config.input_queue, QueueAddress::new("tablemq"));
        assert_eq!(config.transaction_mode, TransactionMode::SendsAtomicWithReceive);
        assert_eq!(config.subscription_cache_ttl(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_overrides() {
        let vars = [
            ("TABLEMQ_DB_PATH", "/tmp/queues.db"),
            ("TABLEMQ_INPUT_QUEUE", "orders@sales"),
            ("TABLEMQ_TRANSACTION_MODE", "receive_only"),
            ("TABLEMQ_MAX_CONCURRENCY", "8"),
            ("TABLEMQ_SUBSCRIPTION_CACHE_TTL_SECS", "0"),
        ]
        .map(|(k, v)| (k.to_owned(), v.to_owned()));

        let config = envy::prefixed("TABLEMQ_")
            .from_iter::<_, Config>(vars)
            .unwrap();

        assert_eq!(config.db_path(), "/tmp/queues.db");
        assert_eq!(
            config.input_queue,
            QueueAddress::new("orders").with_schema("sales")
        );
        assert_eq!(
            config.delayed_table(),
            QueueAddress::new("orders.Delayed").with_schema("sales")
        );
        assert_eq!(config.transaction_mode, TransactionMode::ReceiveOnly);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.subscription_cache_ttl(), None);
    }
}

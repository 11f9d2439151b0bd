use std::{str::FromStr, sync::Arc};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    address::QueueAddress,
    config::Config,
    db::{delayed::DelayedMessageTable, queue::QueueCache, schema},
    delayed::DelayedMessageProcessor,
    dispatch::Dispatcher,
    error::Error,
    failure::FailureInfoStore,
    pipeline::{log_critical_error, ImmediateRetries, OnCriticalError},
    receive::{ExpiredPurgeSettings, MessageReceiver},
    subscription::{CachedSubscriptionStore, SubscriptionStore, TableSubscriptionStore},
};

/// One endpoint: its database, queues and the components working them.
pub struct Service {
    db: SqlitePool,
    config: Config,
    queues: QueueCache,
    subscriptions: Arc<dyn SubscriptionStore>,
    delayed_table: Option<Arc<DelayedMessageTable>>,
    delayed_notify: Arc<Notify>,
    on_critical_error: OnCriticalError,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    /// Opens the database and creates the endpoint's tables if they do not exist yet.
    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        // Accepts a plain path as well as a `sqlite:` URL with options.
        let opts = SqliteConnectOptions::from_str(config.db_path())?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        let mut conn = pool.acquire().await?;
        schema::create_queue_table(&mut conn, &config.input_queue).await?;
        schema::create_queue_table(&mut conn, &config.error_queue).await?;
        schema::create_subscription_table(&mut conn, &config.subscription_table).await?;

        let delayed_table = if config.delayed_delivery {
            let table = config.delayed_table();
            schema::create_delayed_table(&mut conn, &table).await?;
            Some(Arc::new(DelayedMessageTable::new(
                table,
                config.input_queue.clone(),
            )))
        } else {
            None
        };
        drop(conn);

        let table = TableSubscriptionStore::new(pool.clone(), &config.subscription_table);
        let subscriptions: Arc<dyn SubscriptionStore> = match config.subscription_cache_ttl() {
            Some(ttl) => Arc::new(CachedSubscriptionStore::new(table, ttl)),
            None => Arc::new(table),
        };

        tracing::info!(
            db = %config.db_path(),
            input_queue = %config.input_queue,
            "Connected"
        );

        Ok(Self {
            db: pool,
            config,
            queues: QueueCache::new(),
            subscriptions,
            delayed_table,
            delayed_notify: Arc::new(Notify::new()),
            on_critical_error: log_critical_error(),
        })
    }

    /// Replaces the callback invoked on critical errors of every component created afterwards.
    pub fn with_critical_error(mut self, on_critical_error: OnCriticalError) -> Self {
        self.on_critical_error = on_critical_error;
        self
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscriptions(&self) -> Arc<dyn SubscriptionStore> {
        self.subscriptions.clone()
    }

    pub async fn create_queue(&self, address: &QueueAddress) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        schema::create_queue_table(&mut conn, address).await
    }

    pub async fn purge_queue(&self, address: &QueueAddress) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        self.queues.get(address).purge(&mut conn).await
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::builder()
            .pool(self.db.clone())
            .queues(self.queues.clone())
            .subscriptions(self.subscriptions.clone())
            .maybe_delayed(self.delayed_table.clone())
            .delayed_notify(self.delayed_notify.clone())
            .build()
    }

    /// A receiver for the configured input queue. It still has to be initialized with handlers.
    pub fn receiver(&self) -> MessageReceiver {
        let config = &self.config;

        MessageReceiver::builder()
            .pool(self.db.clone())
            .input_queue(config.input_queue.clone())
            .error_queue(config.error_queue.clone())
            .queues(self.queues.clone())
            .failures(FailureInfoStore::new(config.failure_store_capacity))
            .mode(config.transaction_mode)
            .scope_timeout(config.scope_timeout())
            .max_concurrency(config.max_concurrency)
            .peek_delay(config.peek_delay())
            .peek_timeout(config.peek_timeout())
            .time_to_wait_before_triggering(config.breaker_wait())
            .shutdown_timeout(config.shutdown_timeout())
            .purge_on_startup(config.purge_on_startup)
            .maybe_expired_purge(config.purge_expired.then(|| ExpiredPurgeSettings {
                interval: config.purge_expired_interval(),
                batch_size: config.purge_expired_batch_size,
            }))
            .on_critical_error(self.on_critical_error.clone())
            .build()
    }

    /// The default error policy: immediate retries, then the error queue.
    pub fn immediate_retries(&self) -> ImmediateRetries {
        ImmediateRetries::new(
            self.config.immediate_retries,
            self.queues.get(&self.config.error_queue),
            self.db.clone(),
        )
    }

    /// Starts moving matured delayed messages, if delayed delivery is enabled.
    pub fn start_delayed_delivery(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let table = self.delayed_table.clone()?;

        let processor = DelayedMessageProcessor::builder()
            .pool(self.db.clone())
            .table(table)
            .batch_size(self.config.delayed_batch_size)
            .max_interval(self.config.delayed_max_interval())
            .time_to_wait_before_triggering(self.config.breaker_wait())
            .on_critical_error(self.on_critical_error.clone())
            .notify(self.delayed_notify.clone())
            .build();

        Some(processor.start(cancel))
    }
}

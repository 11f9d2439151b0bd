//! The message pump.
//!
//! A [`MessageReceiver`] polls its input queue for the approximate backlog and starts up to
//! that many receive cycles, bounded by a [`ConcurrencyLimiter`]. Failures to peek and failures
//! of whole cycles are reported to two circuit breakers; while either has triggered the pump
//! falls back to one cycle at a time.

use std::{sync::Arc, time::Duration};

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    address::QueueAddress,
    circuit_breaker::RepeatedFailuresOverTimeCircuitBreaker,
    db::queue::{QueueCache, TableQueue},
    error::Error,
    expiry::ExpiredMessagesPurger,
    failure::FailureInfoStore,
    pipeline::{log_critical_error, ErrorHandler, MessageHandler, OnCriticalError},
    transaction::TransactionMode,
};

pub mod limiter;
pub mod strategy;

use limiter::ConcurrencyLimiter;
use strategy::ReceiveStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ReceiverState {
    Stopped,
    Initialized,
    Receiving,
    Stopping,
}

/// How often, and in what batches, a receiver purges expired messages.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredPurgeSettings {
    pub interval: Duration,
    pub batch_size: u32,
}

pub struct MessageReceiver {
    pool: SqlitePool,
    input_queue: Arc<TableQueue>,
    error_queue: Arc<TableQueue>,
    queues: QueueCache,
    failures: FailureInfoStore,
    mode: TransactionMode,
    scope_timeout: Duration,
    peek_delay: Duration,
    peek_timeout: Duration,
    time_to_wait_before_triggering: Duration,
    failure_delay: Duration,
    shutdown_timeout: Duration,
    purge_on_startup: bool,
    expired_purge: Option<ExpiredPurgeSettings>,
    on_critical_error: OnCriticalError,
    limiter: Arc<ConcurrencyLimiter>,
    state: ReceiverState,
    strategy: Option<Arc<ReceiveStrategy>>,
    running: Option<Running>,
}

/// Everything that only exists while receiving.
struct Running {
    receiving: CancellationToken,
    processing: CancellationToken,
    pump: JoinHandle<()>,
    purger: Option<JoinHandle<()>>,
    receive_breaker: Arc<RepeatedFailuresOverTimeCircuitBreaker>,
    processing_breaker: Arc<RepeatedFailuresOverTimeCircuitBreaker>,
}

#[bon::bon]
impl MessageReceiver {
    #[builder]
    pub fn new(
        pool: SqlitePool,
        input_queue: QueueAddress,
        error_queue: QueueAddress,
        #[builder(default)] queues: QueueCache,
        #[builder(default)] failures: FailureInfoStore,
        #[builder(default)] mode: TransactionMode,
        #[builder(default = Duration::from_secs(60))] scope_timeout: Duration,
        #[builder(default = 1)] max_concurrency: usize,
        #[builder(default = Duration::from_secs(1))] peek_delay: Duration,
        #[builder(default = Duration::from_secs(5))] peek_timeout: Duration,
        #[builder(default = Duration::from_secs(120))] time_to_wait_before_triggering: Duration,
        #[builder(default = Duration::from_secs(1))] failure_delay: Duration,
        #[builder(default = Duration::from_secs(30))] shutdown_timeout: Duration,
        #[builder(default)] purge_on_startup: bool,
        expired_purge: Option<ExpiredPurgeSettings>,
        #[builder(default = log_critical_error())] on_critical_error: OnCriticalError,
    ) -> Self {
        Self {
            input_queue: queues.get(&input_queue),
            error_queue: queues.get(&error_queue),
            pool,
            queues,
            failures,
            mode,
            scope_timeout,
            peek_delay,
            peek_timeout,
            time_to_wait_before_triggering,
            failure_delay,
            shutdown_timeout,
            purge_on_startup,
            expired_purge,
            on_critical_error,
            limiter: Arc::new(ConcurrencyLimiter::new(max_concurrency)),
            state: ReceiverState::Stopped,
            strategy: None,
            running: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn input_queue(&self) -> &QueueAddress {
        self.input_queue.address()
    }

    pub fn failures(&self) -> &FailureInfoStore {
        &self.failures
    }

    fn expect_state(&self, expected: ReceiverState, operation: &str) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "cannot {operation} a receiver that is {}",
                self.state
            )))
        }
    }

    /// Wires the handlers and prepares the input queue.
    pub async fn initialize(
        &mut self,
        on_message: Arc<dyn MessageHandler>,
        on_error: Arc<dyn ErrorHandler>,
    ) -> Result<(), Error> {
        self.expect_state(ReceiverState::Stopped, "initialize")?;

        let mut conn = self.pool.acquire().await?;

        if !self.input_queue.has_expires_index(&mut conn).await? {
            tracing::warn!(
                queue = %self.input_queue.name(),
                "Queue has no index on Expires, purging expired messages will be slow"
            );
        }

        if self.purge_on_startup {
            match self.input_queue.purge(&mut conn).await {
                Ok(purged) => {
                    tracing::info!(
                        queue = %self.input_queue.name(),
                        purged,
                        "Purged input queue on startup"
                    )
                }
                Err(e) => {
                    tracing::warn!(
                        queue = %self.input_queue.name(),
                        error = %e,
                        "Failed to purge input queue on startup"
                    )
                }
            }
        }

        self.strategy = Some(Arc::new(
            ReceiveStrategy::builder()
                .pool(self.pool.clone())
                .mode(self.mode)
                .scope_timeout(self.scope_timeout)
                .input_queue(self.input_queue.clone())
                .error_queue(self.error_queue.clone())
                .queues(self.queues.clone())
                .failures(self.failures.clone())
                .on_message(on_message)
                .on_error(on_error)
                .on_critical_error(self.on_critical_error.clone())
                .build(),
        ));

        self.state = ReceiverState::Initialized;

        Ok(())
    }

    pub fn start_receive(&mut self) -> Result<(), Error> {
        self.expect_state(ReceiverState::Initialized, "start")?;

        let strategy = self
            .strategy
            .clone()
            .ok_or_else(|| Error::invalid_state("receiver has no handlers"))?;

        let name = self.input_queue.name().to_owned();
        let breaker = |kind: &str| {
            Arc::new(
                RepeatedFailuresOverTimeCircuitBreaker::builder()
                    .name(format!("{name} {kind}"))
                    .time_to_wait_before_triggering(self.time_to_wait_before_triggering)
                    .failure_delay(self.failure_delay)
                    .on_critical_error(self.on_critical_error.clone())
                    .build(),
            )
        };
        let receive_breaker = breaker("receive");
        let processing_breaker = breaker("processing");

        let receiving = CancellationToken::new();
        let processing = CancellationToken::new();

        let pump = Arc::new(Pump {
            pool: self.pool.clone(),
            input_queue: self.input_queue.clone(),
            strategy,
            limiter: self.limiter.clone(),
            receive_breaker: receive_breaker.clone(),
            processing_breaker: processing_breaker.clone(),
            receiving: receiving.clone(),
            processing: processing.clone(),
            peek_delay: self.peek_delay,
            peek_timeout: self.peek_timeout,
        });

        let purger = self.expired_purge.map(|settings| {
            let purger = ExpiredMessagesPurger::builder()
                .pool(self.pool.clone())
                .queue(self.input_queue.clone())
                .interval(settings.interval)
                .batch_size(settings.batch_size)
                .build();
            tokio::spawn(purger.run(receiving.clone()))
        });

        tracing::info!(
            queue = %name,
            mode = %self.mode,
            max_concurrency = self.limiter.max_concurrency(),
            "Starting receiver"
        );

        self.running = Some(Running {
            pump: tokio::spawn(pump.run()),
            purger,
            receiving,
            processing,
            receive_breaker,
            processing_breaker,
        });
        self.state = ReceiverState::Receiving;

        Ok(())
    }

    /// Changes the number of concurrently processed messages. Returns once all cycles
    /// started under the previous limit have finished.
    pub async fn change_concurrency(&self, max_concurrency: usize) {
        self.limiter.set_max_concurrency(max_concurrency).await;
    }

    /// Stops receiving, giving in-flight cycles `shutdown_timeout` to finish before they are
    /// cancelled.
    pub async fn stop_receive(&mut self) -> Result<(), Error> {
        self.expect_state(ReceiverState::Receiving, "stop")?;
        self.state = ReceiverState::Stopping;

        let Some(running) = self.running.take() else {
            self.state = ReceiverState::Stopped;
            return Ok(());
        };

        running.receiving.cancel();

        if let Err(e) = running.pump.await {
            tracing::warn!(error = %e, "Receive loop ended abnormally");
        }
        if let Some(purger) = running.purger {
            if let Err(e) = purger.await {
                tracing::warn!(error = %e, "Expired message purger ended abnormally");
            }
        }

        if !self.limiter.drain(self.shutdown_timeout).await {
            tracing::warn!(
                queue = %self.input_queue.name(),
                timeout = ?self.shutdown_timeout,
                "In-flight messages did not finish in time, cancelling them"
            );
            running.processing.cancel();

            if !self.limiter.drain(self.shutdown_timeout).await {
                tracing::error!(
                    queue = %self.input_queue.name(),
                    "In-flight messages did not stop"
                );
            }
        }

        running.receive_breaker.dispose();
        running.processing_breaker.dispose();

        self.strategy = None;
        self.state = ReceiverState::Stopped;

        tracing::info!(queue = %self.input_queue.name(), "Receiver stopped");

        Ok(())
    }
}

struct Pump {
    pool: SqlitePool,
    input_queue: Arc<TableQueue>,
    strategy: Arc<ReceiveStrategy>,
    limiter: Arc<ConcurrencyLimiter>,
    receive_breaker: Arc<RepeatedFailuresOverTimeCircuitBreaker>,
    processing_breaker: Arc<RepeatedFailuresOverTimeCircuitBreaker>,
    receiving: CancellationToken,
    processing: CancellationToken,
    peek_delay: Duration,
    peek_timeout: Duration,
}

impl Pump {
    async fn run(self: Arc<Self>) {
        while !self.receiving.is_cancelled() {
            let available = match self.peek().await {
                Ok(available) => {
                    self.receive_breaker.success();
                    available
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(
                        queue = %self.input_queue.name(),
                        error = %e,
                        "Failed to peek input queue"
                    );
                    self.receive_breaker
                        .failure(eyre::Report::new(e), &self.receiving)
                        .await;
                    continue;
                }
            };

            if available == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.peek_delay) => {}
                    _ = self.receiving.cancelled() => break,
                }
                continue;
            }

            self.receive_messages(available).await;
        }

        tracing::debug!(queue = %self.input_queue.name(), "Receive loop stopped");
    }

    async fn peek(&self) -> Result<u64, Error> {
        let mut conn = tokio::select! {
            conn = self.pool.acquire() => conn?,
            _ = self.receiving.cancelled() => return Err(Error::Cancelled),
        };

        self.input_queue.try_peek(&mut conn, self.peek_timeout).await
    }

    async fn receive_messages(self: &Arc<Self>, available: u64) {
        let workers = if self.receive_breaker.triggered() || self.processing_breaker.triggered() {
            1
        } else {
            available
        };

        for _ in 0..workers {
            let permit = match self.limiter.acquire(&self.receiving).await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let pump = self.clone();
            tokio::spawn(async move {
                pump.process_one().await;
                drop(permit);
            });
        }
    }

    async fn process_one(&self) {
        let result = tokio::select! {
            result = self.strategy.receive_message(&self.processing) => result,
            _ = self.processing.cancelled() => Err(Error::Cancelled),
        };

        match result {
            Ok(()) => self.processing_breaker.success(),
            Err(e) if e.is_cancelled() => {}
            Err(e) if e.is_lock_contention() => {
                tracing::warn!(
                    queue = %self.input_queue.name(),
                    error = %e,
                    "Receive cycle lost a lock race, the message will be retried"
                );
            }
            Err(e) => {
                tracing::warn!(
                    queue = %self.input_queue.name(),
                    error = %e,
                    "Receive cycle failed"
                );
                self.processing_breaker
                    .failure(eyre::Report::new(e), &self.processing)
                    .await;
            }
        }
    }
}

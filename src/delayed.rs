//! Delivery of delayed messages.
//!
//! The [`DelayedMessageProcessor`] periodically moves matured messages out of the delayed
//! table into the endpoint's input queue, where the receive strategy forwards them to their
//! final destination. It sleeps until the next message is due, capped by `max_interval`, and
//! is woken early by the dispatcher when it parks new messages.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    circuit_breaker::RepeatedFailuresOverTimeCircuitBreaker,
    db::delayed::DelayedMessageTable,
    error::Error,
    pipeline::{log_critical_error, OnCriticalError},
};

pub struct DelayedMessageProcessor {
    pool: SqlitePool,
    table: Arc<DelayedMessageTable>,
    batch_size: u32,
    max_interval: Duration,
    notify: Arc<Notify>,
    breaker: RepeatedFailuresOverTimeCircuitBreaker,
}

#[bon::bon]
impl DelayedMessageProcessor {
    #[builder]
    pub fn new(
        pool: SqlitePool,
        table: Arc<DelayedMessageTable>,
        #[builder(default = 100)] batch_size: u32,
        #[builder(default = Duration::from_secs(60))] max_interval: Duration,
        #[builder(default = Duration::from_secs(120))] time_to_wait_before_triggering: Duration,
        #[builder(default = log_critical_error())] on_critical_error: OnCriticalError,
        // Shared with the dispatcher so that it can wake the processor.
        #[builder(default)]
        notify: Arc<Notify>,
    ) -> Self {
        let breaker = RepeatedFailuresOverTimeCircuitBreaker::builder()
            .name(format!("{} delayed delivery", table.address()))
            .time_to_wait_before_triggering(time_to_wait_before_triggering)
            .on_critical_error(on_critical_error)
            .build();

        Self {
            pool,
            table,
            batch_size: batch_size.max(1),
            max_interval,
            notify,
            breaker,
        }
    }

    /// Handle the dispatcher uses to wake the processor.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Moves one batch of matured messages in a single transaction.
    pub async fn move_due_messages(&self) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;
        let moved = self.table.move_due_messages(self.batch_size, &mut tx).await?;
        tx.commit().await?;

        if moved > 0 {
            tracing::debug!(table = %self.table.address(), moved, "Moved matured delayed messages");
        }

        Ok(moved)
    }

    /// How long to wait before the next run: until the earliest message is due, but no longer
    /// than `max_interval`.
    async fn next_wait(&self) -> Result<Duration, Error> {
        let mut conn = self.pool.acquire().await?;

        let wait = match self.table.next_due(&mut conn).await? {
            Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.max_interval,
        };

        Ok(wait.min(self.max_interval))
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(table = %self.table.address(), "Starting delayed message processor");

        while !cancel.is_cancelled() {
            let wait = match self.move_due_messages().await {
                Ok(moved) => {
                    self.breaker.success();
                    if moved >= u64::from(self.batch_size) {
                        continue;
                    }
                    match self.next_wait().await {
                        Ok(wait) => wait,
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                "Failed to look up the next due delayed message"
                            );
                            self.max_interval
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        table = %self.table.address(),
                        error = %e,
                        "Failed to move delayed messages"
                    );
                    self.breaker.failure(eyre::Report::new(e), &cancel).await;
                    continue;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.breaker.dispose();
        tracing::debug!(table = %self.table.address(), "Delayed message processor stopped");
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::QueueAddress,
        db::{
            queue::{ReceiveResult, TableQueue},
            schema::{create_delayed_table, create_queue_table},
            testing::setup_db,
        },
        message::{Headers, OutgoingMessage},
    };

    #[tokio::test]
    async fn test_notified_processor_moves_due_message() {
        let db = setup_db().await;
        let input = QueueAddress::new("endpoint");
        let delayed = QueueAddress::new("endpoint.Delayed");
        let mut conn = db.pool.acquire().await.unwrap();
        create_queue_table(&mut conn, &input).await.unwrap();
        create_delayed_table(&mut conn, &delayed).await.unwrap();

        let table = Arc::new(DelayedMessageTable::new(delayed, input.clone()));
        let processor = DelayedMessageProcessor::builder()
            .pool(db.pool.clone())
            .table(table.clone())
            .max_interval(Duration::from_secs(3600))
            .build();
        let notify = processor.notifier();

        let cancel = CancellationToken::new();
        let task = processor.start(cancel.clone());

        let due = Utc::now() + chrono::Duration::milliseconds(50);
        table
            .store(
                &OutgoingMessage::new(Headers::new(), "later"),
                &QueueAddress::new("billing"),
                due,
                &mut conn,
            )
            .await
            .unwrap();
        notify.notify_one();

        let queue = TableQueue::new(input);
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ReceiveResult::Success(message) =
                    queue.try_receive(&mut conn).await.unwrap()
                {
                    break message;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(received.body().as_ref(), b"later");
        assert!(Utc::now() >= due);

        cancel.cancel();
        task.await.unwrap();
    }
}

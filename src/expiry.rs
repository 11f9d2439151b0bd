//! Background removal of expired messages.
//!
//! Expired messages are never handed to a handler, but they are only deleted when they reach
//! the head of the queue. On a queue with a large backlog the purger deletes them earlier, in
//! batches, using the index on `Expires`.

use std::{sync::Arc, time::Duration};

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::{db::queue::TableQueue, error::Error};

pub struct ExpiredMessagesPurger {
    pool: SqlitePool,
    queue: Arc<TableQueue>,
    interval: Duration,
    batch_size: u32,
}

#[bon::bon]
impl ExpiredMessagesPurger {
    #[builder]
    pub fn new(
        pool: SqlitePool,
        queue: Arc<TableQueue>,
        #[builder(default = Duration::from_secs(300))] interval: Duration,
        #[builder(default = 10_000)] batch_size: u32,
    ) -> Self {
        Self {
            pool,
            queue,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Deletes all currently expired messages, one batch per statement so that the write lock
    /// is released between batches.
    pub async fn purge(&self, cancel: &CancellationToken) -> Result<u64, Error> {
        let mut total = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut conn = self.pool.acquire().await?;
            let purged = self.queue.purge_expired(self.batch_size, &mut conn).await?;
            total += purged;

            if purged < u64::from(self.batch_size) {
                return Ok(total);
            }
        }
    }

    /// Purges every `interval` until `cancel` fires. Returns immediately when the queue has no
    /// index on `Expires`, since every purge would scan the whole table.
    pub async fn run(self, cancel: CancellationToken) {
        match self.pool.acquire().await {
            Ok(mut conn) => match self.queue.has_expires_index(&mut conn).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        "Queue has no index on Expires, expired messages will not be purged"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        error = %e,
                        "Failed to verify Expires index"
                    );
                    return;
                }
            },
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue.name(),
                    error = %e,
                    "Failed to verify Expires index"
                );
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }

            match self.purge(&cancel).await {
                Ok(0) => {}
                Ok(purged) => {
                    tracing::debug!(queue = %self.queue.name(), purged, "Purged expired messages")
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        error = %e,
                        "Failed to purge expired messages"
                    )
                }
            }
        }
    }
}

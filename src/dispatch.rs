//! Sending messages.
//!
//! The [`Dispatcher`] turns a batch of [`TransportOperation`]s into inserts. Operations that
//! share a consistency level are written in one transaction, so a failing insert (for example
//! into a queue that does not exist) rolls back every other insert of the same batch.
//!
//! Operations with [`DispatchConsistency::Default`] join the caller's receive transaction when
//! it accepts outgoing messages; otherwise, and for [`DispatchConsistency::Isolated`]
//! operations, a fresh transaction is used. While a receive transaction is open it holds the
//! database's write lock, so such operations are checked against the open transaction and
//! written right after it completes.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Notify;

use crate::{
    address::QueueAddress,
    db::{delayed::DelayedMessageTable, queue::QueueCache},
    error::Error,
    message::OutgoingMessage,
    subscription::SubscriptionStore,
    transaction::TransportTransaction,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DispatchConsistency {
    #[default]
    Default,
    Isolated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Unicast(QueueAddress),
    /// Every queue subscribed to any of the topics.
    Multicast(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
    For(Duration),
    Until(DateTime<Utc>),
}

impl Delay {
    fn due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Delay::For(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Delay::Until(at) => *at,
        }
    }
}

/// A time-to-be-received, fixed to an absolute deadline when the constraint is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscardIfNotReceivedBefore {
    deadline: DateTime<Utc>,
}

impl DiscardIfNotReceivedBefore {
    pub fn new(time_to_be_received: Duration) -> Self {
        let deadline = chrono::Duration::from_std(time_to_be_received)
            .ok()
            .and_then(|ttbr| Utc::now().checked_add_signed(ttbr))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self { deadline }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Time left before the deadline, `None` once it has passed.
    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.deadline - now).to_std().ok().filter(|left| !left.is_zero())
    }
}

#[derive(Debug, Clone)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    pub destination: Destination,
    pub consistency: DispatchConsistency,
    pub delay: Option<Delay>,
    pub discard_if_not_received_before: Option<DiscardIfNotReceivedBefore>,
}

impl TransportOperation {
    pub fn unicast(message: OutgoingMessage, destination: QueueAddress) -> Self {
        Self::new(message, Destination::Unicast(destination))
    }

    pub fn multicast<I, T>(message: OutgoingMessage, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::new(
            message,
            Destination::Multicast(topics.into_iter().map(Into::into).collect()),
        )
    }

    fn new(message: OutgoingMessage, destination: Destination) -> Self {
        Self {
            message,
            destination,
            consistency: DispatchConsistency::Default,
            delay: None,
            discard_if_not_received_before: None,
        }
    }

    pub fn isolated(mut self) -> Self {
        self.consistency = DispatchConsistency::Isolated;
        self
    }

    pub fn delayed(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn discard_if_not_received_within(mut self, time_to_be_received: Duration) -> Self {
        self.discard_if_not_received_before =
            Some(DiscardIfNotReceivedBefore::new(time_to_be_received));
        self
    }

    fn validate(&self, has_delayed_table: bool) -> Result<(), Error> {
        if self.delay.is_none() {
            return Ok(());
        }
        if self.discard_if_not_received_before.is_some() {
            return Err(Error::invalid_parameter(
                "delayed delivery of messages with a time-to-be-received is not supported",
            ));
        }
        if matches!(self.destination, Destination::Multicast(_)) {
            return Err(Error::invalid_parameter(
                "delayed delivery of published messages is not supported",
            ));
        }
        if !has_delayed_table {
            return Err(Error::invalid_parameter(
                "delayed delivery requires a delayed message table",
            ));
        }
        Ok(())
    }
}

/// An operation resolved to one queue.
struct UnicastOperation {
    message: OutgoingMessage,
    destination: QueueAddress,
    consistency: DispatchConsistency,
    due: Option<DateTime<Utc>>,
    time_to_be_received: Option<Duration>,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: SqlitePool,
    queues: QueueCache,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    delayed: Option<Arc<DelayedMessageTable>>,
    /// Woken after the dispatcher committed delayed messages of its own.
    delayed_notify: Option<Arc<Notify>>,
}

#[bon::bon]
impl Dispatcher {
    #[builder]
    pub fn new(
        pool: SqlitePool,
        #[builder(default)] queues: QueueCache,
        subscriptions: Option<Arc<dyn SubscriptionStore>>,
        delayed: Option<Arc<DelayedMessageTable>>,
        delayed_notify: Option<Arc<Notify>>,
    ) -> Self {
        Self {
            pool,
            queues,
            subscriptions,
            delayed,
            delayed_notify,
        }
    }

    pub async fn dispatch(
        &self,
        operations: Vec<TransportOperation>,
        transaction: &mut TransportTransaction,
    ) -> Result<(), Error> {
        for operation in &operations {
            operation.validate(self.delayed.is_some())?;
        }

        let now = Utc::now();
        let operations = self.resolve(operations, now).await?;

        let (isolated, default): (Vec<_>, Vec<_>) = operations
            .into_iter()
            .partition(|op| op.consistency == DispatchConsistency::Isolated);

        if !isolated.is_empty() {
            self.send_independently(isolated, now, transaction).await?;
        }

        if default.is_empty() {
            return Ok(());
        }

        let Some(conn) = transaction.enlisted_connection() else {
            return self.send_independently(default, now, transaction).await;
        };

        let delayed = self.send_all(&default, now, conn).await?;
        if delayed > 0 {
            if let (Some(notify), Some(after_completion)) =
                (&self.delayed_notify, transaction.after_completion())
            {
                after_completion.notify_on_commit(notify.clone());
            }
        }

        Ok(())
    }

    /// Sends operations in a transaction of their own. When the caller still has a receive
    /// transaction open, the destinations are checked on it and the operations are sent once
    /// it has completed.
    async fn send_independently(
        &self,
        operations: Vec<UnicastOperation>,
        now: DateTime<Utc>,
        transaction: &mut TransportTransaction,
    ) -> Result<(), Error> {
        let Some(conn) = transaction.connection() else {
            return self.send_in_new_transaction(&operations, now).await;
        };

        self.check_destinations(&operations, now, conn).await?;

        if let Some(after_completion) = transaction.after_completion() {
            after_completion.defer(self.clone(), operations);
        }

        Ok(())
    }

    async fn check_destinations(
        &self,
        operations: &[UnicastOperation],
        now: DateTime<Utc>,
        conn: &mut SqliteConnection,
    ) -> Result<(), Error> {
        let mut checked = HashSet::new();

        for operation in operations {
            if self.is_delayed(operation, now) || !checked.insert(&operation.destination) {
                continue;
            }

            let queue = self.queues.get(&operation.destination);
            if !queue.exists(&mut *conn).await? {
                return Err(Error::queue_not_found(queue.name()));
            }
        }

        Ok(())
    }

    fn is_delayed(&self, operation: &UnicastOperation, now: DateTime<Utc>) -> bool {
        self.delayed.is_some() && operation.due.is_some_and(|due| due > now)
    }

    /// Expands multicast operations, removes duplicates and drops operations that can no
    /// longer be received in time.
    async fn resolve(
        &self,
        operations: Vec<TransportOperation>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UnicastOperation>, Error> {
        let mut resolved = Vec::with_capacity(operations.len());
        let mut seen = HashSet::new();

        for operation in operations {
            let time_to_be_received = match operation.discard_if_not_received_before {
                Some(discard) => match discard.remaining(now) {
                    Some(remaining) => Some(remaining),
                    None => {
                        tracing::debug!(
                            message_id = %operation.message.message_id,
                            "Discarding message whose time to be received has passed"
                        );
                        continue;
                    }
                },
                None => None,
            };

            let due = operation.delay.map(|delay| delay.due(now));

            let destinations = match operation.destination {
                Destination::Unicast(address) => vec![address],
                Destination::Multicast(topics) => {
                    let subscriptions = self.subscriptions.as_ref().ok_or_else(|| {
                        Error::invalid_parameter("publishing requires a subscription store")
                    })?;
                    let subscribers = subscriptions.get_subscribers(&topics).await?;
                    if subscribers.is_empty() {
                        tracing::debug!(
                            message_id = %operation.message.message_id,
                            ?topics,
                            "No subscribers for published message"
                        );
                    }
                    subscribers
                }
            };

            for destination in destinations {
                if !seen.insert((destination.clone(), operation.message.message_id.clone())) {
                    continue;
                }

                resolved.push(UnicastOperation {
                    message: operation.message.clone(),
                    destination,
                    consistency: operation.consistency,
                    due,
                    time_to_be_received,
                });
            }
        }

        Ok(resolved)
    }

    async fn send_in_new_transaction(
        &self,
        operations: &[UnicastOperation],
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let delayed = match self.send_all(operations, now, &mut tx).await {
            Ok(delayed) => delayed,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Failed to roll back dispatch transaction");
                }
                return Err(e);
            }
        };

        tx.commit().await?;

        if delayed > 0 {
            if let Some(notify) = &self.delayed_notify {
                notify.notify_one();
            }
        }

        Ok(())
    }

    /// Writes every operation on `conn`, returning how many went to the delayed table.
    async fn send_all(
        &self,
        operations: &[UnicastOperation],
        now: DateTime<Utc>,
        conn: &mut SqliteConnection,
    ) -> Result<usize, Error> {
        let mut delayed = 0;

        for operation in operations {
            match (operation.due, &self.delayed) {
                (Some(due), Some(table)) if due > now => {
                    table
                        .store(&operation.message, &operation.destination, due, &mut *conn)
                        .await?;
                    delayed += 1;
                }
                _ => {
                    self.queues
                        .get(&operation.destination)
                        .send(&operation.message, operation.time_to_be_received, &mut *conn)
                        .await?;
                }
            }
        }

        Ok(delayed)
    }
}

/// Work a [`TransportTransaction`] runs once it has committed or rolled back: operations that
/// could not be written while it held the write lock, and wake-ups for the delayed message
/// processor that only make sense once parked messages are visible.
#[derive(Default)]
pub struct AfterCompletion {
    deferred: Vec<DeferredSend>,
    notify_on_commit: Vec<Arc<Notify>>,
}

struct DeferredSend {
    dispatcher: Dispatcher,
    operations: Vec<UnicastOperation>,
}

impl AfterCompletion {
    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty() && self.notify_on_commit.is_empty()
    }

    fn defer(&mut self, dispatcher: Dispatcher, operations: Vec<UnicastOperation>) {
        self.deferred.push(DeferredSend {
            dispatcher,
            operations,
        });
    }

    fn notify_on_commit(&mut self, notify: Arc<Notify>) {
        if !self
            .notify_on_commit
            .iter()
            .any(|registered| Arc::ptr_eq(registered, &notify))
        {
            self.notify_on_commit.push(notify);
        }
    }

    /// Sends the deferred operations, each batch in its own transaction, then wakes the
    /// delayed message processor if the transaction committed.
    pub(crate) async fn run(self, committed: bool) {
        for deferred in self.deferred {
            let result = deferred
                .dispatcher
                .send_in_new_transaction(&deferred.operations, Utc::now())
                .await;

            if let Err(e) = result {
                tracing::error!(
                    error = %e,
                    messages = deferred.operations.len(),
                    "Failed to send messages held back until the receive transaction completed"
                );
            }
        }

        if committed {
            for notify in self.notify_on_commit {
                notify.notify_one();
            }
        }
    }
}

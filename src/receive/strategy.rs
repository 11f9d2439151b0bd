//! One receive-and-process cycle.
//!
//! A cycle begins a transaction, takes the oldest row off the input queue and, depending on
//! what it finds, dead-letters it, drops it, forwards it or hands it to the message handler.
//! How far the transaction reaches is decided by the [`TransactionMode`]; see
//! [`crate::transaction`].

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::{
    address::QueueAddress,
    db::queue::{QueueCache, ReceiveResult, TableQueue},
    error::Error,
    failure::FailureInfoStore,
    message::{headers, IncomingMessage},
    pipeline::{
        ContextBag, CriticalError, ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext,
        MessageHandler, OnCriticalError,
    },
    transaction::{provider_for, TransactionMode, TransactionScopeProvider, TransportTransaction},
};

/// What the receive step left for the rest of the cycle.
enum Received {
    /// Nothing for the handler: the queue was empty or the row was dealt with already.
    Done,
    Process(IncomingMessage),
}

pub struct ReceiveStrategy {
    pool: SqlitePool,
    mode: TransactionMode,
    provider: Box<dyn TransactionScopeProvider>,
    input_queue: Arc<TableQueue>,
    error_queue: Arc<TableQueue>,
    queues: QueueCache,
    failures: FailureInfoStore,
    on_message: Arc<dyn MessageHandler>,
    on_error: Arc<dyn ErrorHandler>,
    on_critical_error: OnCriticalError,
}

#[bon::bon]
impl ReceiveStrategy {
    #[builder]
    pub fn new(
        pool: SqlitePool,
        mode: TransactionMode,
        #[builder(default = std::time::Duration::from_secs(60))] scope_timeout: std::time::Duration,
        input_queue: Arc<TableQueue>,
        error_queue: Arc<TableQueue>,
        #[builder(default)] queues: QueueCache,
        failures: FailureInfoStore,
        on_message: Arc<dyn MessageHandler>,
        on_error: Arc<dyn ErrorHandler>,
        on_critical_error: OnCriticalError,
    ) -> Self {
        Self {
            pool,
            mode,
            provider: provider_for(mode, scope_timeout),
            input_queue,
            error_queue,
            queues,
            failures,
            on_message,
            on_error,
            on_critical_error,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Receives and processes at most one message.
    ///
    /// Handler failures are not errors of the cycle; they are recorded and routed through
    /// error handling. An error means the queue itself could not be worked.
    pub async fn receive_message(&self, cancel: &CancellationToken) -> Result<(), Error> {
        match self.mode {
            TransactionMode::None => self.process_without_transaction(cancel).await,
            _ => self.process_in_transaction(cancel).await,
        }
    }

    async fn process_in_transaction(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut transaction = self.provider.begin(&self.pool).await?;

        let message = match self.receive(&mut transaction).await {
            Ok(Received::Process(message)) => message,
            Ok(Received::Done) => return transaction.commit().await,
            Err(e) => {
                rollback_quietly(transaction).await;
                return Err(e);
            }
        };

        let message_id = message.transport_id().to_owned();
        let mut context = ContextBag::new();

        if let Some(record) = self.failures.get(&message_id) {
            context = record.context.clone();

            let result = self
                .handle_error(
                    &record.error,
                    &message,
                    &mut transaction,
                    record.attempts,
                    &context,
                )
                .await;

            if result == ErrorHandleResult::Handled {
                transaction.commit().await?;
                self.failures.clear(&message_id);
                return Ok(());
            }
        }

        match self
            .invoke_handler(&message, &mut transaction, &mut context, cancel)
            .await
        {
            Ok(()) => {
                transaction.commit().await?;
                self.failures.clear(&message_id);
            }
            Err(e) => {
                let attempts = self.failures.record_failure(&message_id, e, context);
                tracing::debug!(
                    message_id = %message_id,
                    attempts,
                    "Message processing failed, rolling back"
                );
                transaction.rollback().await?;
            }
        }

        Ok(())
    }

    async fn process_without_transaction(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut receive = self.provider.begin(&self.pool).await?;

        let message = match self.receive(&mut receive).await {
            Ok(Received::Process(message)) => message,
            Ok(Received::Done) => return receive.commit().await,
            Err(e) => {
                rollback_quietly(receive).await;
                return Err(e);
            }
        };

        // From here on the message only exists in memory.
        receive.commit().await?;

        let mut transaction = TransportTransaction::None;
        let mut context = ContextBag::new();

        let Err(e) = self
            .invoke_handler(&message, &mut transaction, &mut context, cancel)
            .await
        else {
            return Ok(());
        };

        let result = self
            .handle_error(&e, &message, &mut transaction, 1, &context)
            .await;

        if result == ErrorHandleResult::RetryRequired {
            tracing::warn!(
                message_id = %message.transport_id(),
                error = %e,
                "Message cannot be retried without a transaction and has been lost"
            );
        }

        Ok(())
    }

    async fn receive(&self, transaction: &mut TransportTransaction) -> Result<Received, Error> {
        let conn = transaction
            .connection()
            .ok_or_else(|| Error::invalid_state("receive requires a database transaction"))?;

        let message = match self.input_queue.try_receive(&mut *conn).await? {
            ReceiveResult::NoMessage => return Ok(Received::Done),
            ReceiveResult::Poison(row) => {
                tracing::error!(
                    queue = %self.input_queue.name(),
                    message_id = %row.id,
                    error_queue = %self.error_queue.name(),
                    "Moving poison message to the error queue"
                );
                self.error_queue.dead_letter(&row, conn).await?;
                return Ok(Received::Done);
            }
            ReceiveResult::Success(message) => message,
        };

        if message.is_expired() {
            tracing::debug!(
                queue = %self.input_queue.name(),
                message_id = %message.transport_id(),
                "Discarding expired message"
            );
            return Ok(Received::Done);
        }

        let Some(destination) = message.forward_destination() else {
            return Ok(Received::Process(message));
        };

        let destination = match destination.parse::<QueueAddress>() {
            Ok(destination) => destination,
            Err(e) => {
                tracing::error!(
                    message_id = %message.transport_id(),
                    destination,
                    error = %e,
                    "Delayed message has an invalid destination, moving it to the error queue"
                );
                let mut outgoing = message.without_forward_destination().to_outgoing();
                outgoing
                    .headers
                    .insert(headers::EXCEPTION_MESSAGE.to_owned(), e.to_string());
                outgoing.headers.insert(
                    headers::FAILED_QUEUE.to_owned(),
                    self.input_queue.name().to_owned(),
                );
                self.error_queue.send(&outgoing, None, conn).await?;
                return Ok(Received::Done);
            }
        };

        if &destination == self.input_queue.address() {
            return Ok(Received::Process(message));
        }

        let outgoing = message.without_forward_destination().to_outgoing();
        match self.queues.get(&destination).send(&outgoing, None, conn).await {
            Ok(()) => {
                tracing::debug!(
                    message_id = %message.transport_id(),
                    %destination,
                    "Forwarded delayed message"
                );
                Ok(Received::Done)
            }
            Err(e) => {
                if let Error::QueueNotFound { .. } = e {
                    tracing::error!(
                        message_id = %message.transport_id(),
                        %destination,
                        message_types = message.enclosed_message_types().unwrap_or("unknown"),
                        "Destination of a delayed message does not exist"
                    );
                }
                Err(e)
            }
        }
    }

    async fn invoke_handler(
        &self,
        message: &IncomingMessage,
        transaction: &mut TransportTransaction,
        context: &mut ContextBag,
        cancel: &CancellationToken,
    ) -> eyre::Result<()> {
        // A forward header naming this queue has done its job.
        let stripped;
        let message = if message.forward_destination().is_some() {
            stripped = message.without_forward_destination();
            &stripped
        } else {
            message
        };

        self.on_message
            .on_message(MessageContext {
                message,
                transaction,
                receive_address: self.input_queue.address(),
                context,
                cancel,
            })
            .await
    }

    async fn handle_error(
        &self,
        error: &eyre::Report,
        message: &IncomingMessage,
        transaction: &mut TransportTransaction,
        attempts: u32,
        context: &ContextBag,
    ) -> ErrorHandleResult {
        let result = self
            .on_error
            .on_error(ErrorContext {
                error,
                message,
                transaction,
                attempts,
                receive_address: self.input_queue.address(),
                context,
            })
            .await;

        match result {
            Ok(result) => result,
            Err(e) => {
                let message_id = message.transport_id();
                tracing::error!(%message_id, error = %e, "Error handling failed");
                (self.on_critical_error)(CriticalError::new(
                    format!("Failed to run error handling for message {message_id}"),
                    Arc::new(e),
                ));
                ErrorHandleResult::RetryRequired
            }
        }
    }
}

async fn rollback_quietly(transaction: TransportTransaction) {
    if let Err(e) = transaction.rollback().await {
        tracing::warn!(error = %e, "Failed to roll back receive transaction");
    }
}

//! Handler contracts of the receive pipeline.
//!
//! A receiver is given a [`MessageHandler`] that processes messages and an [`ErrorHandler`]
//! that decides what happens to a message once processing failed: try again, or consider it
//! handled (usually by moving it to an error queue, see [`ImmediateRetries`]).

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::{
    address::QueueAddress,
    db::queue::TableQueue,
    error::Error,
    message::{headers, IncomingMessage},
    transaction::TransportTransaction,
};

/// Opaque per-message state shared between the message handler and error handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBag(HashMap<String, serde_json::Value>);

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A failure the endpoint cannot recover from by itself.
#[derive(Clone)]
pub struct CriticalError {
    message: String,
    error: Arc<eyre::Report>,
}

impl CriticalError {
    pub fn new(message: impl Into<String>, error: Arc<eyre::Report>) -> Self {
        Self {
            message: message.into(),
            error,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn error(&self) -> &eyre::Report {
        &self.error
    }
}

impl fmt::Debug for CriticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalError")
            .field("message", &self.message)
            .field("error", &format_args!("{}", self.error))
            .finish()
    }
}

/// Invoked when a circuit breaker triggers or error handling itself fails. Usually stops the
/// endpoint.
pub type OnCriticalError = Arc<dyn Fn(CriticalError) + Send + Sync>;

/// A critical error callback that only logs.
pub fn log_critical_error() -> OnCriticalError {
    Arc::new(|e: CriticalError| {
        tracing::error!(error = %e.error(), "{}", e.message());
    })
}

pub struct MessageContext<'a> {
    pub message: &'a IncomingMessage,
    /// The transaction the message was received in. Pass it to the dispatcher to send
    /// messages atomically with the receive.
    pub transaction: &'a mut TransportTransaction,
    pub receive_address: &'a QueueAddress,
    pub context: &'a mut ContextBag,
    /// Fires when processing has to be abandoned during shutdown.
    pub cancel: &'a CancellationToken,
}

pub trait MessageHandler: Send + Sync + 'static {
    fn on_message<'a>(
        &'a self,
        ctx: MessageContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorHandleResult {
    /// The failure was dealt with and the message can be removed.
    Handled,
    /// The message should be processed again.
    RetryRequired,
}

pub struct ErrorContext<'a> {
    pub error: &'a eyre::Report,
    pub message: &'a IncomingMessage,
    pub transaction: &'a mut TransportTransaction,
    /// Number of processing attempts that have failed, including this one.
    pub attempts: u32,
    pub receive_address: &'a QueueAddress,
    pub context: &'a ContextBag,
}

pub trait ErrorHandler: Send + Sync + 'static {
    fn on_error<'a>(
        &'a self,
        ctx: ErrorContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<ErrorHandleResult>> + Send + 'a>>;
}

/// Retries a message up to `max_attempts` times, then moves it to the error queue.
///
/// The copy written to the error queue carries the failure description, the queue it failed
/// on and the number of attempts as headers. It is written in the receive transaction when
/// there is one, so it only lands in the error queue if the receive commits.
pub struct ImmediateRetries {
    max_attempts: u32,
    error_queue: Arc<TableQueue>,
    pool: SqlitePool,
}

impl ImmediateRetries {
    pub fn new(max_attempts: u32, error_queue: Arc<TableQueue>, pool: SqlitePool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            error_queue,
            pool,
        }
    }

    async fn move_to_error_queue(&self, ctx: ErrorContext<'_>) -> Result<(), Error> {
        let mut outgoing = ctx.message.to_outgoing();
        outgoing
            .headers
            .insert(headers::EXCEPTION_MESSAGE.to_owned(), format!("{:#}", ctx.error));
        outgoing
            .headers
            .insert(headers::FAILED_QUEUE.to_owned(), ctx.receive_address.to_string());
        outgoing
            .headers
            .insert(headers::PROCESSING_ATTEMPTS.to_owned(), ctx.attempts.to_string());

        match ctx.transaction.connection() {
            Some(conn) => self.error_queue.send(&outgoing, None, conn).await?,
            None => {
                let mut conn = self.pool.acquire().await?;
                self.error_queue.send(&outgoing, None, &mut conn).await?
            }
        }

        tracing::warn!(
            message_id = %ctx.message.transport_id(),
            error_queue = %self.error_queue.name(),
            attempts = ctx.attempts,
            error = %ctx.error,
            "Moving message to the error queue"
        );

        Ok(())
    }
}

impl ErrorHandler for ImmediateRetries {
    fn on_error<'a>(
        &'a self,
        ctx: ErrorContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<ErrorHandleResult>> + Send + 'a>> {
        Box::pin(async move {
            if ctx.attempts < self.max_attempts {
                tracing::debug!(
                    message_id = %ctx.message.transport_id(),
                    attempts = ctx.attempts,
                    "Retrying message"
                );
                return Ok(ErrorHandleResult::RetryRequired);
            }

            self.move_to_error_queue(ctx).await?;

            Ok(ErrorHandleResult::Handled)
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        db::{queue::ReceiveResult, schema::create_queue_table, testing::setup_db},
        message::{Headers, MessageRow},
    };

    fn incoming() -> IncomingMessage {
        let row = MessageRow {
            id: "m-1".to_owned(),
            correlation_id: None,
            reply_to_address: None,
            recoverable: true,
            expires: None,
            headers: b"{}".to_vec(),
            body: b"payload".to_vec(),
        };
        IncomingMessage::from_row(&row, Headers::new(), Utc::now())
    }

    #[tokio::test]
    async fn test_immediate_retries_moves_after_last_attempt() {
        let db = setup_db().await;
        let error = QueueAddress::new("error");
        let input = QueueAddress::new("input");
        let mut conn = db.pool.acquire().await.unwrap();
        create_queue_table(&mut conn, &error).await.unwrap();

        let error_queue = Arc::new(TableQueue::new(error));
        let policy = ImmediateRetries::new(2, error_queue.clone(), db.pool.clone());

        let message = incoming();
        let failure = eyre::eyre!("handler exploded");
        let context = ContextBag::new();
        let mut transaction = TransportTransaction::None;

        let first = policy
            .on_error(ErrorContext {
                error: &failure,
                message: &message,
                transaction: &mut transaction,
                attempts: 1,
                receive_address: &input,
                context: &context,
            })
            .await
            .unwrap();
        assert_eq!(first, ErrorHandleResult::RetryRequired);

        let second = policy
            .on_error(ErrorContext {
                error: &failure,
                message: &message,
                transaction: &mut transaction,
                attempts: 2,
                receive_address: &input,
                context: &context,
            })
            .await
            .unwrap();
        assert_eq!(second, ErrorHandleResult::Handled);

        let ReceiveResult::Success(moved) = error_queue.try_receive(&mut conn).await.unwrap() else {
            panic!("expected the failed message in the error queue");
        };
        assert_eq!(moved.transport_id(), "m-1");
        assert_eq!(moved.body().as_ref(), b"payload");
        assert_eq!(
            moved.headers().get(headers::EXCEPTION_MESSAGE).unwrap(),
            "handler exploded"
        );
        assert_eq!(moved.headers().get(headers::FAILED_QUEUE).unwrap(), "input");
        assert_eq!(moved.headers().get(headers::PROCESSING_ATTEMPTS).unwrap(), "2");
    }

    #[test]
    fn test_context_bag() {
        let mut bag = ContextBag::new();
        assert!(bag.is_empty());

        bag.insert("attempt", 3);
        bag.insert("tenant", "acme");
        assert_eq!(bag.len(), 2);
        assert_eq!(bag.get("attempt"), Some(&serde_json::json!(3)));
        assert_eq!(bag.remove("tenant"), Some(serde_json::json!("acme")));
    }
}

//! Transactions a message is received and processed in.
//!
//! Every receive cycle runs inside a [`TransportTransaction`] begun by a
//! [`TransactionScopeProvider`]. The variant decides what the dispatcher can piggyback on and
//! what committing means:
//!
//! - `None`: the handler runs outside any transaction.
//! - `Native`: a database transaction spanning the receive and the handler. When it is
//!   receive-only, outgoing messages are not enlisted in it.
//! - `Scope`: a database transaction that other resources can join through
//!   [`TransactionScope::enlist`], committed with a two-phase protocol.
//!
//! SQLite allows one writer at a time and an open receive transaction holds that lock, so
//! messages that must not join the transaction are held back and sent once it completes.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::{dispatch::AfterCompletion, error::Error};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionMode {
    /// Messages are removed as soon as they are received; handler failures lose the message.
    None,
    /// Receive and handler share a transaction, outgoing messages are sent independently.
    ReceiveOnly,
    /// Receive, handler and outgoing messages share one transaction.
    #[default]
    SendsAtomicWithReceive,
    /// Like `SendsAtomicWithReceive`, with other resources able to enlist.
    TransactionScope,
}

pub enum TransportTransaction {
    None,
    Native {
        tx: Transaction<'static, Sqlite>,
        receive_only: bool,
        after_completion: AfterCompletion,
    },
    Scope(TransactionScope),
}

impl TransportTransaction {
    pub fn native(tx: Transaction<'static, Sqlite>, receive_only: bool) -> Self {
        Self::Native {
            tx,
            receive_only,
            after_completion: AfterCompletion::default(),
        }
    }

    /// The connection of the open database transaction, if there is one.
    pub fn connection(&mut self) -> Option<&mut SqliteConnection> {
        match self {
            Self::None => None,
            Self::Native { tx, .. } => Some(&mut **tx),
            Self::Scope(scope) => Some(scope.connection()),
        }
    }

    /// The connection outgoing messages should be written on to commit atomically with the
    /// receive. `None` for receive-only transactions.
    pub fn enlisted_connection(&mut self) -> Option<&mut SqliteConnection> {
        match self {
            Self::Native {
                receive_only: true, ..
            } => None,
            other => other.connection(),
        }
    }

    pub fn scope(&mut self) -> Option<&mut TransactionScope> {
        match self {
            Self::Scope(scope) => Some(scope),
            _ => None,
        }
    }

    /// Work to run once the transaction has completed, whatever its outcome.
    pub(crate) fn after_completion(&mut self) -> Option<&mut AfterCompletion> {
        match self {
            Self::None => None,
            Self::Native {
                after_completion, ..
            } => Some(after_completion),
            Self::Scope(scope) => Some(&mut scope.after_completion),
        }
    }

    fn take_after_completion(&mut self) -> AfterCompletion {
        self.after_completion()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub async fn commit(mut self) -> Result<(), Error> {
        let after_completion = self.take_after_completion();

        let result = match self {
            Self::None => Ok(()),
            Self::Native { tx, .. } => tx.commit().await.map_err(Error::from),
            Self::Scope(scope) => scope.complete().await,
        };

        after_completion.run(result.is_ok()).await;
        result
    }

    pub async fn rollback(mut self) -> Result<(), Error> {
        let after_completion = self.take_after_completion();

        let result = match self {
            Self::None => Ok(()),
            Self::Native { tx, .. } => tx.rollback().await.map_err(Error::from),
            Self::Scope(scope) => scope.rollback().await,
        };

        after_completion.run(false).await;
        result
    }
}

/// A resource taking part in a [`TransactionScope`].
pub trait Enlistment: Send {
    fn prepare(&mut self) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + '_>>;

    fn commit(&mut self) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + '_>>;

    fn rollback(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// A database transaction other resources can join.
///
/// Committing runs two phases: every enlistment is prepared, then the database transaction
/// commits, then the enlistments commit. A failed prepare, or a scope completed after its
/// deadline, rolls everything back.
pub struct TransactionScope {
    tx: Transaction<'static, Sqlite>,
    enlistments: Vec<Box<dyn Enlistment>>,
    deadline: Instant,
    after_completion: AfterCompletion,
}

impl TransactionScope {
    pub async fn begin(pool: &SqlitePool, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            tx: pool.begin().await?,
            enlistments: Vec::new(),
            deadline: Instant::now() + timeout,
            after_completion: AfterCompletion::default(),
        })
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn enlist(&mut self, enlistment: Box<dyn Enlistment>) {
        if self.enlistments.is_empty() {
            tracing::debug!("Transaction scope promoted to multi-resource coordination");
        }
        self.enlistments.push(enlistment);
    }

    pub fn enlistments(&self) -> usize {
        self.enlistments.len()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    async fn complete(mut self) -> Result<(), Error> {
        if self.is_expired() {
            self.rollback().await?;
            return Err(Error::ScopeTimedOut);
        }

        let mut failed = None;
        for enlistment in self.enlistments.iter_mut() {
            if let Err(e) = enlistment.prepare().await {
                failed = Some(e);
                break;
            }
        }

        if let Some(e) = failed {
            tracing::warn!(error = %e, "Enlisted resource failed to prepare");
            self.rollback().await?;
            return Err(Error::EnlistmentFailed { source: e });
        }

        if let Err(e) = self.tx.commit().await {
            for enlistment in self.enlistments.iter_mut() {
                enlistment.rollback().await;
            }
            return Err(e.into());
        }

        for enlistment in self.enlistments.iter_mut() {
            // The database already committed, so a failure here cannot be undone.
            if let Err(e) = enlistment.commit().await {
                tracing::error!(error = %e, "Enlisted resource failed to commit");
            }
        }

        Ok(())
    }

    async fn rollback(mut self) -> Result<(), Error> {
        for enlistment in self.enlistments.iter_mut() {
            enlistment.rollback().await;
        }
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Begins the transaction each receive cycle runs in.
pub trait TransactionScopeProvider: Send + Sync {
    fn begin<'a>(
        &'a self,
        pool: &'a SqlitePool,
    ) -> Pin<Box<dyn Future<Output = Result<TransportTransaction, Error>> + Send + 'a>>;
}

pub struct NativeTransactionProvider {
    pub receive_only: bool,
}

impl TransactionScopeProvider for NativeTransactionProvider {
    fn begin<'a>(
        &'a self,
        pool: &'a SqlitePool,
    ) -> Pin<Box<dyn Future<Output = Result<TransportTransaction, Error>> + Send + 'a>> {
        Box::pin(async move {
            Ok(TransportTransaction::native(
                pool.begin().await?,
                self.receive_only,
            ))
        })
    }
}

pub struct ScopeTransactionProvider {
    pub timeout: Duration,
}

impl TransactionScopeProvider for ScopeTransactionProvider {
    fn begin<'a>(
        &'a self,
        pool: &'a SqlitePool,
    ) -> Pin<Box<dyn Future<Output = Result<TransportTransaction, Error>> + Send + 'a>> {
        Box::pin(async move {
            Ok(TransportTransaction::Scope(
                TransactionScope::begin(pool, self.timeout).await?,
            ))
        })
    }
}

/// The provider for the transactions receives run in under `mode`.
///
/// Without a transaction mode the receive still runs in a short transaction of its own, so
/// poison and forwarded messages are moved atomically; it is committed before the handler runs.
pub fn provider_for(
    mode: TransactionMode,
    scope_timeout: Duration,
) -> Box<dyn TransactionScopeProvider> {
    match mode {
        TransactionMode::None | TransactionMode::ReceiveOnly => {
            Box::new(NativeTransactionProvider { receive_only: true })
        }
        TransactionMode::SendsAtomicWithReceive => Box::new(NativeTransactionProvider {
            receive_only: false,
        }),
        TransactionMode::TransactionScope => Box::new(ScopeTransactionProvider {
            timeout: scope_timeout,
        }),
    }
}

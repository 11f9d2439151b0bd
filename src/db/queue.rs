//! A queue stored in a single table.
//!
//! Rows are dequeued in insertion order by deleting the row with the lowest `Seq` and
//! returning its previous content in the same statement. All operations run on a connection
//! supplied by the caller, which may be the connection of an open transaction; rolling that
//! transaction back puts a received row back into the queue.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::{Row, SqliteConnection};

use crate::{
    address::QueueAddress,
    error::{is_missing_table, Error},
    message::{IncomingMessage, MessageRow, OutgoingMessage},
};

use super::{add_millis, now_millis, qualified_table, schema_master};

/// Outcome of an attempt to take one message off a queue.
#[derive(Debug)]
pub enum ReceiveResult {
    NoMessage,
    Success(IncomingMessage),
    /// The row could not be deserialized; it is returned unchanged so it can be dead-lettered.
    Poison(MessageRow),
}

#[derive(Debug)]
pub struct TableQueue {
    address: QueueAddress,
    name: String,
    insert_sql: String,
    receive_sql: String,
    peek_sql: String,
    purge_sql: String,
    purge_expired_sql: String,
    expires_index_sql: String,
    exists_sql: String,
}

impl TableQueue {
    pub fn new(address: QueueAddress) -> Self {
        let table = qualified_table(&address);

        Self {
            name: address.to_string(),
            insert_sql: format!(
                "
                INSERT INTO {table}
                    (Id, CorrelationId, ReplyToAddress, Recoverable, Expires, Headers, Body)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "
            ),
            receive_sql: format!(
                "
                DELETE FROM {table}
                WHERE Seq = (SELECT Seq FROM {table} ORDER BY Seq LIMIT 1)
                RETURNING Id, CorrelationId, ReplyToAddress, Recoverable, Expires, Headers, Body
                "
            ),
            peek_sql: format!("SELECT COALESCE(MAX(Seq) - MIN(Seq) + 1, 0) FROM {table}"),
            purge_sql: format!("DELETE FROM {table}"),
            purge_expired_sql: format!(
                "
                DELETE FROM {table}
                WHERE Seq IN (
                    SELECT Seq FROM {table}
                    WHERE Expires IS NOT NULL AND Expires < $1
                    LIMIT $2
                )
                "
            ),
            expires_index_sql: format!(
                "
                SELECT EXISTS(
                    SELECT 1 FROM {}
                    WHERE type = 'index' AND tbl_name = $1 AND sql LIKE '%Expires%'
                )
                ",
                schema_master(&address)
            ),
            exists_sql: format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE type = 'table' AND name = $1)",
                schema_master(&address)
            ),
            address,
        }
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts one message. `time_to_be_received` sets the expiry relative to now.
    pub async fn send(
        &self,
        message: &OutgoingMessage,
        time_to_be_received: Option<Duration>,
        conn: &mut SqliteConnection,
    ) -> Result<(), Error> {
        let headers = serde_json::to_string(&message.headers)?;
        let expires = time_to_be_received.map(|ttbr| add_millis(now_millis(), ttbr));

        sqlx::query(&self.insert_sql)
            .bind(&message.message_id)
            .bind(message.correlation_id())
            .bind(message.reply_to_address())
            .bind(true)
            .bind(expires)
            .bind(headers)
            .bind(message.body.as_ref())
            .execute(conn)
            .await
            .map_err(|e| Error::from_send(&self.name, e))?;

        Ok(())
    }

    pub async fn try_receive(&self, conn: &mut SqliteConnection) -> Result<ReceiveResult, Error> {
        let row = sqlx::query(&self.receive_sql)
            .fetch_optional(conn)
            .await
            .map_err(|e| self.map_error(e))?;

        let Some(row) = row else {
            return Ok(ReceiveResult::NoMessage);
        };

        let row = MessageRow {
            id: row.try_get("Id")?,
            correlation_id: row.try_get("CorrelationId")?,
            reply_to_address: row.try_get("ReplyToAddress")?,
            recoverable: row.try_get("Recoverable")?,
            expires: row.try_get("Expires")?,
            headers: row.try_get_unchecked("Headers")?,
            body: row
                .try_get_unchecked::<Option<Vec<u8>>, _>("Body")?
                .unwrap_or_default(),
        };

        match row.parse_headers() {
            Ok(headers) => Ok(ReceiveResult::Success(IncomingMessage::from_row(
                &row,
                headers,
                Utc::now(),
            ))),
            Err(e) => {
                tracing::warn!(
                    queue = %self.name,
                    message_id = %row.id,
                    error = %e,
                    "Message headers could not be deserialized"
                );
                Ok(ReceiveResult::Poison(row))
            }
        }
    }

    /// Approximate number of rows in the table, used only to size a batch of receives.
    pub async fn try_peek(
        &self,
        conn: &mut SqliteConnection,
        timeout: Duration,
    ) -> Result<u64, Error> {
        let count: i64 = tokio::time::timeout(
            timeout,
            sqlx::query_scalar(&self.peek_sql).fetch_one(conn),
        )
        .await
        .map_err(|_| Error::internal(eyre::eyre!("peek on {} timed out", self.name)))?
        .map_err(|e| self.map_error(e))?;

        Ok(count.max(0) as u64)
    }

    /// Writes a raw row into this queue without reinterpreting it.
    pub async fn dead_letter(
        &self,
        row: &MessageRow,
        conn: &mut SqliteConnection,
    ) -> Result<(), Error> {
        let query = sqlx::query(&self.insert_sql)
            .bind(&row.id)
            .bind(&row.correlation_id)
            .bind(&row.reply_to_address)
            .bind(row.recoverable)
            .bind(row.expires);

        let query = match std::str::from_utf8(&row.headers) {
            Ok(text) => query.bind(text),
            Err(_) => query.bind(row.headers.as_slice()),
        };

        query
            .bind(row.body.as_slice())
            .execute(conn)
            .await
            .map_err(|e| Error::from_send(&self.name, e))?;

        Ok(())
    }

    pub async fn purge(&self, conn: &mut SqliteConnection) -> Result<u64, Error> {
        let result = sqlx::query(&self.purge_sql)
            .execute(conn)
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(result.rows_affected())
    }

    /// Deletes up to `batch_size` rows whose expiry has passed.
    pub async fn purge_expired(
        &self,
        batch_size: u32,
        conn: &mut SqliteConnection,
    ) -> Result<u64, Error> {
        let result = sqlx::query(&self.purge_expired_sql)
            .bind(now_millis())
            .bind(batch_size as i64)
            .execute(conn)
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(result.rows_affected())
    }

    pub async fn has_expires_index(&self, conn: &mut SqliteConnection) -> Result<bool, Error> {
        let exists = sqlx::query_scalar(&self.expires_index_sql)
            .bind(self.address.table())
            .fetch_one(conn)
            .await?;

        Ok(exists)
    }

    /// Whether the queue table exists. A read, so it can run inside a receive transaction.
    pub async fn exists(&self, conn: &mut SqliteConnection) -> Result<bool, Error> {
        let exists = sqlx::query_scalar(&self.exists_sql)
            .bind(self.address.table())
            .fetch_one(conn)
            .await?;

        Ok(exists)
    }

    fn map_error(&self, e: sqlx::Error) -> Error {
        if is_missing_table(&e) {
            Error::queue_not_found(&self.name)
        } else {
            Error::from(e)
        }
    }
}

/// Shares [`TableQueue`] instances, and their rendered statements, by address.
#[derive(Clone, Default)]
pub struct QueueCache {
    queues: Arc<papaya::HashMap<QueueAddress, Arc<TableQueue>>>,
}

impl QueueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &QueueAddress) -> Arc<TableQueue> {
        let queues = self.queues.pin();
        if let Some(queue) = queues.get(address) {
            return queue.clone();
        }

        queues
            .get_or_insert_with(address.clone(), || {
                Arc::new(TableQueue::new(address.clone()))
            })
            .clone()
    }
}

//! Storage for messages whose delivery is postponed.
//!
//! Delayed messages are parked in a per-endpoint table together with their due time and the
//! address of their final destination (in the forward-destination header). Once due, they
//! are moved into the endpoint's own input queue; the receive strategy then forwards them to
//! the final destination.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use crate::{
    address::QueueAddress,
    error::{is_missing_table, Error},
    message::{headers, OutgoingMessage},
};

use super::{now_millis, qualified_table};

#[derive(Debug)]
pub struct DelayedMessageTable {
    address: QueueAddress,
    name: String,
    destination: QueueAddress,
    store_sql: String,
    take_due_sql: String,
    move_sql: String,
    next_due_sql: String,
}

impl DelayedMessageTable {
    /// `destination` is the input queue matured messages are moved into.
    pub fn new(address: QueueAddress, destination: QueueAddress) -> Self {
        let table = qualified_table(&address);
        let target = qualified_table(&destination);

        Self {
            name: address.to_string(),
            store_sql: format!("INSERT INTO {table} (Headers, Body, Due) VALUES ($1, $2, $3)"),
            take_due_sql: format!(
                "
                DELETE FROM {table}
                WHERE Seq IN (
                    SELECT Seq FROM {table}
                    WHERE Due <= $1
                    ORDER BY Due
                    LIMIT $2
                )
                RETURNING Headers, Body
                "
            ),
            move_sql: format!(
                "
                INSERT INTO {target} (Id, Recoverable, Headers, Body)
                VALUES ($1, 1, $2, $3)
                "
            ),
            next_due_sql: format!("SELECT MIN(Due) FROM {table}"),
            address,
            destination,
        }
    }

    pub fn address(&self) -> &QueueAddress {
        &self.address
    }

    /// Parks `message` until `due`, recording `final_destination` for the forwarding step.
    pub async fn store(
        &self,
        message: &OutgoingMessage,
        final_destination: &QueueAddress,
        due: DateTime<Utc>,
        conn: &mut SqliteConnection,
    ) -> Result<(), Error> {
        let mut headers = message.headers.clone();
        headers.insert(
            headers::FORWARD_DESTINATION.to_owned(),
            final_destination.to_string(),
        );
        let headers = serde_json::to_string(&headers)?;

        sqlx::query(&self.store_sql)
            .bind(headers)
            .bind(message.body.as_ref())
            .bind(due.timestamp_millis())
            .execute(conn)
            .await
            .map_err(|e| Error::from_send(&self.name, e))?;

        Ok(())
    }

    /// Moves up to `batch_size` matured messages into the destination queue, each with a
    /// fresh id. Both the delete and the inserts run on `conn`, which is expected to be inside
    /// a transaction.
    pub async fn move_due_messages(
        &self,
        batch_size: u32,
        conn: &mut SqliteConnection,
    ) -> Result<u64, Error> {
        let rows = sqlx::query(&self.take_due_sql)
            .bind(now_millis())
            .bind(batch_size as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| self.map_error(e))?;

        let moved = rows.len() as u64;

        for row in rows {
            let headers: Vec<u8> = row.try_get_unchecked("Headers")?;
            let body: Option<Vec<u8>> = row.try_get_unchecked("Body")?;

            let query = sqlx::query(&self.move_sql).bind(uuid::Uuid::new_v4().to_string());
            let query = match std::str::from_utf8(&headers) {
                Ok(text) => query.bind(text),
                Err(_) => query.bind(headers.as_slice()),
            };

            query
                .bind(body.unwrap_or_default())
                .execute(&mut *conn)
                .await
                .map_err(|e| Error::from_send(self.destination.to_string(), e))?;
        }

        Ok(moved)
    }

    /// Due time of the earliest parked message, if any.
    pub async fn next_due(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let due: Option<i64> = sqlx::query_scalar(&self.next_due_sql)
            .fetch_one(conn)
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(due.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    fn map_error(&self, e: sqlx::Error) -> Error {
        if is_missing_table(&e) {
            Error::queue_not_found(&self.name)
        } else {
            Error::from(e)
        }
    }
}

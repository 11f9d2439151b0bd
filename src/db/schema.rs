//! Table creation helpers.
//!
//! Every statement is `IF NOT EXISTS`, so these can be run on every start.

use sqlx::SqliteConnection;

use crate::{address::QueueAddress, error::Error};

use super::{qualified_object, qualified_table, quote_identifier};

/// Creates a queue table with its ordering column and the index used by the expired message
/// purger.
pub async fn create_queue_table(
    conn: &mut SqliteConnection,
    address: &QueueAddress,
) -> Result<(), Error> {
    sqlx::query(&format!(
        "
        CREATE TABLE IF NOT EXISTS {} (
            Seq INTEGER PRIMARY KEY AUTOINCREMENT,
            Id TEXT NOT NULL,
            CorrelationId TEXT,
            ReplyToAddress TEXT,
            Recoverable INTEGER NOT NULL DEFAULT 1,
            Expires INTEGER,
            Headers TEXT NOT NULL,
            Body BLOB
        )
        ",
        qualified_table(address)
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (Expires) WHERE Expires IS NOT NULL",
        qualified_object(address, "Expires"),
        quote_identifier(address.table())
    ))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn create_delayed_table(
    conn: &mut SqliteConnection,
    address: &QueueAddress,
) -> Result<(), Error> {
    sqlx::query(&format!(
        "
        CREATE TABLE IF NOT EXISTS {} (
            Seq INTEGER PRIMARY KEY AUTOINCREMENT,
            Headers TEXT NOT NULL,
            Body BLOB,
            Due INTEGER NOT NULL
        )
        ",
        qualified_table(address)
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (Due)",
        qualified_object(address, "Due"),
        quote_identifier(address.table())
    ))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn create_subscription_table(
    conn: &mut SqliteConnection,
    address: &QueueAddress,
) -> Result<(), Error> {
    sqlx::query(&format!(
        "
        CREATE TABLE IF NOT EXISTS {} (
            Endpoint TEXT NOT NULL,
            Topic TEXT NOT NULL,
            QueueAddress TEXT NOT NULL,

            PRIMARY KEY (Endpoint, Topic)
        )
        ",
        qualified_table(address)
    ))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::setup_db;

    #[tokio::test]
    async fn test_create_tables_is_repeatable() {
        let db = setup_db().await;
        let mut conn = db.pool.acquire().await.unwrap();

        let queue = QueueAddress::new("orders");
        let delayed = QueueAddress::new("orders.Delayed");
        let subscriptions = QueueAddress::new("Subscriptions");

        for _ in 0..2 {
            create_queue_table(&mut conn, &queue).await.unwrap();
            create_delayed_table(&mut conn, &delayed).await.unwrap();
            create_subscription_table(&mut conn, &subscriptions)
                .await
                .unwrap();
        }

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ($1, $2, $3)",
        )
        .bind("orders")
        .bind("orders.Delayed")
        .bind("Subscriptions")
        .fetch_one(&mut *conn)
        .await
        .unwrap();

        assert_eq!(tables, 3);
    }
}

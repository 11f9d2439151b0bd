//! Subscription table implementation of [`SubscriptionStore`].

use std::{future::Future, pin::Pin};

use futures_util::TryStreamExt;
use sqlx::SqlitePool;

use crate::{address::QueueAddress, error::Error, subscription::SubscriptionStore};

use super::qualified_table;

/// Stores subscriptions in a table keyed by `(Endpoint, Topic)`.
///
/// The table must already exist, see
/// [`create_subscription_table`](super::schema::create_subscription_table).
#[derive(Clone)]
pub struct TableSubscriptionStore {
    pool: SqlitePool,
    subscribe_sql: String,
    unsubscribe_sql: String,
    lookup_sql: String,
}

impl TableSubscriptionStore {
    pub fn new(pool: SqlitePool, table: &QueueAddress) -> Self {
        let table = qualified_table(table);

        Self {
            pool,
            subscribe_sql: format!(
                "
                INSERT INTO {table} (Endpoint, Topic, QueueAddress)
                VALUES ($1, $2, $3)
                ON CONFLICT (Endpoint, Topic) DO UPDATE SET QueueAddress = excluded.QueueAddress
                "
            ),
            unsubscribe_sql: format!("DELETE FROM {table} WHERE Endpoint = $1 AND Topic = $2"),
            // Topics are bound as one JSON array so the statement text does not depend on
            // how many there are.
            lookup_sql: format!(
                "
                SELECT DISTINCT QueueAddress FROM {table}
                WHERE Topic IN (SELECT value FROM json_each($1))
                "
            ),
        }
    }
}

impl SubscriptionStore for TableSubscriptionStore {
    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        address: &'a QueueAddress,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(&self.subscribe_sql)
                .bind(endpoint)
                .bind(topic)
                .bind(address.to_string())
                .execute(&self.pool)
                .await?;

            tracing::debug!(endpoint, topic, %address, "Subscribed");

            Ok(())
        })
    }

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(&self.unsubscribe_sql)
                .bind(endpoint)
                .bind(topic)
                .execute(&self.pool)
                .await?;

            tracing::debug!(endpoint, topic, "Unsubscribed");

            Ok(())
        })
    }

    fn get_subscribers<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueAddress>, Error>> + Send + 'a>> {
        Box::pin(async move {
            if topics.is_empty() {
                return Ok(Vec::new());
            }

            let topics = serde_json::to_string(topics)?;

            let mut rows = sqlx::query_scalar::<_, String>(&self.lookup_sql)
                .bind(topics)
                .fetch(&self.pool);

            let mut subscribers = Vec::new();
            while let Some(address) = rows.try_next().await? {
                match address.parse::<QueueAddress>() {
                    Ok(address) => subscribers.push(address),
                    Err(e) => {
                        tracing::warn!(
                            %address,
                            error = %e,
                            "Ignoring malformed subscriber address"
                        )
                    }
                }
            }

            Ok(subscribers)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{schema::create_subscription_table, testing::setup_db};

    async fn store(pool: &SqlitePool) -> TableSubscriptionStore {
        let table = QueueAddress::new("Subscriptions");
        let mut conn = pool.acquire().await.unwrap();
        create_subscription_table(&mut conn, &table).await.unwrap();
        TableSubscriptionStore::new(pool.clone(), &table)
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let db = setup_db().await;
        let store = store(&db.pool).await;
        let topics = vec!["OrderPlaced".to_owned()];
        let billing = QueueAddress::new("billing");

        store.subscribe("billing", &billing, "OrderPlaced").await.unwrap();
        store.subscribe("billing", &billing, "OrderPlaced").await.unwrap();

        assert_eq!(store.get_subscribers(&topics).await.unwrap(), vec![billing]);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_address() {
        let db = setup_db().await;
        let store = store(&db.pool).await;
        let topics = vec!["OrderPlaced".to_owned()];

        store
            .subscribe("billing", &QueueAddress::new("billing"), "OrderPlaced")
            .await
            .unwrap();
        store
            .subscribe("billing", &QueueAddress::new("billing-v2"), "OrderPlaced")
            .await
            .unwrap();

        assert_eq!(
            store.get_subscribers(&topics).await.unwrap(),
            vec![QueueAddress::new("billing-v2")]
        );
    }

    #[tokio::test]
    async fn test_subscribers_across_topics_are_distinct() {
        let db = setup_db().await;
        let store = store(&db.pool).await;
        let shipping = QueueAddress::new("shipping").with_schema("main");

        store
            .subscribe("shipping", &shipping, "OrderPlaced")
            .await
            .unwrap();
        store
            .subscribe("shipping", &shipping, "OrderCancelled")
            .await
            .unwrap();
        store
            .subscribe("audit", &QueueAddress::new("audit"), "OrderCancelled")
            .await
            .unwrap();

        let mut subscribers = store
            .get_subscribers(&["OrderPlaced".to_owned(), "OrderCancelled".to_owned()])
            .await
            .unwrap();
        subscribers.sort_by_key(|a| a.to_string());
        assert_eq!(subscribers, vec![QueueAddress::new("audit"), shipping]);

        store.unsubscribe("audit", "OrderCancelled").await.unwrap();
        assert_eq!(
            store
                .get_subscribers(&["OrderCancelled".to_owned()])
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.get_subscribers(&[]).await.unwrap().is_empty());
    }
}

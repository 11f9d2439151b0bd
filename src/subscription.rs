//! Publish/subscribe directory.
//!
//! Subscriptions map a topic to the queues of the endpoints interested in it. The dispatcher
//! resolves subscribers on every publish, so membership changes take effect immediately
//! unless a [`CachedSubscriptionStore`] is in front of the table.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{address::QueueAddress, error::Error};

pub use crate::db::subscription::TableSubscriptionStore;

/// A store of (endpoint, topic) → queue address subscriptions.
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Subscribes `endpoint` to `topic`. Subscribing again replaces the stored address.
    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        address: &'a QueueAddress,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

    /// Distinct addresses subscribed to any of `topics`.
    fn get_subscribers<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueAddress>, Error>> + Send + 'a>>;
}

impl<S: SubscriptionStore + ?Sized> SubscriptionStore for Arc<S> {
    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        address: &'a QueueAddress,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        (**self).subscribe(endpoint, address, topic)
    }

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        (**self).unsubscribe(endpoint, topic)
    }

    fn get_subscribers<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueAddress>, Error>> + Send + 'a>> {
        (**self).get_subscribers(topics)
    }
}

/// Serves subscriber lookups from memory.
///
/// The whole cache is dropped once `ttl` has elapsed since it was last cleared, and whenever
/// a subscription is added or removed through this store.
pub struct CachedSubscriptionStore<S> {
    inner: S,
    ttl: Duration,
    entries: papaya::HashMap<String, Arc<Vec<QueueAddress>>>,
    cleared_at: Mutex<Instant>,
}

impl<S: SubscriptionStore> CachedSubscriptionStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: papaya::HashMap::new(),
            cleared_at: Mutex::new(Instant::now()),
        }
    }

    fn clear(&self) {
        self.entries.pin().clear();
        if let Ok(mut cleared_at) = self.cleared_at.lock() {
            *cleared_at = Instant::now();
        }
    }

    fn clear_if_stale(&self) {
        let stale = self
            .cleared_at
            .lock()
            .map(|cleared_at| cleared_at.elapsed() >= self.ttl)
            .unwrap_or(true);

        if stale {
            tracing::trace!("Subscription cache expired");
            self.clear();
        }
    }

    fn cache_key(topics: &[String]) -> String {
        let mut topics = topics.to_vec();
        topics.sort();
        topics.join(",")
    }
}

impl<S: SubscriptionStore> SubscriptionStore for CachedSubscriptionStore<S> {
    fn subscribe<'a>(
        &'a self,
        endpoint: &'a str,
        address: &'a QueueAddress,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.subscribe(endpoint, address, topic).await?;
            self.clear();
            Ok(())
        })
    }

    fn unsubscribe<'a>(
        &'a self,
        endpoint: &'a str,
        topic: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.unsubscribe(endpoint, topic).await?;
            self.clear();
            Ok(())
        })
    }

    fn get_subscribers<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueAddress>, Error>> + Send + 'a>> {
        Box::pin(async move {
            self.clear_if_stale();

            let key = Self::cache_key(topics);
            if let Some(cached) = self.entries.pin().get(&key).cloned() {
                return Ok(cached.as_ref().clone());
            }

            let subscribers = self.inner.get_subscribers(topics).await?;
            self.entries
                .pin()
                .insert(key, Arc::new(subscribers.clone()));

            Ok(subscribers)
        })
    }
}

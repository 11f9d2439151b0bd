//! Per-message failure tracking.
//!
//! When a handler fails inside a receive transaction the transaction is rolled back and the
//! message goes back to the queue. The store remembers, by transport id, what went wrong and
//! how many times, so that the next delivery of the same message can be routed through error
//! handling instead of being retried blindly.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::pipeline::ContextBag;

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub error: Arc<eyre::Report>,
    /// Number of processing attempts that failed so far.
    pub attempts: u32,
    pub context: ContextBag,
    seq: u64,
}

/// Bounded concurrent map of failure records.
///
/// When more than `capacity` records are held, the record created first is evicted.
#[derive(Clone)]
pub struct FailureInfoStore {
    records: Arc<papaya::HashMap<String, FailureRecord>>,
    capacity: usize,
    next_seq: Arc<AtomicU64>,
}

impl FailureInfoStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(papaya::HashMap::new()),
            capacity: capacity.max(1),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self, message_id: &str) -> Option<FailureRecord> {
        self.records.pin().get(message_id).cloned()
    }

    /// Records a failed attempt, returning the updated attempt count.
    pub fn record_failure(
        &self,
        message_id: &str,
        error: eyre::Report,
        context: ContextBag,
    ) -> u32 {
        let error = Arc::new(error);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let attempts = {
            let records = self.records.pin();
            records
                .update_or_insert_with(
                    message_id.to_owned(),
                    |existing| FailureRecord {
                        error: error.clone(),
                        attempts: existing.attempts.saturating_add(1),
                        context: context.clone(),
                        seq: existing.seq,
                    },
                    || FailureRecord {
                        error: error.clone(),
                        attempts: 1,
                        context: context.clone(),
                        seq,
                    },
                )
                .attempts
        };

        self.evict_overflow();

        attempts
    }

    pub fn clear(&self, message_id: &str) {
        self.records.pin().remove(message_id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_overflow(&self) {
        let records = self.records.pin();

        while records.len() > self.capacity {
            let oldest = records
                .iter()
                .min_by_key(|(_, record)| record.seq)
                .map(|(id, _)| id.clone());

            let Some(oldest) = oldest else {
                break;
            };

            tracing::debug!(message_id = %oldest, "Evicting failure record");
            records.remove(&oldest);
        }
    }
}

impl Default for FailureInfoStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

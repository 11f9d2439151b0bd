//! Repeated-failures-over-time circuit breaker.
//!
//! The first failure after a success arms a timer. If no success is reported before the timer
//! fires, the breaker triggers and the critical error callback is invoked with the most recent
//! error. Every failure also delays the caller by `failure_delay`, which throttles tight retry
//! loops against an unhealthy database.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{CriticalError, OnCriticalError};

pub struct RepeatedFailuresOverTimeCircuitBreaker {
    name: String,
    time_to_wait_before_triggering: Duration,
    failure_delay: Duration,
    on_critical_error: OnCriticalError,
    state: Arc<BreakerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct BreakerState {
    failure_count: AtomicU64,
    /// Bumped on every success so that a timer armed before it is ignored.
    generation: AtomicU64,
    triggered: AtomicBool,
    last_error: Mutex<Option<Arc<eyre::Report>>>,
}

#[bon::bon]
impl RepeatedFailuresOverTimeCircuitBreaker {
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        time_to_wait_before_triggering: Duration,
        #[builder(default = Duration::from_secs(1))] failure_delay: Duration,
        on_critical_error: OnCriticalError,
    ) -> Self {
        Self {
            name,
            time_to_wait_before_triggering,
            failure_delay,
            on_critical_error,
            state: Arc::new(BreakerState::default()),
            timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the breaker has triggered and not yet seen a success.
    pub fn triggered(&self) -> bool {
        self.state.triggered.load(Ordering::Acquire)
    }

    pub fn success(&self) {
        let previous = self.state.failure_count.swap(0, Ordering::AcqRel);
        if previous == 0 {
            return;
        }

        self.state.generation.fetch_add(1, Ordering::AcqRel);
        self.state.triggered.store(false, Ordering::Release);
        self.disarm();

        tracing::info!(breaker = %self.name, "Circuit breaker disarmed");
    }

    /// Reports a failure and waits `failure_delay`, or until `cancel` fires.
    pub async fn failure(&self, error: eyre::Report, cancel: &CancellationToken) {
        let error = Arc::new(error);
        if let Ok(mut last) = self.state.last_error.lock() {
            *last = Some(error.clone());
        }

        let previous = self.state.failure_count.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.arm();
            tracing::warn!(
                breaker = %self.name,
                wait = ?self.time_to_wait_before_triggering,
                error = %error,
                "Circuit breaker armed"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(self.failure_delay) => {}
            _ = cancel.cancelled() => {}
        }
    }

    fn arm(&self) {
        let state = self.state.clone();
        let generation = state.generation.load(Ordering::Acquire);
        let wait = self.time_to_wait_before_triggering;
        let name = self.name.clone();
        let on_critical_error = self.on_critical_error.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;

            if state.generation.load(Ordering::Acquire) != generation
                || state.failure_count.load(Ordering::Acquire) == 0
            {
                return;
            }

            state.triggered.store(true, Ordering::Release);

            let last_error = state
                .last_error
                .lock()
                .ok()
                .and_then(|last| last.clone())
                .unwrap_or_else(|| Arc::new(eyre::eyre!("circuit breaker triggered")));

            tracing::error!(breaker = %name, error = %last_error, "Circuit breaker triggered");

            on_critical_error(CriticalError::new(
                format!("{name} circuit breaker triggered after {wait:?} of repeated failures"),
                last_error,
            ));
        });

        if let Ok(mut slot) = self.timer.lock() {
            if let Some(previous) = slot.replace(timer) {
                previous.abort();
            }
        }
    }

    fn disarm(&self) {
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(timer) = slot.take() {
                timer.abort();
            }
        }
    }

    /// Stops the pending timer, if any. The breaker can no longer trigger afterwards unless
    /// a new failure arms it again.
    pub fn dispose(&self) {
        self.disarm();
    }
}

impl Drop for RepeatedFailuresOverTimeCircuitBreaker {
    fn drop(&mut self) {
        self.disarm();
    }
}

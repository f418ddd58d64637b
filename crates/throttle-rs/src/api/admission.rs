//! Dual-reservoir admission control (requests/minute and tokens/minute).
//!
//! Each model gets one [`AdmissionController`] holding two reservoirs. A call
//! is admitted once both hold at least one unit; the request reservoir is
//! charged one unit and the token reservoir one unit as a reservation. When
//! the call finishes it reports its real token usage and the remainder is
//! debited. True usage is unknown until the response arrives, so a single
//! call can overdraw the token reservoir; it clamps at zero and later callers
//! wait for the next refill.
//!
//! Refill is a hard reset on a fixed 60 second clock measured from controller
//! creation, not a continuous trickle. Right after a reset a full window's
//! capacity can be admitted in one burst.
//!
//! A zero-capacity reservoir suspends callers forever. There is no timeout;
//! wrap the call in `tokio::time::timeout` if that matters.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Length of one refill window.
pub const REFILL_INTERVAL: Duration = Duration::from_secs(60);

/// Fraction of the provider's published limit actually used.
pub const DEFAULT_BUFFER_FRACTION: f64 = 0.80;

/// Work that reports how many tokens it consumed once it has run.
pub trait Metered {
    fn tokens_consumed(&self) -> u64;
}

impl Metered for u64 {
    fn tokens_consumed(&self) -> u64 {
        *self
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservoir {
    capacity: u64,
    available: u64,
}

impl Reservoir {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            available: capacity,
        }
    }

    fn refill(&mut self) {
        self.available = self.capacity;
    }

    fn debit(&mut self, units: u64) {
        self.available = self.available.saturating_sub(units);
    }
}

#[derive(Debug)]
struct State {
    requests: Reservoir,
    tokens: Reservoir,
    window: u64,
}

/// Point-in-time view of a controller's reservoirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub requests_available: u64,
    pub request_capacity: u64,
    pub tokens_available: u64,
    pub token_capacity: u64,
}

/// Rate limiter gating every completion call for one model.
#[derive(Debug)]
pub struct AdmissionController {
    model: String,
    epoch: Instant,
    interval: Duration,
    state: Mutex<State>,
}

impl AdmissionController {
    /// Capacity of each reservoir is `floor(limit × buffer_fraction)`.
    pub fn new(
        model: impl Into<String>,
        requests_per_minute: u64,
        tokens_per_minute: u64,
        buffer_fraction: f64,
    ) -> Self {
        let model = model.into();
        let request_capacity = scaled_capacity(requests_per_minute, buffer_fraction);
        let token_capacity = scaled_capacity(tokens_per_minute, buffer_fraction);
        if request_capacity == 0 || token_capacity == 0 {
            warn!(
                "Admission for '{model}' has zero capacity (requests={request_capacity}, \
                 tokens={token_capacity}); calls will wait forever"
            );
        }
        debug!(
            "Admission controller for '{model}': {request_capacity} requests, \
             {token_capacity} tokens per {}s",
            REFILL_INTERVAL.as_secs()
        );
        Self {
            model,
            epoch: Instant::now(),
            interval: REFILL_INTERVAL,
            state: Mutex::new(State {
                requests: Reservoir::new(request_capacity),
                tokens: Reservoir::new(token_capacity),
                window: 0,
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Wait for capacity, run `task`, then debit its actual token usage.
    pub async fn admit<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        T: Metered,
    {
        self.acquire().await;
        let output = task().await;
        let consumed = output.tokens_consumed();
        // One token was reserved on admission.
        self.debit_tokens(consumed.saturating_sub(1));
        output
    }

    /// Charge additional tokens against the current window.
    pub fn debit_tokens(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());
        state.tokens.debit(tokens);
        trace!(
            "Admission '{}': debited {tokens} tokens, {} left",
            self.model, state.tokens.available
        );
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now());
        AdmissionSnapshot {
            requests_available: state.requests.available,
            request_capacity: state.requests.capacity,
            tokens_available: state.tokens.available,
            token_capacity: state.tokens.capacity,
        }
    }

    async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut state = self.lock();
                self.refresh(&mut state, Instant::now());
                if state.requests.available >= 1 && state.tokens.available >= 1 {
                    state.requests.debit(1);
                    state.tokens.debit(1);
                    return;
                }
                self.epoch + self.interval * (state.window as u32 + 1)
            };
            debug!(
                "Admission '{}': reservoirs exhausted, waiting {:?} for refill",
                self.model,
                wake_at.saturating_duration_since(Instant::now())
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    fn refresh(&self, state: &mut State, now: Instant) {
        let elapsed = now.saturating_duration_since(self.epoch);
        let window = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
        if window > state.window {
            state.window = window;
            state.requests.refill();
            state.tokens.refill();
            trace!("Admission '{}': window {window} refilled", self.model);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn scaled_capacity(limit: u64, buffer_fraction: f64) -> u64 {
    (limit as f64 * buffer_fraction).floor().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn capacity_is_floor_of_buffered_limit() {
        let controller = AdmissionController::new("m", 10, 1001, DEFAULT_BUFFER_FRACTION);
        let snap = controller.snapshot();
        assert_eq!(snap.request_capacity, 8);
        assert_eq!(snap.token_capacity, 800);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_capacity_then_waits_for_refill() {
        let controller = Arc::new(AdmissionController::new("m", 3, 1_000, 1.0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller.admit(|| async { 10u64 }).await;
                Instant::now().duration_since(start)
            }));
        }

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.unwrap());
        }
        waits.sort();
        assert!(waits[..3].iter().all(|w| *w < REFILL_INTERVAL));
        assert!(waits[3] >= REFILL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn actual_usage_is_debited_after_the_call() {
        let controller = AdmissionController::new("m", 100, 100, 1.0);
        controller.admit(|| async { 40u64 }).await;
        assert_eq!(controller.snapshot().tokens_available, 60);
        assert_eq!(controller.snapshot().requests_available, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn overdraw_clamps_at_zero_and_blocks_until_refill() {
        let controller = AdmissionController::new("m", 100, 100, 1.0);
        let start = Instant::now();
        controller.admit(|| async { 250u64 }).await;
        assert_eq!(controller.snapshot().tokens_available, 0);

        controller.admit(|| async { 1u64 }).await;
        assert!(start.elapsed() >= REFILL_INTERVAL);
        assert_eq!(controller.snapshot().tokens_available, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_resets_to_capacity_never_above() {
        let controller = AdmissionController::new("m", 5, 50, 1.0);
        controller.admit(|| async { 5u64 }).await;
        tokio::time::advance(REFILL_INTERVAL * 3).await;
        let snap = controller.snapshot();
        assert_eq!(snap.requests_available, 5);
        assert_eq!(snap.tokens_available, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn models_are_independent() {
        let a = AdmissionController::new("a", 1, 100, 1.0);
        let b = AdmissionController::new("b", 1, 100, 1.0);
        let start = Instant::now();
        a.admit(|| async { 1u64 }).await;
        b.admit(|| async { 1u64 }).await;
        assert!(start.elapsed() < REFILL_INTERVAL);
        assert_eq!(a.snapshot().requests_available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_capacity_never_admits() {
        let controller = AdmissionController::new("m", 1, 100, 0.5);
        let result = tokio::time::timeout(
            REFILL_INTERVAL * 5,
            controller.admit(|| async { 1u64 }),
        )
        .await;
        assert!(result.is_err());
    }
}

//! Token and cost accounting, plus run identifiers for log correlation.

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique id for one summarization run or prompt call.
pub fn generate_run_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

/// Cumulative tokens and estimated cost.
///
/// Passed by value through retry attempts and summarization steps so every
/// layer returns exactly what it spent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub tokens_sent: usize,
    pub tokens_received: usize,
    pub cost: f64,
}

impl Usage {
    pub fn new(tokens_sent: usize, tokens_received: usize, cost: f64) -> Self {
        Self {
            tokens_sent,
            tokens_received,
            cost,
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.tokens_sent + self.tokens_received
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0 && self.cost == 0.0
    }

    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        format!(
            "tokens: {} sent + {} received = {} total, est. cost: ${:.4}",
            self.tokens_sent,
            self.tokens_received,
            self.total_tokens(),
            self.cost,
        )
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            tokens_sent: self.tokens_sent + rhs.tokens_sent,
            tokens_received: self.tokens_received + rhs.tokens_received,
            cost: self.cost + rhs.cost,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        assert!(total.is_empty());
        total += Usage::new(1000, 500, 0.01);
        total += Usage::new(2000, 1000, 0.02);
        assert_eq!(total.tokens_sent, 3000);
        assert_eq!(total.tokens_received, 1500);
        assert_eq!(total.total_tokens(), 4500);
        assert!((total.cost - 0.03).abs() < 1e-12);
    }

    #[test]
    fn summary_format() {
        let summary = Usage::new(10, 5, 0.5).summary();
        assert!(summary.contains("15 total"));
        assert!(summary.contains("$0.5000"));
    }
}

//! Token bucket data model and refill arithmetic.
//!
//! The same arithmetic backs the local bucket, the in-memory store and the
//! Lua script run by the Redis store, so all backends agree on every decision.

use crate::clock::NANOS_PER_SEC;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// Marker used for the per-subject bucket shared by all endpoints.
pub const GLOBAL_SCOPE: &str = "global";

/// Capacity and refill rate applied to every bucket of a scope class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct BucketPolicy {
    #[validate(range(exclusive_min = 0.0))]
    pub capacity: f64,
    /// Tokens added per second.
    #[validate(range(min = 0.0))]
    pub refill_rate: f64,
}

impl BucketPolicy {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Time a fully drained bucket needs to become full again.
    pub fn full_refill_time(&self) -> Option<Duration> {
        if self.refill_rate > 0.0 {
            Some(Duration::from_secs_f64(self.capacity / self.refill_rate))
        } else {
            None
        }
    }
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: 3.0,
            refill_rate: 1.0,
        }
    }
}

/// Granularity a bucket is tracked at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// One bucket per subject across every endpoint.
    Global,
    /// One bucket per (subject, endpoint) pair.
    Endpoint(String),
}

impl Scope {
    pub fn endpoint(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == GLOBAL_SCOPE {
            Scope::Global
        } else {
            Scope::Endpoint(name)
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Scope::Global => GLOBAL_SCOPE,
            Scope::Endpoint(name) => name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies exactly one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub subject: String,
    pub scope: Scope,
}

impl BucketKey {
    pub fn new(subject: impl Into<String>, scope: Scope) -> Self {
        Self {
            subject: subject.into(),
            scope,
        }
    }
}

impl fmt::Display for BucketKey {
    // Scope names never contain ':', so the last separator is unambiguous
    // even for IPv6 subjects.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject, self.scope)
    }
}

/// Result of a single admission attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebitOutcome {
    pub admitted: bool,
    /// Tokens left after the attempt.
    pub remaining: f64,
    /// How long until `cost` tokens will be available. `None` when admitted,
    /// or when the cost can never be met.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    /// Unix nanoseconds of the last refill step.
    pub last_refill_at: i64,
}

impl BucketState {
    pub fn full(policy: &BucketPolicy, now: i64) -> Self {
        Self {
            capacity: policy.capacity,
            refill_rate: policy.refill_rate,
            tokens: policy.capacity,
            last_refill_at: now,
        }
    }

    /// Rebuilds state persisted as the `(tokens, last_refill_at)` pair.
    pub fn from_parts(policy: &BucketPolicy, tokens: f64, last_refill_at: i64) -> Self {
        let mut state = Self {
            capacity: policy.capacity,
            refill_rate: policy.refill_rate,
            tokens,
            last_refill_at,
        };
        state.clamp();
        state
    }

    /// Adopts a (possibly reconfigured) policy, keeping tokens within bounds.
    pub fn apply_policy(&mut self, policy: &BucketPolicy) {
        self.capacity = policy.capacity;
        self.refill_rate = policy.refill_rate;
        self.clamp();
    }

    pub fn refill(&mut self, now: i64) {
        let elapsed_nanos = now.saturating_sub(self.last_refill_at).max(0);
        if elapsed_nanos > 0 {
            let elapsed_secs = elapsed_nanos as f64 / NANOS_PER_SEC as f64;
            self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        }
        // A replica with a lagging clock must not move the refill point back.
        self.last_refill_at = self.last_refill_at.max(now);
        self.clamp();
    }

    /// Refill, then debit `cost` tokens if available. Tokens are left
    /// untouched on denial.
    pub fn try_debit(&mut self, cost: f64, now: i64) -> DebitOutcome {
        self.refill(now);

        if self.tokens >= cost {
            self.tokens -= cost;
            DebitOutcome {
                admitted: true,
                remaining: self.tokens,
                retry_after: None,
            }
        } else {
            DebitOutcome {
                admitted: false,
                remaining: self.tokens,
                retry_after: self.time_until_available(cost),
            }
        }
    }

    pub fn time_until_available(&self, cost: f64) -> Option<Duration> {
        if self.tokens >= cost {
            return Some(Duration::ZERO);
        }
        if cost > self.capacity || self.refill_rate <= 0.0 {
            return None;
        }

        let seconds_to_wait = (cost - self.tokens) / self.refill_rate;
        Some(Duration::from_secs_f64(seconds_to_wait))
    }

    /// Time after which an untouched bucket is full again, used as an
    /// eviction hint for backends that support expiry.
    pub fn idle_expiry(&self) -> Option<Duration> {
        BucketPolicy::new(self.capacity, self.refill_rate)
            .full_refill_time()
            .map(|d| d + Duration::from_secs(1))
    }

    fn clamp(&mut self) {
        if !self.tokens.is_finite() || self.tokens < 0.0 {
            self.tokens = 0.0;
        }
        if self.tokens > self.capacity {
            self.tokens = self.capacity;
        }
    }
}

/// Validates a debit cost before it reaches any backend.
pub fn validate_cost(cost: f64) -> Result<(), String> {
    if !cost.is_finite() || cost <= 0.0 {
        return Err(format!("cost must be a positive finite number, got {}", cost));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = NANOS_PER_SEC;

    #[test]
    fn test_full_bucket_creation() {
        let state = BucketState::full(&BucketPolicy::default(), 0);
        assert_eq!(state.tokens, 3.0);
        assert_eq!(state.capacity, 3.0);
        assert_eq!(state.refill_rate, 1.0);
    }

    #[test]
    fn test_debit_and_deny() {
        let mut state = BucketState::full(&BucketPolicy::default(), 0);
        assert!(state.try_debit(1.0, 0).admitted);
        assert!(state.try_debit(1.0, 0).admitted);
        assert!(state.try_debit(1.0, 0).admitted);

        let denied = state.try_debit(1.0, 0);
        assert!(!denied.admitted);
        assert_eq!(denied.remaining, 0.0);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let mut state = BucketState::full(&BucketPolicy::new(5.0, 1000.0), 0);
        state.try_debit(3.0, 0);
        state.refill(10 * SEC);
        assert_eq!(state.tokens, 5.0);
    }

    #[test]
    fn test_refill_never_moves_backwards() {
        let mut state = BucketState::full(&BucketPolicy::default(), 10 * SEC);
        state.try_debit(3.0, 10 * SEC);

        // Skewed clock behind the stored refill point.
        state.refill(5 * SEC);
        assert_eq!(state.last_refill_at, 10 * SEC);
        assert_eq!(state.tokens, 0.0);

        state.refill(11 * SEC);
        assert!((state.tokens - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_denied_debit_leaves_tokens_unchanged() {
        let mut state = BucketState::full(&BucketPolicy::new(2.0, 0.0), 0);
        let outcome = state.try_debit(3.0, 0);
        assert!(!outcome.admitted);
        assert_eq!(state.tokens, 2.0);
        assert_eq!(outcome.retry_after, None);
    }

    #[test]
    fn test_tokens_stay_within_bounds_for_any_sequence() {
        let policy = BucketPolicy::new(4.0, 2.5);
        let mut state = BucketState::full(&policy, 0);
        let mut now = 0;

        for step in 0..500i64 {
            now += (step * 7919) % (SEC / 3);
            let cost = 0.5 + (step % 4) as f64;
            state.try_debit(cost, now);
            assert!(state.tokens >= 0.0 && state.tokens <= state.capacity);
        }
    }

    #[test]
    fn test_admission_ceiling_over_window() {
        // Over T seconds at most C + R*T unit requests are admitted.
        let policy = BucketPolicy::new(3.0, 1.0);
        let mut state = BucketState::full(&policy, 0);
        let window_secs = 10;
        let mut admitted = 0;

        let mut now = 0;
        while now <= window_secs * SEC {
            if state.try_debit(1.0, now).admitted {
                admitted += 1;
            }
            now += SEC / 20;
        }

        assert!(admitted as f64 <= policy.capacity + policy.refill_rate * window_secs as f64);
        assert!(admitted >= 12);
    }

    #[test]
    fn test_policy_change_clamps_tokens() {
        let mut state = BucketState::full(&BucketPolicy::new(10.0, 2.0), 0);
        state.apply_policy(&BucketPolicy::new(3.0, 1.0));
        assert_eq!(state.tokens, 3.0);
        assert_eq!(state.capacity, 3.0);
    }

    #[test]
    fn test_scope_names_and_keys() {
        assert_eq!(Scope::endpoint("global"), Scope::Global);
        assert_eq!(BucketKey::new("u1", Scope::Global).to_string(), "u1:global");
        assert_eq!(
            BucketKey::new("::1", Scope::endpoint("create-address")).to_string(),
            "::1:create-address"
        );
    }

    #[test]
    fn test_policy_validation() {
        assert!(BucketPolicy::new(3.0, 1.0).validate().is_ok());
        assert!(BucketPolicy::new(0.0, 1.0).validate().is_err());
        assert!(BucketPolicy::new(3.0, -1.0).validate().is_err());
    }

    #[test]
    fn test_validate_cost() {
        assert!(validate_cost(1.0).is_ok());
        assert!(validate_cost(0.0).is_err());
        assert!(validate_cost(f64::NAN).is_err());
    }
}

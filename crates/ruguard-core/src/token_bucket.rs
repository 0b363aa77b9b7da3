//! Token bucket behind per-group RU admission.
//!
//! A bucket holds up to `capacity` request units and refills at `refill_rate`
//! units per second. Refill is lazy: every call first credits the time since
//! the previous call, so no timer thread is involved and callers pass the
//! clock in.
//!
//! A request larger than the capacity is admitted once the bucket is full and
//! drives the balance negative; later refills repay the debt before anything
//! else is admitted.
//!
//! - **Group admission**: one bucket per resource group, refilled at `RU_PER_SEC`.
//! - **Moderated burst**: capacity is recomputed on every consume via
//!   [`TokenBucket::set_capacity`].
//! - **Background work**: a second bucket nested under the group bucket
//!   ([`try_acquire_nested`]) caps background tasks at a utilization share.

use serde::{Deserialize, Serialize};

// =============================================================================
// TokenBucket
// =============================================================================

/// Lazily refilled RU bucket. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Units per second.
    refill_rate: f64,
    /// Negative while repaying an oversized request.
    tokens: f64,
    last_refill_ms: u64,
    total_consumed: u64,
    total_denied: u64,
}

impl TokenBucket {
    /// # Panics
    ///
    /// Panics if `capacity` or `refill_rate` is not positive.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, now_ms: u64) -> Self {
        assert!(capacity > 0.0, "capacity must be positive");
        assert!(refill_rate > 0.0, "refill_rate must be positive");
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill_ms: now_ms,
            total_consumed: 0,
            total_denied: 0,
        }
    }

    /// Credit the units earned since the last call. A clock that went
    /// backwards earns nothing.
    fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let earned = (now_ms - self.last_refill_ms) as f64 * self.refill_rate / 1000.0;
        self.tokens = (self.tokens + earned).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Balance needed before `cost` is admitted; oversized costs need a full
    /// bucket.
    fn required(&self, cost: u64) -> f64 {
        (cost as f64).min(self.capacity)
    }

    /// Whether `cost` could be admitted right now, without consuming.
    pub fn can_acquire(&mut self, cost: u64, now_ms: u64) -> bool {
        self.refill(now_ms);
        self.tokens >= self.required(cost)
    }

    /// Consume `cost` if the balance allows it. Never blocks.
    pub fn try_acquire(&mut self, cost: u64, now_ms: u64) -> bool {
        if self.can_acquire(cost, now_ms) {
            self.tokens -= cost as f64;
            self.total_consumed += cost;
            true
        } else {
            self.total_denied += 1;
            false
        }
    }

    /// Milliseconds until `cost` would be admitted; 0 when it already would.
    #[must_use]
    pub fn wait_time_ms(&mut self, cost: u64, now_ms: u64) -> u64 {
        self.refill(now_ms);
        let deficit = self.required(cost) - self.tokens;
        if deficit <= 0.0 {
            0
        } else {
            (deficit * 1000.0 / self.refill_rate).ceil() as u64
        }
    }

    /// Change the capacity, refilling up to `now_ms` under the old capacity
    /// first. Shrinking clamps the current balance.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not positive.
    pub fn set_capacity(&mut self, capacity: f64, now_ms: u64) {
        assert!(capacity > 0.0, "capacity must be positive");
        self.refill(now_ms);
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
    }

    /// Snapshot as of the last call; does not refill.
    #[must_use]
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            current_tokens: self.tokens,
            total_consumed: self.total_consumed,
            total_denied: self.total_denied,
            fill_ratio: self.tokens / self.capacity,
        }
    }
}

// =============================================================================
// Nested acquisition
// =============================================================================

/// Outcome of charging a background bucket and its group bucket together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NestedResult {
    Allowed,
    /// The background share is spent.
    DeniedLocal { wait_ms: u64 },
    /// The group itself is out of units.
    DeniedGlobal { wait_ms: u64 },
}

impl NestedResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, NestedResult::Allowed)
    }
}

/// Charge `cost` to both `local` and `global`, or to neither.
pub fn try_acquire_nested(
    local: &mut TokenBucket,
    global: &mut TokenBucket,
    cost: u64,
    now_ms: u64,
) -> NestedResult {
    let local_ok = local.can_acquire(cost, now_ms);
    let global_ok = global.can_acquire(cost, now_ms);

    if local_ok && global_ok {
        local.try_acquire(cost, now_ms);
        global.try_acquire(cost, now_ms);
        NestedResult::Allowed
    } else if !local_ok {
        local.total_denied += 1;
        NestedResult::DeniedLocal {
            wait_ms: local.wait_time_ms(cost, now_ms),
        }
    } else {
        global.total_denied += 1;
        NestedResult::DeniedGlobal {
            wait_ms: global.wait_time_ms(cost, now_ms),
        }
    }
}

// =============================================================================
// BucketStats (serializable)
// =============================================================================

/// Serializable bucket counters, reported per group by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub capacity: f64,
    /// Units per second.
    pub refill_rate: f64,
    pub current_tokens: f64,
    pub total_consumed: u64,
    pub total_denied: u64,
    /// `current_tokens / capacity`; negative while in debt.
    pub fill_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Spend everything so the next checks start from zero.
    fn drained(capacity: f64, rate: f64, now_ms: u64) -> TokenBucket {
        let mut b = TokenBucket::new(capacity, rate, now_ms);
        assert!(b.try_acquire(capacity as u64, now_ms));
        b
    }

    // -- Basic ------------------------------------------------------------------

    #[test]
    fn new_bucket_is_full() {
        let s = TokenBucket::new(10.0, 5.0, 0).stats();
        assert!((s.capacity - 10.0).abs() < f64::EPSILON);
        assert!((s.refill_rate - 5.0).abs() < f64::EPSILON);
        assert!((s.fill_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn acquire_depletes_tokens() {
        let mut b = TokenBucket::new(3.0, 1.0, 0);
        assert!(b.try_acquire(1, 0));
        assert!(b.try_acquire(1, 0));
        assert!(b.try_acquire(1, 0));
        assert!(!b.try_acquire(1, 0));
        let s = b.stats();
        assert_eq!(s.total_consumed, 3);
        assert_eq!(s.total_denied, 1);
    }

    #[test]
    fn refill_over_time() {
        let mut b = drained(10.0, 10.0, 0);
        assert!(!b.try_acquire(1, 0));

        // 500ms at 10/sec → 5 units.
        assert!(b.try_acquire(5, 500));
        assert!(!b.try_acquire(1, 500));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let mut b = drained(5.0, 100.0, 0);
        assert!(b.can_acquire(5, 10_000));
        assert!((b.stats().current_tokens - 5.0).abs() < 0.01);
    }

    #[test]
    fn clock_going_backwards_does_not_refill() {
        let mut b = drained(10.0, 10.0, 1_000);
        assert!(!b.can_acquire(1, 500));
        assert!(b.stats().current_tokens.abs() < f64::EPSILON);
    }

    // -- Oversized requests -----------------------------------------------------

    #[test]
    fn oversized_request_admitted_when_full_then_repays() {
        let mut b = TokenBucket::new(100.0, 100.0, 0);
        assert!(b.try_acquire(250, 0));
        assert!(b.stats().current_tokens < 0.0);
        assert!(!b.try_acquire(1, 1000));
        // 150 debt + 1 unit at 100/sec → 1510ms.
        assert_eq!(b.wait_time_ms(1, 1000), 510);
        assert!(b.try_acquire(1, 1510));
    }

    #[test]
    fn oversized_request_waits_for_full_bucket() {
        let mut b = TokenBucket::new(100.0, 100.0, 0);
        b.try_acquire(50, 0);
        assert!(!b.try_acquire(500, 0));
        assert_eq!(b.wait_time_ms(500, 0), 500);
    }

    // -- Wait time --------------------------------------------------------------

    #[test]
    fn wait_time_when_available() {
        let mut b = TokenBucket::new(10.0, 5.0, 0);
        assert_eq!(b.wait_time_ms(1, 0), 0);
    }

    #[test]
    fn wait_time_partial() {
        let mut b = drained(10.0, 2.0, 0);
        assert_eq!(b.wait_time_ms(5, 0), 2500);
    }

    // -- Dynamic capacity -------------------------------------------------------

    #[test]
    fn set_capacity_grows_headroom() {
        let mut b = drained(100.0, 100.0, 0);
        b.set_capacity(300.0, 0);
        // Balance is untouched; refill may now reach the larger cap.
        assert!(b.stats().current_tokens.abs() < f64::EPSILON);
        assert!(b.can_acquire(300, 5_000));
        assert!((b.stats().current_tokens - 300.0).abs() < 0.01);
    }

    #[test]
    fn set_capacity_shrink_clamps_tokens() {
        let mut b = TokenBucket::new(300.0, 100.0, 0);
        b.set_capacity(100.0, 0);
        assert!((b.stats().current_tokens - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_serde_roundtrip() {
        let s = TokenBucket::new(10.0, 5.0, 0).stats();
        let json = serde_json::to_string(&s).unwrap();
        let back: BucketStats = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    // -- Nested -----------------------------------------------------------------

    #[test]
    fn nested_both_allow() {
        let mut local = TokenBucket::new(5.0, 2.0, 0);
        let mut global = TokenBucket::new(50.0, 20.0, 0);
        assert!(try_acquire_nested(&mut local, &mut global, 1, 0).is_allowed());
        assert_eq!(local.stats().total_consumed, 1);
        assert_eq!(global.stats().total_consumed, 1);
    }

    #[test]
    fn nested_local_denied_reports_wait() {
        let mut local = drained(5.0, 1.0, 0);
        let mut global = TokenBucket::new(50.0, 20.0, 0);
        assert_eq!(
            try_acquire_nested(&mut local, &mut global, 1, 0),
            NestedResult::DeniedLocal { wait_ms: 1000 }
        );
        assert_eq!(global.stats().total_consumed, 0);
    }

    #[test]
    fn nested_global_denied_consumes_nothing() {
        let mut local = TokenBucket::new(5.0, 2.0, 0);
        let mut global = drained(50.0, 20.0, 0);
        let result = try_acquire_nested(&mut local, &mut global, 1, 0);
        assert!(matches!(result, NestedResult::DeniedGlobal { .. }));
        assert_eq!(local.stats().total_consumed, 0);
        assert_eq!(global.stats().total_denied, 1);
    }

    // -- Panics -----------------------------------------------------------------

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _ = TokenBucket::new(0.0, 1.0, 0);
    }

    #[test]
    #[should_panic(expected = "refill_rate must be positive")]
    fn zero_rate_panics() {
        let _ = TokenBucket::new(10.0, 0.0, 0);
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Token bucket rate limiting.
//!
//! Buckets refill continuously: `requests / window` tokens per second,
//! clamped at `requests` capacity. A rejected acquire reports how long
//! until the next token is available.

use std::time::{Duration, Instant};

/// A continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    /// A bucket admitting `requests` operations per `window`, starting full.
    #[must_use]
    pub fn new(requests: u64, window: Duration) -> Self {
        let capacity = requests.max(1);
        let window_secs = window.as_secs_f64().max(0.001);
        Self {
            capacity,
            tokens: capacity as f64,
            last_refill: Instant::now(),
            refill_rate: capacity as f64 / window_secs,
        }
    }

    /// A bucket expressed directly as a rate (`per_second` tokens/second).
    #[must_use]
    pub fn per_second(per_second: f64) -> Self {
        let rate = if per_second.is_finite() && per_second > 0.0 {
            per_second
        } else {
            1.0
        };
        let capacity = rate.ceil().max(1.0) as u64;
        Self {
            capacity,
            tokens: capacity as f64,
            last_refill: Instant::now(),
            refill_rate: rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let updated = self.tokens + elapsed * self.refill_rate;
        self.tokens = updated.clamp(0.0, self.capacity as f64);
        self.last_refill = now;
    }

    /// Consume one token, or report how long until one is available.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_secs = deficit / self.refill_rate;
            Err(Duration::from_secs_f64(wait_secs.max(0.001)))
        }
    }

    /// Tokens currently available (after refill).
    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens as u64
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full_and_drains() {
        let mut bucket = TokenBucket::new(3, Duration::from_secs(1));
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());
    }

    #[test]
    fn test_rejection_reports_refill_time() {
        let mut bucket = TokenBucket::new(1, Duration::from_secs(1));
        assert!(bucket.try_acquire().is_ok());
        let wait = bucket.try_acquire().unwrap_err();
        // One token per second: the wait is at most a second.
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_bucket_refills_continuously() {
        let mut bucket = TokenBucket::new(10, Duration::from_millis(100));
        for _ in 0..10 {
            assert!(bucket.try_acquire().is_ok());
        }
        assert!(bucket.try_acquire().is_err());

        // A full window elapses; the bucket is full again.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(bucket.available(), 10);
    }

    #[test]
    fn test_window_admission_bound() {
        // In any window, admitted <= requests (starting from a full bucket
        // with no elapsed time to refill).
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1000));
        let mut admitted = 0;
        for _ in 0..10 {
            if bucket.try_acquire().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_per_second_rejects_bad_rates() {
        let mut bucket = TokenBucket::per_second(f64::NAN);
        // Falls back to 1/s rather than panicking or dividing by zero.
        assert!(bucket.try_acquire().is_ok());
    }
}

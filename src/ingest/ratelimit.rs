// Per-project token bucket rate limiting for the ingest surface.
//
// Refill is rate_limit_per_minute / 60 tokens per second; capacity is twice
// the per-minute rate so short bursts are absorbed without sustained overrun.

use dashmap::DashMap;
use std::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Denied; retry after this many whole seconds.
    Limited { retry_after_secs: u64 },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct ProjectRateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl Default for ProjectRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, project_id: &str, per_minute: u32) -> RateDecision {
        self.check_at(project_id, per_minute, Instant::now())
    }

    /// Time-injectable variant used by tests.
    pub fn check_at(&self, project_id: &str, per_minute: u32, now: Instant) -> RateDecision {
        if per_minute == 0 {
            return RateDecision::Limited {
                retry_after_secs: 60,
            };
        }
        let refill_per_sec = per_minute as f64 / 60.0;
        let capacity = (per_minute as f64) * 2.0;

        let mut bucket = self.buckets.entry(project_id.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / refill_per_sec).ceil().max(1.0) as u64;
            RateDecision::Limited { retry_after_secs }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_capacity_is_twice_rate() {
        let limiter = ProjectRateLimiter::new();
        let now = Instant::now();

        // 60/min -> capacity 120
        for _ in 0..120 {
            assert_eq!(limiter.check_at("p1", 60, now), RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.check_at("p1", 60, now),
            RateDecision::Limited { .. }
        ));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = ProjectRateLimiter::new();
        let now = Instant::now();

        for _ in 0..120 {
            limiter.check_at("p1", 60, now);
        }
        assert!(matches!(
            limiter.check_at("p1", 60, now),
            RateDecision::Limited { .. }
        ));

        // one second of refill at 1 token/sec
        let later = now + Duration::from_secs(1);
        assert_eq!(limiter.check_at("p1", 60, later), RateDecision::Allowed);
    }

    #[test]
    fn test_retry_after_reflects_deficit() {
        let limiter = ProjectRateLimiter::new();
        let now = Instant::now();

        // 6/min -> 0.1 tokens/sec, capacity 12
        for _ in 0..12 {
            limiter.check_at("p1", 6, now);
        }
        match limiter.check_at("p1", 6, now) {
            RateDecision::Limited { retry_after_secs } => {
                assert!(retry_after_secs >= 10, "got {retry_after_secs}");
            }
            RateDecision::Allowed => panic!("expected limit"),
        }
    }

    #[test]
    fn test_projects_are_independent() {
        let limiter = ProjectRateLimiter::new();
        let now = Instant::now();
        for _ in 0..120 {
            limiter.check_at("p1", 60, now);
        }
        assert!(matches!(
            limiter.check_at("p1", 60, now),
            RateDecision::Limited { .. }
        ));
        assert_eq!(limiter.check_at("p2", 60, now), RateDecision::Allowed);
    }
}

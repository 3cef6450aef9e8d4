//! Token-bucket rate limiter and the ISO-8601 duration parsing used to
//! resolve carrier-supplied `retryAfter` values.
//!
//! Grounded on the teacher's `rate_limiter.rs` (struct + `check`-style API +
//! inline `#[cfg(test)]` module) but adapted from that file's fixed-window
//! counter to the proportional-refill token-bucket semantics this bridge
//! needs, since the carrier and provider APIs both speak token buckets.

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::DurationParseError;

/// A token bucket: `capacity` tokens max, refilling at `rate` tokens/sec.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Attempt to consume one token. Returns `true` if admitted.
    pub fn acquire(&mut self) -> bool {
        self.acquire_at(Instant::now())
    }

    fn acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token count, mostly useful for logging ("current rate: x/s").
    pub fn current_tokens(&self) -> f64 {
        self.tokens
    }
}

/// Parse an ISO-8601 duration like `PT2S`, `PT1M30S`, or `P1DT1H` into seconds.
/// Falls back to a bare numeric string (`"2.5"`) if the ISO form doesn't match,
/// mirroring the source integration's HTTP `Retry-After` handling which
/// accepts both forms.
pub fn parse_iso8601_duration(input: &str) -> Result<f64, DurationParseError> {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^P(?:(\d+)D)?T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?$").unwrap()
    });

    if let Some(caps) = RE.captures(input) {
        let days: f64 = caps.get(1).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
        let hours: f64 = caps.get(2).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
        let minutes: f64 = caps.get(3).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
        let seconds: f64 = caps.get(4).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));

        if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() && caps.get(4).is_none() {
            return Err(DurationParseError::InvalidFormat(input.to_string()));
        }

        return Ok(days * 86400.0 + hours * 3600.0 + minutes * 60.0 + seconds);
    }

    input
        .parse::<f64>()
        .map_err(|_| DurationParseError::InvalidFormat(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn acquires_up_to_burst_capacity_then_denies() {
        let mut limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.acquire_at(Instant::now()));
        assert!(limiter.acquire_at(Instant::now()));
        assert!(limiter.acquire_at(Instant::now()));
        assert!(!limiter.acquire_at(Instant::now()));
    }

    #[test]
    fn refills_proportionally_to_elapsed_time() {
        let mut limiter = RateLimiter::new(2.0, 2.0);
        let t0 = Instant::now();
        assert!(limiter.acquire_at(t0));
        assert!(limiter.acquire_at(t0));
        assert!(!limiter.acquire_at(t0));

        let t1 = t0 + Duration::from_millis(600); // 1.2 tokens refilled
        assert!(limiter.acquire_at(t1));
        assert!(!limiter.acquire_at(t1));
    }

    #[test]
    fn parses_seconds_only() {
        assert_eq!(parse_iso8601_duration("PT3S").unwrap(), 3.0);
    }

    #[test]
    fn parses_minutes_and_seconds() {
        assert_eq!(parse_iso8601_duration("PT1M30S").unwrap(), 90.0);
    }

    #[test]
    fn parses_days_and_hours() {
        assert_eq!(parse_iso8601_duration("P1DT1H").unwrap(), 90000.0);
    }

    #[test]
    fn falls_back_to_numeric_seconds() {
        assert_eq!(parse_iso8601_duration("2.5").unwrap(), 2.5);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_iso8601_duration("not-a-duration").is_err());
    }
}

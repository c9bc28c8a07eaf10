//! Keyed admission control.
//!
//! A [`RateLimiterCollection`] maps keys to [`RateLimiter`]s. Keys without a limiter are never
//! throttled. The provided limiter is a [`TokenBucket`].
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;

/// The source of the current time for rate limiting.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait RateLimiter {
    /// Checks whether a request can be allowed, consuming a token if so.
    fn allow(&mut self) -> bool;
}

/// A token bucket holding up to `capacity` tokens and refilled at `rate` tokens per second.
///
/// The bucket starts full. Tokens are only added in whole units, and the refill time only moves
/// forward once at least one token was added, so slow trickles still accumulate.
#[derive(Debug, Clone)]
pub struct TokenBucket<C = SystemClock> {
    rate: f64,
    capacity: u64,
    tokens: u64,
    last_refill: DateTime<Utc>,
    clock: C,
}

impl<C: Clock> TokenBucket<C> {
    pub fn new(rate: f64, capacity: u64, clock: C) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: clock.now(),
            clock,
        }
    }

    fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = (now - self.last_refill)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        let to_add = (elapsed * self.rate) as u64;
        if to_add > 0 {
            self.tokens = self.tokens.saturating_add(to_add).min(self.capacity);
            self.last_refill = now;
        }
    }
}

impl<C: Clock> RateLimiter for TokenBucket<C> {
    fn allow(&mut self) -> bool {
        self.refill();
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct RateLimiterCollection {
    limiters: FxHashMap<String, Box<dyn RateLimiter + Send>>,
}

impl RateLimiterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the limiter for `key`, replacing any previous one.
    pub fn register(&mut self, key: impl Into<String>, limiter: impl RateLimiter + Send + 'static) {
        self.limiters.insert(key.into(), Box::new(limiter));
    }

    pub fn allow(&mut self, key: &str) -> bool {
        match self.limiters.get_mut(key) {
            Some(limiter) => limiter.allow(),
            None => true,
        }
    }
}

//! Token-bucket rate limiter, one bucket per endpoint class.
//!
//! No outbound request escapes the limiter: the gateway acquires on the
//! place/cancel buckets, the REST catalogue/rehydration paths on the read
//! bucket. Bucket arithmetic is pure over an explicit `now` so tests drive
//! it without sleeping; the async `acquire` wrapper sleeps until the next
//! refill slot.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    OrderPlace,
    OrderCancel,
    Read,
}

#[derive(Debug)]
struct Bucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_sec: f64, burst: f64, now: Instant) -> Self {
        Self {
            rate_per_sec,
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
    }

    /// Take one token, or report how long until the next one exists.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }
}

pub struct RateLimiter {
    place: Mutex<Bucket>,
    cancel: Mutex<Bucket>,
    read: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(cfg: &crate::config::RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            place: Mutex::new(Bucket::new(cfg.place_per_sec, cfg.place_burst, now)),
            cancel: Mutex::new(Bucket::new(cfg.cancel_per_sec, cfg.cancel_burst, now)),
            read: Mutex::new(Bucket::new(cfg.read_per_sec, cfg.read_burst, now)),
        }
    }

    fn bucket(&self, class: EndpointClass) -> &Mutex<Bucket> {
        match class {
            EndpointClass::OrderPlace => &self.place,
            EndpointClass::OrderCancel => &self.cancel,
            EndpointClass::Read => &self.read,
        }
    }

    /// Block (asynchronously) until a token is available. The lock is held
    /// only across the bucket arithmetic, never across the sleep.
    pub async fn acquire(&self, class: EndpointClass) {
        loop {
            let wait = {
                let mut bucket = self.bucket(class).lock();
                match bucket.try_acquire(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            sleep(wait).await;
        }
    }

    /// Non-blocking probe, used by tests and the janitor's opportunistic
    /// sweeps.
    pub fn try_acquire(&self, class: EndpointClass, now: Instant) -> bool {
        self.bucket(class).lock().try_acquire(now).is_ok()
    }
}

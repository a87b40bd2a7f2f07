//! Process wide rate limiting.
//!
//! Upload and download each get a token bucket shared by every peer session
//! through an `Arc`. Consumers call the non-blocking [`Throttle::acquire`]
//! before putting bytes on (or committing to read bytes off) the wire; a zero
//! grant means the consumer should back off and retry on its next tick.

use std::sync::Mutex;

use tokio::time::Instant;

/// A token bucket refilled from elapsed wall clock time.
///
/// The bucket holds at most one second's worth of tokens so that an idle
/// period cannot be followed by an arbitrarily large burst.
#[derive(Debug)]
pub(crate) struct Throttle {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Refill rate in bytes per second. 0 means unlimited.
    rate: u64,
    /// Currently available tokens.
    tokens: u64,
    /// When the bucket was last refilled.
    last_refill: Instant,
}

impl Throttle {
    /// Creates a throttle with the given rate in bytes per second, 0 meaning
    /// unlimited.
    pub fn new(rate: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes up to `want` bytes worth of tokens from the bucket and returns
    /// how many were granted. Never blocks.
    pub fn acquire(&self, want: usize) -> usize {
        self.acquire_at(Instant::now(), want)
    }

    fn acquire_at(&self, now: Instant, want: usize) -> usize {
        let mut bucket = self.bucket.lock().unwrap();
        if bucket.rate == 0 {
            return want;
        }

        bucket.refill(now);

        let granted = bucket.tokens.min(want as u64);
        bucket.tokens -= granted;
        granted as usize
    }
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if refill > 0 {
            // cap at one second's worth of burst
            self.tokens = (self.tokens + refill).min(self.rate);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_unlimited_grants_everything() {
        let throttle = Throttle::new(0);
        assert_eq!(throttle.acquire(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_grants_are_bounded_by_tokens() {
        let throttle = Throttle::new(1000);
        let now = Instant::now();

        // the bucket starts full
        assert_eq!(throttle.acquire_at(now, 600), 600);
        assert_eq!(throttle.acquire_at(now, 600), 400);
        // drained
        assert_eq!(throttle.acquire_at(now, 600), 0);
    }

    #[test]
    fn test_refill_from_elapsed_time() {
        let throttle = Throttle::new(1000);
        let now = Instant::now();
        assert_eq!(throttle.acquire_at(now, 1000), 1000);

        // half a second refills half the bucket
        let later = now + Duration::from_millis(500);
        assert_eq!(throttle.acquire_at(later, 1000), 500);
    }

    #[test]
    fn test_burst_is_capped_at_one_second() {
        let throttle = Throttle::new(1000);
        let now = Instant::now();
        assert_eq!(throttle.acquire_at(now, 1000), 1000);

        // a long idle period must not accumulate more than one second's
        // worth of tokens
        let much_later = now + Duration::from_secs(3600);
        assert_eq!(throttle.acquire_at(much_later, 5000), 1000);
    }
}

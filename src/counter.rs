//! Byte accounting: running totals and exponentially averaged transfer
//! rates.
//!
//! Each peer session keeps a [`Rate`] per direction to size its request
//! pipeline and detect snubbing, and publishes its running totals through a
//! shared [`Tally`] that the torrent reads when ranking peers for the choke
//! cycle.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::time::Instant;

/// The time constant of the [`Rate`] average: contributions decay to 1/e of
/// their weight over this span.
const RATE_WINDOW: Duration = Duration::from_secs(30);

/// A running total and an exponentially weighted moving average of the
/// transfer rate, for one direction of one connection.
///
/// Each recorded transfer adds `bytes / window` to the estimate and the
/// whole estimate decays by `exp(-elapsed / window)` as time passes, so a
/// steady stream converges on its true byte rate while a burst fades out
/// smoothly instead of falling off a cliff when it leaves a cutoff window.
/// A fresh connection intentionally ramps up from zero: an understated rate
/// only means a shorter request pipeline at first, which is the slow start
/// we want anyway.
#[derive(Debug)]
pub(crate) struct Rate {
    total: u64,
    /// The decayed rate estimate, in bytes per second, as of `last_update`.
    rate: f64,
    last_update: Instant,
}

impl Rate {
    pub fn new() -> Self {
        Self {
            total: 0,
            rate: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Records that `bytes` were transferred just now.
    pub fn add(&mut self, bytes: u64) {
        self.add_at(Instant::now(), bytes);
    }

    fn add_at(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.rate = self.decayed_rate(now);
        self.last_update = now;
        self.rate += bytes as f64 / RATE_WINDOW.as_secs_f64();
    }

    /// The total number of bytes recorded over the counter's lifetime.
    /// Monotonic.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The exponentially averaged transfer rate, in bytes per second.
    pub fn avg(&self) -> u64 {
        self.avg_at(Instant::now())
    }

    fn avg_at(&self, now: Instant) -> u64 {
        self.decayed_rate(now) as u64
    }

    /// The estimate brought forward to `now` by applying the exponential
    /// decay for the time that has passed since the last update.
    fn decayed_rate(&self, now: Instant) -> f64 {
        let elapsed = now
            .saturating_duration_since(self.last_update)
            .as_secs_f64();
        self.rate * (-elapsed / RATE_WINDOW.as_secs_f64()).exp()
    }
}

/// Connection transfer totals shared between a peer session and its torrent.
///
/// The session adds observed socket bytes, the torrent's choke cycle reads
/// the totals and differentiates them against its previous snapshot.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    down: AtomicU64,
    up: AtomicU64,
}

impl Tally {
    pub fn add_down(&self, bytes: u64) {
        self.down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_up(&self, bytes: u64) {
        self.up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }

    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_total_is_monotonic() {
        let mut rate = Rate::new();
        let start = Instant::now();
        for i in 0..10 {
            rate.add_at(start + Duration::from_secs(i), 100);
            assert_eq!(rate.total(), (i + 1) * 100);
        }
    }

    #[test]
    fn test_burst_equals_bytes_over_window() {
        let mut rate = Rate::new();
        let start = Instant::now();
        // a single 30 KiB impulse contributes bytes / window
        rate.add_at(start, 30 * 1024);
        assert_eq!(rate.avg_at(start), 1024);
    }

    #[test]
    fn test_rate_decays_exponentially() {
        let mut rate = Rate::new();
        let start = Instant::now();
        rate.add_at(start, 30 * 1024);

        // one time constant later the estimate is at 1/e, not zero: the
        // average must fade smoothly rather than cut off at the window edge
        let after_one_tau = rate.avg_at(start + RATE_WINDOW);
        assert!(
            (370..=380).contains(&after_one_tau),
            "expected ~1024/e, got {}",
            after_one_tau
        );

        // strictly decreasing in between
        let at_10 = rate.avg_at(start + Duration::from_secs(10));
        let at_20 = rate.avg_at(start + Duration::from_secs(20));
        assert!(at_10 < 1024);
        assert!(at_20 < at_10);
        assert!(after_one_tau < at_20);

        // and effectively gone after several time constants, while the
        // total remains
        assert!(rate.avg_at(start + Duration::from_secs(150)) < 10);
        assert_eq!(rate.total(), 30 * 1024);
    }

    #[test]
    fn test_steady_stream_converges_on_its_rate() {
        let mut rate = Rate::new();
        let start = Instant::now();
        // 1 KiB every second for four time constants
        for i in 0..120 {
            rate.add_at(start + Duration::from_secs(i), 1024);
        }
        let avg = rate.avg_at(start + Duration::from_secs(120));
        // the discrete updates land slightly above the continuous limit
        assert!(
            (970..=1100).contains(&avg),
            "expected ~1 KiB/s, got {}",
            avg
        );
    }

    #[test]
    fn test_tally() {
        let tally = Tally::default();
        tally.add_down(500);
        tally.add_down(500);
        tally.add_up(123);
        assert_eq!(tally.down(), 1000);
        assert_eq!(tally.up(), 123);
    }
}

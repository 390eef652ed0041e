//! Bandwidth limiting shared by every relay session.
//!
//! The limiter is a decaying bucket: each relayed chunk adds its length to an
//! accumulator which drains continuously at `capacity / window` bytes per
//! second. It is advisory. `update` always records the chunk and only reports
//! whether the bucket is still within capacity; callers throttle future sends
//! by checking `is_limited` before each one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decaying-bucket rate limiter.
#[derive(Debug, Clone)]
pub struct BucketRateLimit {
    /// Bucket size in bytes
    capacity: f64,
    /// Seconds for a full bucket to drain
    window: f64,
    /// Bytes currently accounted, never negative
    amount: f64,
    /// Time of the last aging pass
    last_update: Instant,
}

impl BucketRateLimit {
    /// Create a new bucket.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Bucket size in bytes
    /// * `window` - Time for a full bucket to drain
    pub fn new(capacity: f64, window: Duration) -> Self {
        Self {
            capacity,
            window: window.as_secs_f64(),
            amount: 0.0,
            last_update: Instant::now(),
        }
    }

    fn age(&mut self) {
        let now = Instant::now();
        let delta = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        self.amount -= delta * self.capacity / self.window;
        if self.amount < 0.0 {
            self.amount = 0.0;
        }
    }

    /// Account `n` bytes. Returns whether the bucket is still within capacity.
    pub fn update(&mut self, n: usize) -> bool {
        self.age();
        self.amount += n as f64;
        self.amount <= self.capacity
    }

    /// Whether the bucket is currently over capacity.
    pub fn is_limited(&mut self) -> bool {
        self.age();
        self.amount > self.capacity
    }

    /// Seconds until the bucket drains back to capacity. Negative when not limited.
    pub fn when_clear(&mut self) -> f64 {
        self.age();
        (self.amount - self.capacity) / (self.capacity / self.window)
    }

    /// Bytes currently accounted, after aging.
    pub fn amount(&mut self) -> f64 {
        self.age();
        self.amount
    }

    /// Bucket size in bytes.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Rate limiter variants.
#[derive(Debug, Clone)]
pub enum RateLimit {
    /// Decaying bucket
    Bucket(BucketRateLimit),
    /// Never limits
    Unlimited,
}

impl RateLimit {
    /// Build the limiter for a bytes-per-second budget averaged over `history`.
    ///
    /// `None` means no limit.
    pub fn from_budget(bytes_per_sec: Option<u64>, history: Duration) -> Self {
        match bytes_per_sec {
            Some(rate) => RateLimit::Bucket(BucketRateLimit::new(
                rate as f64 * history.as_secs_f64(),
                history,
            )),
            None => RateLimit::Unlimited,
        }
    }

    /// Account `n` bytes.
    pub fn update(&mut self, n: usize) -> bool {
        match self {
            RateLimit::Bucket(b) => b.update(n),
            RateLimit::Unlimited => true,
        }
    }

    /// Whether sends should pause.
    pub fn is_limited(&mut self) -> bool {
        match self {
            RateLimit::Bucket(b) => b.is_limited(),
            RateLimit::Unlimited => false,
        }
    }

    /// Seconds until sends may resume.
    pub fn when_clear(&mut self) -> f64 {
        match self {
            RateLimit::Bucket(b) => b.when_clear(),
            RateLimit::Unlimited => 0.0,
        }
    }
}

/// Handle to a limiter shared across sessions.
#[derive(Debug, Clone)]
pub struct SharedRateLimit {
    inner: Arc<Mutex<RateLimit>>,
}

impl SharedRateLimit {
    /// Wrap a limiter for sharing.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            inner: Arc::new(Mutex::new(limit)),
        }
    }

    /// A shared limiter that never limits.
    pub fn unlimited() -> Self {
        Self::new(RateLimit::Unlimited)
    }

    /// Account `n` bytes.
    pub fn update(&self, n: usize) -> bool {
        self.inner.lock().update(n)
    }

    /// Whether sends should pause.
    pub fn is_limited(&self) -> bool {
        self.inner.lock().is_limited()
    }

    /// Seconds until sends may resume, possibly negative.
    pub fn when_clear(&self) -> f64 {
        self.inner.lock().when_clear()
    }

    /// Delay until sends may resume, clamped at zero.
    pub fn wait_time(&self) -> Duration {
        let secs = self.when_clear();
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for SharedRateLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_limits_and_decays() {
        let mut limit = BucketRateLimit::new(100.0, Duration::from_secs(5));

        assert!(limit.update(60));
        assert_eq!(limit.amount(), 60.0);
        assert!(!limit.is_limited());

        assert!(!limit.update(50));
        assert_eq!(limit.amount(), 110.0);
        assert!(limit.is_limited());

        tokio::time::advance(Duration::from_millis(2500)).await;

        assert_eq!(limit.amount(), 60.0);
        assert!(!limit.is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_update_is_advisory() {
        let mut limit = BucketRateLimit::new(10.0, Duration::from_secs(1));

        // Over capacity is still recorded
        assert!(!limit.update(1000));
        assert_eq!(limit.amount(), 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_never_negative() {
        let mut limit = BucketRateLimit::new(100.0, Duration::from_secs(1));

        for n in [0usize, 5, 300, 1, 0, 42] {
            limit.update(n);
            tokio::time::advance(Duration::from_secs(3)).await;
            assert!(limit.amount() >= 0.0);
        }
        assert_eq!(limit.amount(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_clear() {
        let mut limit = BucketRateLimit::new(100.0, Duration::from_secs(5));

        limit.update(150);
        // 50 bytes over at 20 bytes/sec
        assert_eq!(limit.when_clear(), 2.5);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limit.when_clear() < 0.0);
    }

    #[test]
    fn test_unlimited() {
        let mut limit = RateLimit::Unlimited;

        assert!(limit.update(usize::MAX));
        assert!(!limit.is_limited());
        assert_eq!(limit.when_clear(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_budget() {
        let limit = RateLimit::from_budget(Some(1000), Duration::from_secs(5));
        match limit {
            RateLimit::Bucket(b) => assert_eq!(b.capacity(), 5000.0),
            RateLimit::Unlimited => panic!("expected a bucket"),
        }

        assert!(matches!(
            RateLimit::from_budget(None, Duration::from_secs(5)),
            RateLimit::Unlimited
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_wait_time() {
        let shared = SharedRateLimit::new(RateLimit::from_budget(
            Some(20),
            Duration::from_secs(5),
        ));
        let other = shared.clone();

        assert_eq!(shared.wait_time(), Duration::ZERO);

        // Both handles account into the same bucket
        shared.update(100);
        other.update(50);
        assert!(shared.is_limited());
        assert_eq!(other.wait_time(), Duration::from_secs_f64(2.5));
    }
}

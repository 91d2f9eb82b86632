use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A byte-throughput token bucket shared by all table builders, pacing disk
/// writes globally across compaction workers.
///
/// The bucket refills at `bytes_per_sec` and holds at most one second of
/// budget. [`RateLimiter::throttle`] sleeps until the requested bytes fit.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    bytes_per_sec: f64,
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// A limiter that never throttles.
    #[inline]
    pub const fn unlimited() -> Self {
        Self { inner: None }
    }

    /// A limiter that admits at most `bytes_per_sec` bytes per second.
    /// Zero means unlimited.
    #[inline]
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        Self {
            inner: Some(Mutex::new(Bucket {
                bytes_per_sec: bytes_per_sec as f64,
                tokens: bytes_per_sec as f64,
                last: Instant::now(),
            })),
        }
    }

    /// Blocks until `n` bytes of budget are available, then consumes them.
    /// Requests larger than one second of budget are admitted by running the
    /// bucket into debt, which delays later callers instead.
    pub fn throttle(&self, n: usize) {
        let Some(bucket) = &self.inner else {
            return;
        };
        let wait = {
            let mut b = bucket.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(b.last).as_secs_f64();
            b.last = now;
            b.tokens = (b.tokens + elapsed * b.bytes_per_sec).min(b.bytes_per_sec);
            b.tokens -= n as f64;
            if b.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-b.tokens / b.bytes_per_sec))
            }
        };
        if let Some(wait) = wait {
            std::thread::sleep(wait);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

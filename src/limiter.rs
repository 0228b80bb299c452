//! I/O rate limiting capability.
//!
//! Limiters shape disk traffic but never cancel it: `request` may block until
//! budget is available and then always admits the caller. Background traffic
//! (GC reads and writes) is marked so a limiter can deprioritize it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shapes I/O by blocking callers until `bytes` fit the budget.
pub trait RateLimiter: Send + Sync {
    fn request(&self, bytes: usize, background: bool);
}

/// Admits everything immediately. The default for stores without throttling.
pub struct NoLimit;

impl RateLimiter for NoLimit {
    fn request(&self, _bytes: usize, _background: bool) {}
}

/// Token-bucket limiter refilled at a fixed bytes-per-second rate. Background
/// requests only draw from the budget once it is at least half full, so
/// foreground traffic keeps priority under contention.
pub struct ThrottleLimiter {
    rate_per_sec: u64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    available: u64,
    last_refill: Instant,
}

impl ThrottleLimiter {
    pub fn new(rate_per_sec: u64) -> Self {
        assert!(rate_per_sec > 0, "rate must be positive");
        Self {
            rate_per_sec,
            bucket: Mutex::new(Bucket {
                available: rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        let gained = (elapsed.as_secs_f64() * self.rate_per_sec as f64) as u64;
        if gained > 0 {
            bucket.available = (bucket.available + gained).min(self.rate_per_sec);
            bucket.last_refill = Instant::now();
        }
    }
}

impl RateLimiter for ThrottleLimiter {
    fn request(&self, bytes: usize, background: bool) {
        // A request larger than one second of budget is admitted once the
        // bucket is full; it cannot wait for more than the bucket holds.
        let need = (bytes as u64).min(self.rate_per_sec);
        let floor = if background { self.rate_per_sec / 2 } else { 0 };

        loop {
            {
                let mut bucket = self.bucket.lock().unwrap();
                self.refill(&mut bucket);
                if bucket.available >= need && bucket.available >= floor {
                    bucket.available -= need;
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

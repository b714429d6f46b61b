use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Token bucket pacer shared by every worker of a run.
///
/// Tokens refill continuously at `rate` per second up to a capacity of one, so the aggregate
/// batch start rate converges to `rate` regardless of how many workers wait on it.
pub struct RatePacer {
    rate: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RatePacer {
    /// Returns `None` for a non-positive rate (unthrottled).
    pub fn new(rate: i64) -> Option<Self> {
        (rate > 0).then(|| Self {
            rate: rate as f64,
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last: Instant::now(),
            }),
        })
    }

    /// Wait until a token is available and take it.
    ///
    /// The bucket lock is held while sleeping so waiters are served one at a time.
    pub async fn wait_one(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            let dt = now.duration_since(bucket.last).as_secs_f64();
            bucket.last = now;
            bucket.tokens = (bucket.tokens + dt * self.rate).min(1.0);

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let missing = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(missing / self.rate).max(Duration::from_nanos(1));
            sleep(wait).await;
        }
    }
}

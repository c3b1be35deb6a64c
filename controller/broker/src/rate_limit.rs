use rand::Rng;
use tokio::time::{self, Duration, Instant};

/// Limits how quickly queued events are dispatched.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(qps: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: qps.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    /// Waits until a token is available and takes it.
    pub(crate) async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - self.tokens) / self.refill_per_sec;
            time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Exponential backoff with up to 10% jitter.
pub(crate) fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt - 1);
    let delay = base.saturating_mul(factor).min(max);
    let jitter_ms = delay.as_millis() as u64 / 10;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

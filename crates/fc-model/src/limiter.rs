use std::sync::Mutex;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// A refillable token bucket. Capacity equals the per-minute allowance, so a
/// full minute of quota can burst.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(count: u64) -> Self {
        Self {
            tokens: count as f64,
            capacity: count as f64,
            refill_per_sec: count as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take `cost`; on shortfall, return how long until it would fit.
    fn try_consume(&mut self, cost: f64) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Return tokens taken by a cancelled request, capped at capacity.
    fn refund(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }
}

// ---------------------------------------------------------------------------
// RateGate
// ---------------------------------------------------------------------------

/// Combined RPM + TPM admission gate. Both buckets must admit a request
/// before dispatch; on shortfall the caller waits the longer of the two.
#[derive(Debug)]
pub struct RateGate {
    inner: Mutex<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    rpm: TokenBucket,
    tpm: TokenBucket,
}

impl RateGate {
    pub fn new(requests_per_minute: u64, tokens_per_minute: u64) -> Self {
        Self {
            inner: Mutex::new(Buckets {
                rpm: TokenBucket::per_minute(requests_per_minute),
                tpm: TokenBucket::per_minute(tokens_per_minute),
            }),
        }
    }

    /// Try to admit one request carrying `token_cost` tokens. On refusal,
    /// nothing is consumed and the required wait is returned.
    pub fn try_admit(&self, token_cost: u64) -> Result<(), Duration> {
        let mut buckets = self.inner.lock().expect("rate gate lock poisoned");
        match buckets.rpm.try_consume(1.0) {
            Ok(()) => {}
            Err(wait) => return Err(wait),
        }
        match buckets.tpm.try_consume(token_cost as f64) {
            Ok(()) => Ok(()),
            Err(wait) => {
                // Roll back the request slot so a retry starts clean.
                buckets.rpm.refund(1.0);
                Err(wait)
            }
        }
    }

    /// Wait until both buckets admit the request. The caller is expected to
    /// hold the dispatch queue's head position so FIFO order is preserved.
    pub async fn admit(&self, token_cost: u64) {
        loop {
            match self.try_admit(token_cost) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.min(Duration::from_secs(1))).await,
            }
        }
    }

    /// Return quota consumed by a request that was cancelled before dispatch.
    pub fn refund(&self, token_cost: u64) {
        let mut buckets = self.inner.lock().expect("rate gate lock poisoned");
        buckets.rpm.refund(1.0);
        buckets.tpm.refund(token_cost as f64);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

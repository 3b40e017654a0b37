//! Global document-rate limiter shared by every copy worker.
//!
//! One [`Qos`] exists per run. Workers acquire budget per batch, so the
//! configured ceiling bounds the aggregate rate no matter how many workers run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket whose balance may go negative, so batches larger than the
/// burst are admitted but delay everyone after them.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, capacity: u64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Switch to a new rate and capacity. Time elapsed so far is credited at
    /// the old rate; outstanding debt carries over.
    fn retune(&mut self, rate_per_sec: u64, capacity: u64, now: Instant) {
        self.refill(now);
        self.rate_per_sec = rate_per_sec as f64;
        self.capacity = capacity as f64;
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Take `amount` tokens or return how long to wait before retrying.
    fn try_take(&mut self, amount: u64, now: Instant) -> Option<Duration> {
        self.refill(now);
        let amount = amount as f64;
        let needed = amount.min(self.capacity);
        if self.tokens >= needed {
            self.tokens -= amount;
            None
        } else {
            Some(Duration::from_secs_f64(
                (needed - self.tokens) / self.rate_per_sec,
            ))
        }
    }
}

/// Snapshot of limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QosStats {
    /// Current ceiling in documents per second (0 = unlimited).
    pub limit: u64,
    /// Documents admitted so far.
    pub admitted: u64,
    /// Documents workers reported as written.
    pub written: u64,
    /// Average written documents per second since the limiter started.
    pub observed_rate: f64,
}

/// Shared throughput limiter.
#[derive(Debug)]
pub struct Qos {
    limit: AtomicU64,
    burst: u64,
    bucket: Mutex<Option<TokenBucket>>,
    admitted: AtomicU64,
    written: AtomicU64,
    started: Instant,
}

impl Qos {
    /// Create a limiter admitting `limit_per_sec` documents per second with
    /// bursts of up to `burst` documents. A limit of 0 disables limiting.
    pub fn new(limit_per_sec: u64, burst: u64) -> Self {
        let burst = burst.max(1);
        Self {
            limit: AtomicU64::new(limit_per_sec),
            burst,
            bucket: Mutex::new(Self::bucket_for(limit_per_sec, burst)),
            admitted: AtomicU64::new(0),
            written: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn bucket_for(limit: u64, burst: u64) -> Option<TokenBucket> {
        (limit > 0).then(|| TokenBucket::new(limit, burst.min(limit).max(1)))
    }

    /// Wait until `docs` documents may be written.
    pub async fn acquire(&self, docs: u64) {
        if docs == 0 {
            return;
        }
        loop {
            let wait = {
                let mut guard = match self.bucket.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match guard.as_mut() {
                    None => None,
                    Some(bucket) => bucket.try_take(docs, Instant::now()),
                }
            };
            match wait {
                None => break,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
        self.admitted.fetch_add(docs, Ordering::Relaxed);
    }

    /// Change the ceiling at runtime. A limited bucket keeps its balance, so
    /// debt from oversized batches still delays later ones.
    pub fn set_limit(&self, limit_per_sec: u64) {
        let mut guard = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if limit_per_sec == 0 {
            *guard = None;
        } else {
            match guard.as_mut() {
                Some(bucket) => bucket.retune(
                    limit_per_sec,
                    self.burst.min(limit_per_sec).max(1),
                    Instant::now(),
                ),
                None => *guard = Self::bucket_for(limit_per_sec, self.burst),
            }
        }
        self.limit.store(limit_per_sec, Ordering::Relaxed);
        tracing::info!(limit = limit_per_sec, "qos limit updated");
    }

    /// Current ceiling.
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Feed back documents actually written.
    pub fn record(&self, docs: u64) {
        self.written.fetch_add(docs, Ordering::Relaxed);
    }

    /// Current statistics.
    pub fn stats(&self) -> QosStats {
        let written = self.written.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        QosStats {
            limit: self.limit(),
            admitted: self.admitted.load(Ordering::Relaxed),
            written,
            observed_rate: if elapsed > 0.0 {
                written as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

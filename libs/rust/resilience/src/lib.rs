//! Shared retry, polling and quorum policy for the coordinator and follower loops.
//!
//! Both sides of the round protocol sleep and retry through the same
//! [`RetryPolicy`], so an operator tuning the cadence changes it for every
//! party at once. Every loop that can spin indefinitely takes a
//! [`CancelScope`]: a cooperative stop flag plus an optional deadline.
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Future;
use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter};
use rand::{thread_rng, Rng};
use thiserror::Error;
use tracing::{debug, warn};

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("ledgerfl-resilience")
        .u64_counter("ledgerfl_resilience_retry_attempts_total")
        .with_description("Total retry attempts executed")
        .build()
});

static INTERRUPTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("ledgerfl-resilience")
        .u64_counter("ledgerfl_resilience_interruptions_total")
        .with_description("Retry or polling loops ended by a stop flag or deadline")
        .build()
});

/// Why a retry or polling loop gave up before its operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("stop requested")]
    Stopped,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Poll cadence and retry jitter shared by every party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    pub jitter_low: Duration,
    pub jitter_high: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), jitter_low: Duration::from_secs(2), jitter_high: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    pub fn new(poll_interval: Duration, jitter_low: Duration, jitter_high: Duration) -> Self {
        Self { poll_interval, jitter_low, jitter_high }
    }

    /// Random delay in `[jitter_low, jitter_high]`.
    pub fn jitter(&self) -> Duration {
        let low = self.jitter_low.as_millis() as u64;
        let high = self.jitter_high.as_millis() as u64;
        if high <= low {
            return self.jitter_low;
        }
        Duration::from_millis(thread_rng().gen_range(low..=high))
    }
}

/// Cooperative stop signal, checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self { Self::default() }
    pub fn stop(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_stopped(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// Stop flag plus optional deadline bounding an otherwise unbounded loop.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    stop: StopFlag,
    deadline: Option<Instant>,
}

impl CancelScope {
    pub fn new(stop: StopFlag) -> Self { Self { stop, deadline: None } }

    /// A scope that can never be interrupted.
    pub fn unbounded() -> Self { Self::default() }

    /// Bounds the scope by `deadline`; an earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Adds a deadline `timeout` from now; `None` leaves the scope unbounded.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => self.with_deadline(Instant::now() + t),
            None => self,
        }
    }

    pub fn stop_flag(&self) -> &StopFlag { &self.stop }
    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.stop.is_stopped() {
            INTERRUPTIONS.add(1, &[]);
            return Err(Interrupted::Stopped);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                INTERRUPTIONS.add(1, &[]);
                return Err(Interrupted::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Sleeps for `d` (cut short by the deadline), then re-checks the scope.
    pub async fn sleep(&self, d: Duration) -> Result<(), Interrupted> {
        let d = match self.deadline {
            Some(deadline) => d.min(deadline.saturating_duration_since(Instant::now())),
            None => d,
        };
        tokio::time::sleep(d).await;
        self.check()
    }
}

/// Retries `op` with a jittered delay until it succeeds or `scope` interrupts.
pub async fn retry_with_jitter<F, Fut, T, E>(policy: &RetryPolicy, scope: &CancelScope, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Interrupted> + Display,
{
    let mut attempt: u64 = 0;
    loop {
        scope.check()?;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                RETRY_ATTEMPTS.add(1, &[]);
                let delay = policy.jitter();
                warn!(operation = what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying after failure");
                scope.sleep(delay).await?;
            }
        }
    }
}

/// Runs `f` at most `attempts` times with a fixed `delay` in between.
pub async fn retry_async<F, Fut, T, E>(mut f: F, attempts: usize, delay: Duration) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut i = 0;
    loop {
        RETRY_ATTEMPTS.add(1, &[]);
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if i + 1 >= attempts => return Err(e),
            Err(_) => {
                debug!(attempt = i + 1, "bounded retry");
                tokio::time::sleep(delay).await;
            }
        }
        i += 1;
    }
}

/// Minimum-participant threshold after clamping to the live roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    pub requested: usize,
    pub effective: usize,
}

impl Quorum {
    /// Clamps `requested` to `roster_size`; never below one so an empty
    /// result set is never aggregated.
    pub fn clamp(requested: usize, roster_size: usize) -> Self {
        let effective = requested.min(roster_size).max(1);
        Self { requested, effective }
    }

    pub fn downgraded(&self) -> bool { self.effective < self.requested }
    pub fn is_met(&self, count: usize) -> bool { count >= self.effective }
}

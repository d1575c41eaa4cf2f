#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocationContext {
    pub deadline: Option<DateTime<Utc>>,
    pub cancel: CancelToken,
}

impl AllocationContext {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancelToken::new(),
        }
    }

    /// Checks the context against `now` without waiting.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), WaitInterrupted> {
        if self.cancel.is_cancelled() {
            return Err(WaitInterrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if now >= deadline => Err(WaitInterrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitInterrupted {
    #[error("wait cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

pub trait Scheduler {
    fn now(&self) -> DateTime<Utc>;

    /// Waits up to `duration`, returning early when the context is cancelled or its
    /// deadline passes.
    fn sleep(&self, duration: Duration, ctx: &AllocationContext) -> Result<(), WaitInterrupted>;
}

impl<T: Scheduler + ?Sized> Scheduler for &T {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration, ctx: &AllocationContext) -> Result<(), WaitInterrupted> {
        (**self).sleep(duration, ctx)
    }
}

/// Converts a configured interval to a chrono delta, saturating on overflow.
pub fn to_time_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

pub fn add_saturating(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_time_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

const SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScheduler;

impl Scheduler for SystemScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, ctx: &AllocationContext) -> Result<(), WaitInterrupted> {
        let wake_at = add_saturating(Utc::now(), duration);
        loop {
            let now = Utc::now();
            ctx.check(now)?;
            if now >= wake_at {
                return Ok(());
            }
            let remaining = (wake_at - now).to_std().unwrap_or(Duration::ZERO);
            let mut slice = remaining.min(SLEEP_SLICE);
            if let Some(deadline) = ctx.deadline {
                let to_deadline = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                slice = slice.min(to_deadline);
            }
            thread::sleep(slice);
        }
    }
}

/// Virtual clock for tests: `sleep` advances time instantly.
#[derive(Debug, Clone)]
pub struct ManualScheduler {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<AtomicU64>,
    cancel_after_sleeps: Option<u64>,
}

impl ManualScheduler {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(AtomicU64::new(0)),
            cancel_after_sleeps: None,
        }
    }

    /// Cancels the caller's context once `n` sleeps have completed.
    pub fn cancel_after_sleeps(mut self, n: u64) -> Self {
        self.cancel_after_sleeps = Some(n);
        self
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = add_saturating(*now, by);
    }

    pub fn sleeps(&self) -> u64 {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sleep(&self, duration: Duration, ctx: &AllocationContext) -> Result<(), WaitInterrupted> {
        ctx.check(self.now())?;
        let completed = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        let wake_at = add_saturating(self.now(), duration);
        if let Some(deadline) = ctx.deadline {
            if deadline <= wake_at {
                let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
                *now = deadline;
                return Err(WaitInterrupted::DeadlineExceeded);
            }
        }
        self.advance(duration);
        if self.cancel_after_sleeps.is_some_and(|n| completed >= n) {
            ctx.cancel.cancel();
        }
        ctx.check(self.now())
    }
}

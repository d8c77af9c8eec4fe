//! Cross-process mutual exclusion for migration runs.
//!
//! A backend supplies a [LockPrimitive] (an advisory lock, a lock row, ...).
//! [RetryPolicy] decides how long to wait for it and when a holder is presumed
//! dead and its lock forcibly cleared. [LockGuard] scopes the acquisition so the
//! lock is released on every exit path.

use crate::error::Error;
use chrono::{NaiveDateTime, Utc};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A database-level lock shared by every process migrating the same database.
pub trait LockPrimitive {
    /// Try to take the lock without blocking. Returns `true` if it is now held by `owner`.
    fn try_acquire(&mut self, owner: &str) -> Result<bool, Error>;

    /// Release a lock previously taken by this handle.
    fn release(&mut self) -> Result<(), Error>;

    /// Clear the lock regardless of who holds it.
    fn force_clear(&mut self) -> Result<(), Error>;

    /// Whether anyone currently holds the lock.
    fn is_locked(&mut self) -> Result<bool, Error>;
}

/// Source of time for lock waits and ledger timestamps.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
    fn now_utc(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How a lock acquisition attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// The lock was only obtained after clearing a presumed-stale holder.
    TimedOutAndRecovered { recoveries: u32 },
    Interrupted,
}

/// Bounded wait-and-retry strategy for a [LockPrimitive].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total wait before the current holder is presumed dead. `None` means try once.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Forced clears allowed before giving up with [Error::LockContention].
    pub max_recoveries: u32,
}

impl RetryPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_RECOVERIES: u32 = 3;

    /// Try the lock once and abort if it is taken.
    pub fn fail_fast() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::ZERO,
            max_recoveries: 0,
        }
    }

    /// Poll every `poll_interval`; after `timeout`, force-clear the lock and start over.
    pub fn bounded(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            poll_interval,
            max_recoveries: Self::DEFAULT_MAX_RECOVERIES,
        }
    }

    pub fn with_max_recoveries(mut self, max_recoveries: u32) -> Self {
        self.max_recoveries = max_recoveries;
        self
    }

    /// Acquire `lock` for `owner` according to this policy.
    ///
    /// Contention that outlasts the policy is reported as [Error::LockContention].
    /// A raised `interrupt` flag ends the wait with [LockOutcome::Interrupted].
    pub fn acquire<L>(
        &self,
        lock: &mut L,
        owner: &str,
        clock: &dyn Clock,
        interrupt: &AtomicBool,
    ) -> Result<LockOutcome, Error>
    where
        L: LockPrimitive + ?Sized,
    {
        let mut recoveries = 0;
        let mut window_start = clock.now();
        loop {
            if interrupt.load(Ordering::SeqCst) {
                return Ok(LockOutcome::Interrupted);
            }
            if lock.try_acquire(owner)? {
                tracing::info!(owner, "Migration lock acquired");
                return Ok(if recoveries == 0 {
                    LockOutcome::Acquired
                } else {
                    LockOutcome::TimedOutAndRecovered { recoveries }
                });
            }

            let Some(timeout) = self.timeout else {
                tracing::warn!(owner, "Migration lock is held by another process, aborting");
                return Err(Error::LockContention(
                    "another migration is in progress".to_string(),
                ));
            };

            if clock.now().duration_since(window_start) > timeout {
                if recoveries >= self.max_recoveries {
                    tracing::error!(
                        owner,
                        recoveries,
                        "Giving up on migration lock after forced recoveries"
                    );
                    return Err(Error::LockContention(format!(
                        "lock still held after {} forced recoveries",
                        recoveries
                    )));
                }
                recoveries += 1;
                tracing::warn!(
                    owner,
                    timeout_ms = timeout.as_millis() as u64,
                    recovery = recoveries,
                    "Migration lock not obtained within timeout, forcibly clearing it"
                );
                lock.force_clear()?;
                window_start = clock.now();
                continue;
            }

            tracing::info!(
                owner,
                retry_in_ms = self.poll_interval.as_millis() as u64,
                "Migration lock unavailable, retrying"
            );
            clock.sleep(self.poll_interval);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(Self::DEFAULT_TIMEOUT, Self::DEFAULT_POLL_INTERVAL)
    }
}

/// Shared flag that aborts a pending lock wait when set.
pub type InterruptFlag = Arc<AtomicBool>;

/// Holds the migration lock for its lifetime and derefs to the locked handle.
///
/// Prefer [LockGuard::release] so release errors reach the caller. Dropping the
/// guard without it still releases, logging any failure.
pub struct LockGuard<'a, L: LockPrimitive + ?Sized> {
    inner: &'a mut L,
    outcome: LockOutcome,
    released: bool,
}

impl<'a, L: LockPrimitive + ?Sized> LockGuard<'a, L> {
    pub fn acquire(
        inner: &'a mut L,
        policy: &RetryPolicy,
        owner: &str,
        clock: &dyn Clock,
        interrupt: &AtomicBool,
    ) -> Result<Self, Error> {
        match policy.acquire(&mut *inner, owner, clock, interrupt)? {
            LockOutcome::Interrupted => {
                tracing::warn!(owner, "Lock acquisition interrupted");
                Err(Error::LockInterrupted)
            }
            outcome => Ok(Self {
                inner,
                outcome,
                released: false,
            }),
        }
    }

    pub fn outcome(&self) -> LockOutcome {
        self.outcome
    }

    pub fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.inner.release()?;
        tracing::info!("Migration lock released");
        Ok(())
    }
}

impl<L: LockPrimitive + ?Sized> Deref for LockGuard<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        self.inner
    }
}

impl<L: LockPrimitive + ?Sized> DerefMut for LockGuard<'_, L> {
    fn deref_mut(&mut self) -> &mut L {
        self.inner
    }
}

impl<L: LockPrimitive + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(error) = self.inner.release() {
                tracing::error!(error = %error, "Failed to release migration lock");
            }
        }
    }
}

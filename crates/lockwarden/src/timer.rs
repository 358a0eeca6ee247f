//! timer primitive
//!
//! the lockout countdown is volatile: it is rebuilt from persisted state on
//! boot and never trusted across power loss. timer callbacks may only raise
//! an [`ExpiryFlag`]; flash i/o happens later in task context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// millisecond time source
pub trait Clock: Send + Sync {
    /// milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;
}

/// monotonic clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// manually advanced clock for tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// flag a timer-service callback raises on expiry
///
/// cloning shares the flag. `raise` is the only thing a callback may do.
#[derive(Debug, Clone, Default)]
pub struct ExpiryFlag(Arc<AtomicBool>);

impl ExpiryFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// consume the flag, returns whether it was raised
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// one-shot countdown
pub struct Countdown<C: Clock> {
    clock: C,
    duration_ms: u64,
    started_at: Option<u64>,
    expiry: ExpiryFlag,
}

impl<C: Clock> Countdown<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            duration_ms: 0,
            started_at: None,
            expiry: ExpiryFlag::default(),
        }
    }

    /// arm for `duration_ms` from now
    pub fn start(&mut self, duration_ms: u64) {
        self.duration_ms = duration_ms;
        self.started_at = Some(self.clock.now_ms());
        self.expiry.take();
    }

    /// re-arm with the last duration
    pub fn restart(&mut self) {
        self.start(self.duration_ms);
    }

    pub fn stop(&mut self) {
        self.started_at = None;
        self.expiry.take();
    }

    /// duration of the last arm
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// true once armed and fully elapsed
    pub fn expired(&self) -> bool {
        self.started_at.is_some() && self.remaining_ms() == 0
    }

    /// milliseconds left; 0 when stopped or elapsed
    pub fn remaining_ms(&self) -> u64 {
        match self.started_at {
            Some(start) => {
                let elapsed = self.clock.now_ms().saturating_sub(start);
                self.duration_ms.saturating_sub(elapsed)
            }
            None => 0,
        }
    }

    /// handle for the timer service callback
    pub fn expiry_flag(&self) -> ExpiryFlag {
        self.expiry.clone()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown() {
        let clock = ManualClock::new();
        let mut timer = Countdown::new(clock.clone());
        assert!(!timer.is_running());
        assert!(!timer.expired());
        assert_eq!(timer.remaining_ms(), 0);

        timer.start(1000);
        assert_eq!(timer.remaining_ms(), 1000);
        clock.advance(400);
        assert_eq!(timer.remaining_ms(), 600);
        assert!(!timer.expired());
        clock.advance(600);
        assert!(timer.expired());

        timer.restart();
        assert_eq!(timer.remaining_ms(), 1000);

        timer.stop();
        assert!(!timer.expired());
        assert_eq!(timer.remaining_ms(), 0);
    }

    #[test]
    fn test_zero_duration_expires_immediately() {
        let mut timer = Countdown::new(ManualClock::new());
        timer.start(0);
        assert!(timer.expired());
    }

    #[test]
    fn test_expiry_flag_is_one_shot() {
        let timer = Countdown::new(ManualClock::new());
        let flag = timer.expiry_flag();
        assert!(!flag.take());
        flag.raise();
        assert!(flag.take());
        assert!(!flag.take());
    }
}

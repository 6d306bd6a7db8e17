//! Inactivity policy deciding when the in-memory main key must be dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutolockTimeout {
    Never,
    /// Lock as soon as the app leaves the foreground.
    Always,
    Minutes(u32),
}

impl Default for AutolockTimeout {
    fn default() -> Self {
        Self::Always
    }
}

/// Collaborator consulted by the controller on every key read.
pub trait Autolocker: Send + Sync {
    fn should_autolock_now(&self) -> bool;

    /// Stop the countdown (key was just loaded or the app is in use again).
    fn release_countdown(&self);

    /// Start counting inactivity from now (app moved to background).
    fn start_countdown(&self);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

pub struct CountdownAutolocker {
    timeout: RwLock<AutolockTimeout>,
    countdown_start: Mutex<Option<Instant>>,
    clock: Arc<dyn Clock>,
}

impl CountdownAutolocker {
    pub fn new(timeout: AutolockTimeout) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(timeout: AutolockTimeout, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout: RwLock::new(timeout),
            countdown_start: Mutex::new(None),
            clock,
        }
    }

    pub fn timeout(&self) -> AutolockTimeout {
        *self.timeout.read()
    }

    pub fn set_timeout(&self, timeout: AutolockTimeout) {
        *self.timeout.write() = timeout;
        self.release_countdown();
    }

    pub fn is_counting(&self) -> bool {
        self.countdown_start.lock().is_some()
    }
}

impl Autolocker for CountdownAutolocker {
    fn should_autolock_now(&self) -> bool {
        let Some(started) = *self.countdown_start.lock() else {
            return false;
        };
        match self.timeout() {
            AutolockTimeout::Never => false,
            AutolockTimeout::Always => true,
            AutolockTimeout::Minutes(minutes) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                elapsed >= Duration::from_secs(u64::from(minutes) * 60)
            }
        }
    }

    fn release_countdown(&self) {
        *self.countdown_start.lock() = None;
    }

    fn start_countdown(&self) {
        let mut start = self.countdown_start.lock();
        if start.is_none() {
            debug!("autolock countdown started");
            *start = Some(self.clock.now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locker(timeout: AutolockTimeout) -> (CountdownAutolocker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (CountdownAutolocker::with_clock(timeout, clock.clone()), clock)
    }

    #[test]
    fn no_countdown_never_locks() {
        let (locker, clock) = locker(AutolockTimeout::Always);
        clock.advance(Duration::from_secs(3600));
        assert!(!locker.should_autolock_now());
    }

    #[test]
    fn always_locks_once_backgrounded() {
        let (locker, _) = locker(AutolockTimeout::Always);
        locker.start_countdown();
        assert!(locker.should_autolock_now());
        locker.release_countdown();
        assert!(!locker.should_autolock_now());
    }

    #[test]
    fn never_ignores_elapsed_time() {
        let (locker, clock) = locker(AutolockTimeout::Never);
        locker.start_countdown();
        clock.advance(Duration::from_secs(86_400));
        assert!(!locker.should_autolock_now());
    }

    #[test]
    fn minutes_threshold() {
        let (locker, clock) = locker(AutolockTimeout::Minutes(5));
        locker.start_countdown();
        clock.advance(Duration::from_secs(299));
        assert!(!locker.should_autolock_now());
        clock.advance(Duration::from_secs(1));
        assert!(locker.should_autolock_now());
    }

    #[test]
    fn restarting_keeps_first_timestamp() {
        let (locker, clock) = locker(AutolockTimeout::Minutes(1));
        locker.start_countdown();
        clock.advance(Duration::from_secs(45));
        locker.start_countdown();
        clock.advance(Duration::from_secs(15));
        assert!(locker.should_autolock_now());
    }

    #[test]
    fn changing_timeout_releases_countdown() {
        let (locker, _) = locker(AutolockTimeout::Always);
        locker.start_countdown();
        locker.set_timeout(AutolockTimeout::Minutes(10));
        assert!(!locker.is_counting());
        assert_eq!(locker.timeout(), AutolockTimeout::Minutes(10));
    }

    #[test]
    fn timeout_serde_shape() {
        assert_eq!(serde_json::to_string(&AutolockTimeout::Never).unwrap(), "\"never\"");
        assert_eq!(
            serde_json::to_string(&AutolockTimeout::Minutes(3)).unwrap(),
            "{\"minutes\":3}"
        );
        let parsed: AutolockTimeout = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(parsed, AutolockTimeout::Always);
    }
}

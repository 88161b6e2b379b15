//! Interruptible stop signal shared by pressure threads

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Mechanism to tell pressure threads to stop
///
/// Once raised, a stop signal remains raised for the rest of its lifetime.
/// Threads that sleep through `sleep()` or `sleep_until()` are woken up as
/// soon as the signal is raised.
///
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<StopState>);
//
#[derive(Debug, Default)]
struct StopState {
    /// Fast path for polling from busy loops
    raised: AtomicBool,

    /// Slow path for sleeping threads
    lock: Mutex<bool>,

    /// Wakes up sleeping threads
    wakeup: Condvar,
}
//
impl StopSignal {
    /// Set up a stop signal that is not raised yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this signal to stop
    pub fn raise(&self) {
        let mut raised = self.0.lock.lock().unwrap_or_else(|e| e.into_inner());
        *raised = true;
        self.0.raised.store(true, Ordering::Release);
        self.0.wakeup.notify_all();
    }

    /// Truth that a stop was requested
    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Report stop requests in `?`-friendly form
    pub fn check(&self) -> Result<(), MustStop> {
        if self.is_raised() {
            Err(MustStop)
        } else {
            Ok(())
        }
    }

    /// Sleep for some time, unless a stop is requested first
    pub fn sleep(&self, duration: Duration) -> Result<(), MustStop> {
        match Instant::now().checked_add(duration) {
            Some(deadline) => self.sleep_until(deadline),
            None => self.wait(),
        }
    }

    /// Sleep until some deadline, unless a stop is requested first
    pub fn sleep_until(&self, deadline: Instant) -> Result<(), MustStop> {
        let mut raised = self.0.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *raised {
                return Err(MustStop);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            raised = self
                .0
                .wakeup
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Sleep until a stop is requested
    pub fn wait(&self) -> Result<(), MustStop> {
        let raised = self.0.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _raised = self
            .0
            .wakeup
            .wait_while(raised, |raised| !*raised)
            .unwrap_or_else(|e| e.into_inner());
        Err(MustStop)
    }
}

/// Signal that a thread was asked to stop
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MustStop;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let signal = StopSignal::new();
        assert!(!signal.is_raised());
        assert_eq!(signal.check(), Ok(()));
        assert_eq!(signal.sleep(Duration::from_millis(1)), Ok(()));
    }

    #[test]
    fn raised_is_sticky() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        clone.raise();
        assert!(signal.is_raised());
        assert_eq!(signal.check(), Err(MustStop));
        assert_eq!(signal.sleep(Duration::from_secs(60)), Err(MustStop));
        assert_eq!(signal.wait(), Err(MustStop));
        signal.raise();
        assert!(clone.is_raised());
    }

    #[test]
    fn sleep_is_interrupted() {
        let signal = StopSignal::new();
        let start = Instant::now();
        std::thread::scope(|s| {
            let sleeper = s.spawn(|| signal.sleep(Duration::from_secs(60)));
            std::thread::sleep(Duration::from_millis(50));
            signal.raise();
            assert_eq!(sleeper.join().unwrap(), Err(MustStop));
        });
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_lasts_long_enough() {
        let signal = StopSignal::new();
        let start = Instant::now();
        assert_eq!(signal.sleep(Duration::from_millis(30)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}

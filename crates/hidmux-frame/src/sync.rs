//! Thread coordination primitives shared by the link layer and the peer stack.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Worker threads never leave shared queues half-updated, so a poisoned
/// lock still guards consistent state.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A waitable boolean event.
///
/// An auto-reset signal clears itself when it releases a waiter; a manual
/// signal stays set until [`Signal::reset`] is called.
#[derive(Debug)]
pub struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
    auto_reset: bool,
}

impl Signal {
    /// Auto-reset signal, initially clear.
    pub fn auto() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
            auto_reset: true,
        }
    }

    /// Manual-reset signal with an initial state.
    pub fn manual(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(initially_set),
            cond: Condvar::new(),
            auto_reset: false,
        }
    }

    pub fn set(&self) {
        *lock(&self.state) = true;
        if self.auto_reset {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub fn reset(&self) {
        *lock(&self.state) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.state)
    }

    /// Block until the signal is set.
    pub fn wait(&self) {
        let mut state = lock(&self.state);
        while !*state {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if self.auto_reset {
            *state = false;
        }
    }

    /// Block until the signal is set or `timeout` elapses.
    ///
    /// Returns true if the signal was observed set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        if self.auto_reset {
            *state = false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn auto_signal_releases_one_wait() {
        let signal = Signal::auto();
        signal.set();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.is_set());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn manual_signal_stays_set() {
        let signal = Signal::manual(true);
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        signal.reset();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn set_wakes_a_blocked_waiter() {
        let signal = Arc::new(Signal::auto());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(20));
        signal.set();
        waiter.join().unwrap();
    }
}

//! Wake-up primitives for the scheduler and the request broker.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn relock<'a, T>(result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

fn relock_timeout<'a, T>(
    result: Result<(MutexGuard<'a, T>, std::sync::WaitTimeoutResult), PoisonError<(MutexGuard<'a, T>, std::sync::WaitTimeoutResult)>>,
) -> (MutexGuard<'a, T>, std::sync::WaitTimeoutResult) {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// A binary semaphore.
///
/// The semaphore remembers at most one give: giving an already-given
/// semaphore is a no-op, so repeated wake-ups collapse into one.
#[derive(Debug)]
pub struct BinSem {
    given: Mutex<bool>,
    cond: Condvar,
}

impl BinSem {
    /// Construct a semaphore, given or taken.
    pub fn new(given: bool) -> Self {
        Self {
            given: Mutex::new(given),
            cond: Condvar::new(),
        }
    }

    /// Give the semaphore, waking one waiter.
    pub fn give(&self) {
        let mut given = relock(self.given.lock());
        *given = true;
        self.cond.notify_one();
    }

    /// Take the semaphore without blocking.
    pub fn try_take(&self) -> bool {
        let mut given = relock(self.given.lock());

        if *given {
            *given = false;
            true
        } else {
            false
        }
    }

    /// Take the semaphore, waiting up to `timeout` (forever when `None`).
    ///
    /// Returns whether the semaphore was taken.
    pub fn take_timeout(&self, timeout: Option<Duration>) -> bool {
        let mut given = relock(self.given.lock());

        match timeout {
            None => {
                while !*given {
                    given = relock(self.cond.wait(given));
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;

                while !*given {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                        return false;
                    };

                    given = relock_timeout(self.cond.wait_timeout(given, remaining)).0;
                }
            }
        }

        *given = false;
        true
    }
}

/// A one-shot latch: opens once, stays open.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Construct a closed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch, releasing every waiter.
    pub fn open(&self) {
        let mut open = relock(self.open.lock());
        *open = true;
        self.cond.notify_all();
    }

    /// Whether the latch is open.
    pub fn is_open(&self) -> bool {
        *relock(self.open.lock())
    }

    /// Wait until the latch opens.
    pub fn wait(&self) {
        let mut open = relock(self.open.lock());

        while !*open {
            open = relock(self.cond.wait(open));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_try_take_consumes() {
        let sem = BinSem::new(true);

        assert!(sem.try_take());
        assert!(!sem.try_take());

        sem.give();
        assert!(sem.try_take());
    }

    #[test]
    fn test_gives_collapse() {
        let sem = BinSem::new(false);

        sem.give();
        sem.give();

        assert!(sem.try_take());
        assert!(!sem.try_take());
    }

    #[test]
    fn test_take_timeout_expires() {
        let sem = BinSem::new(false);
        let start = Instant::now();

        assert!(!sem.take_timeout(Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_take_wakes_on_give() {
        let sem = Arc::new(BinSem::new(false));

        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.take_timeout(Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(10));
        sem.give();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_latch_releases_waiters() {
        let latch = Arc::new(Latch::new());
        assert!(!latch.is_open());

        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };

        thread::sleep(Duration::from_millis(10));
        latch.open();
        waiter.join().unwrap();

        assert!(latch.is_open());
        // Opening twice is harmless.
        latch.open();
    }
}

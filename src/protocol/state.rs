//! Observable state for blocking protocol operations
//!
//! Circuits and streams publish their lifecycle state through a [`Watch`].
//! The receive thread sets it, callers block on it until a predicate holds
//! or a deadline passes. Every wait is bounded.

use crate::error::{Result, TorError};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a holder panicked
///
/// Protocol state stays consistent across a panicking caller because every
/// mutation is a single assignment or push under the lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A value guarded by a mutex with change notification
#[derive(Debug, Default)]
pub struct Watch<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T: Clone> Watch<T> {
    /// Current value
    pub fn get(&self) -> T {
        lock(&self.value).clone()
    }
}

impl<T> Watch<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    /// Run `f` on the value under the lock, then wake every waiter
    pub fn modify<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let result = f(&mut *lock(&self.value));
        self.changed.notify_all();
        result
    }

    /// Read the value under the lock without waking anyone
    pub fn with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        f(&*lock(&self.value))
    }

    /// Replace the value and wake every waiter
    pub fn set(&self, value: T) {
        *lock(&self.value) = value;
        self.changed.notify_all();
    }

    /// Replace the value if `f` accepts the current one
    ///
    /// Returns whether the update happened. Used where a transition is only
    /// legal from particular states.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        let mut guard = lock(&self.value);
        match f(&*guard) {
            Some(next) => {
                *guard = next;
                drop(guard);
                self.changed.notify_all();
                true
            }
            None => false,
        }
    }

    /// Block until `done` returns a result for the current value
    ///
    /// `done` returns `None` to keep waiting, `Some(Ok(_))` to finish or
    /// `Some(Err(_))` to give up. It may consume from the value while it
    /// holds the lock. Waiting longer than `timeout` is a
    /// [`TorError::Timeout`] naming `what`.
    pub fn wait_for<R, F>(&self, timeout: Duration, what: &str, mut done: F) -> Result<R>
    where
        F: FnMut(&mut T) -> Option<Result<R>>,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.value);

        loop {
            if let Some(result) = done(&mut *guard) {
                self.changed.notify_all();
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TorError::Timeout(format!(
                    "{} after {:?}",
                    what, timeout
                )));
            }

            guard = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

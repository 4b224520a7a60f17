//! Poison-tolerant lock helpers.
//!
//! A panicking dispatch callback must not wedge the IRQ path or the reset worker, so every lock in
//! the crate recovers the guard from a poisoned mutex.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn wait_while<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    condition: impl FnMut(&mut T) -> bool,
) -> MutexGuard<'a, T> {
    match cv.wait_while(guard, condition) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Returns the guard and whether the wait timed out with `condition` still true.
pub(crate) fn wait_timeout_while<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    condition: impl FnMut(&mut T) -> bool,
) -> (MutexGuard<'a, T>, bool) {
    match cv.wait_timeout_while(guard, timeout, condition) {
        Ok((guard, res)) => (guard, res.timed_out()),
        Err(poisoned) => {
            let (guard, res) = poisoned.into_inner();
            (guard, res.timed_out())
        }
    }
}

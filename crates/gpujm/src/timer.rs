//! One-shot timers backed by a dedicated thread.
//!
//! Callbacks run on the timer thread and must not block on anything the canceller may hold:
//! [`OneShotTimer::cancel`] waits for a callback that already started, the same way a kernel
//! `hrtimer_cancel` does.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{JmError, Result};
use crate::sync::{lock, wait_timeout_while};

#[derive(Debug, Default)]
struct TimerFlags {
    cancelled: bool,
    fired: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    flags: Mutex<TimerFlags>,
    cv: Condvar,
}

#[derive(Debug)]
pub(crate) struct OneShotTimer {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    pub(crate) fn start<F>(name: &'static str, delay: Duration, callback: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(TimerShared::default());
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let flags = lock(&thread_shared.flags);
                let (mut flags, timed_out) =
                    wait_timeout_while(&thread_shared.cv, flags, delay, |f| !f.cancelled);
                if !timed_out || flags.cancelled {
                    return;
                }
                flags.fired = true;
                drop(flags);
                callback();
            })
            .map_err(|source| JmError::Spawn { name, source })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Cancels the timer and waits for a running callback to return.
    ///
    /// Returns `true` if the timer was still pending (the callback never ran).
    pub(crate) fn cancel(mut self) -> bool {
        self.cancel_inner()
    }

    fn cancel_inner(&mut self) -> bool {
        let pending = {
            let mut flags = lock(&self.shared.flags);
            let pending = !flags.fired;
            flags.cancelled = true;
            pending
        };
        self.shared.cv.notify_all();

        if let Some(thread) = self.thread.take() {
            // The callback itself may drop the last reference to its owner.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        pending
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

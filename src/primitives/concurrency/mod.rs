#![forbid(unsafe_code)]
//! Manual-reset events for batch-end and free-frame waits.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default, Debug)]
struct EventState {
    set: bool,
    signal_count: u64,
}

/// A manual-reset event: `set` wakes every waiter and stays signalled until
/// `reset`.
///
/// `reset` returns the signal count so a waiter can close the race between
/// checking a condition and sleeping: `wait_low(count)` returns immediately
/// if the event was set again after that reset.
#[derive(Default, Debug)]
pub struct Event {
    state: Mutex<EventState>,
    cv: Condvar,
}

impl Event {
    /// Creates an event in the given state.
    pub fn new(set: bool) -> Self {
        Self {
            state: Mutex::new(EventState {
                set,
                signal_count: 1,
            }),
            cv: Condvar::new(),
        }
    }

    /// Signals the event, waking all waiters.
    pub fn set(&self) {
        let mut state = self.state.lock();
        if !state.set {
            state.set = true;
            state.signal_count += 1;
            self.cv.notify_all();
        }
    }

    /// Clears the event and returns the current signal count.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.set = false;
        state.signal_count
    }

    /// Returns true while the event is signalled.
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        self.wait_low(0);
    }

    /// Blocks until the event is set or has been signalled since the reset
    /// that returned `reset_count`.
    pub fn wait_low(&self, reset_count: u64) {
        let mut state = self.state.lock();
        let start = if reset_count == 0 {
            state.signal_count
        } else {
            reset_count
        };
        while !state.set && state.signal_count == start {
            self.cv.wait(&mut state);
        }
    }

    /// Like [`Event::wait_low`] with an upper bound; returns false on timeout.
    pub fn wait_timeout(&self, reset_count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let start = if reset_count == 0 {
            state.signal_count
        } else {
            reset_count
        };
        while !state.set && state.signal_count == start {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                return state.set || state.signal_count != start;
            }
        }
        true
    }
}

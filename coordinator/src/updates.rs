// Copyright 2025 Oxide Computer Company

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Events the coordinator publishes for the surrounding stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Something about the named mirror changed; consumers re-`stat` it.
    Mirror(String),
}

/// Append-only event feed with a cursor interface.  The watchdog posts
/// here when it sees the data-path daemon report a dead mirror.
pub struct UpdateBus {
    inner: Mutex<Vec<Event>>,
    bell: Condvar,
}

impl UpdateBus {
    pub fn new() -> UpdateBus {
        UpdateBus {
            inner: Mutex::new(Vec::new()),
            bell: Condvar::new(),
        }
    }

    pub fn post(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        inner.push(event);
        self.bell.notify_all();
    }

    /// Return events after `from`, blocking up to `timeout` for the first
    /// one.  The new cursor is the second element.
    pub fn next(&self, from: usize, timeout: Duration) -> (Vec<Event>, usize) {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() <= from {
            let (guard, _) = self.bell.wait_timeout(inner, timeout).unwrap();
            inner = guard;
        }
        let events = inner[from.min(inner.len())..].to_vec();
        let cursor = inner.len();
        (events, cursor)
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}

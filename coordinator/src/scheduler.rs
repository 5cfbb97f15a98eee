// Copyright 2025 Oxide Computer Company

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{warn, Logger};

/// Persists as a bare integer; meaningless after a restart, which is fine
/// because timers do not survive the process either.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
)]
#[serde(transparent)]
pub struct SchedulerHandle(pub u64);

pub type Callback = Box<dyn FnOnce() + Send>;

/// The timer contract the mirror watchdog relies on: arm a callback after a
/// delay, or unarm it before it fires.
pub trait Scheduler: Sync + Send {
    fn one_shot(
        &self,
        delay: Duration,
        name: &str,
        cb: Callback,
    ) -> SchedulerHandle;
    fn cancel(&self, handle: SchedulerHandle);
}

/// One sleeping thread per armed timer.  The armed set is the source of
/// truth: cancellation removes the handle, and an expired sleeper only runs
/// its callback if it can still claim the handle.
pub struct ThreadScheduler {
    log: Logger,
    next: AtomicU64,
    armed: Arc<Mutex<BTreeSet<u64>>>,
}

impl ThreadScheduler {
    pub fn new(log: Logger) -> ThreadScheduler {
        ThreadScheduler {
            log,
            next: AtomicU64::new(1),
            armed: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn one_shot(
        &self,
        delay: Duration,
        name: &str,
        cb: Callback,
    ) -> SchedulerHandle {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.armed.lock().unwrap().insert(id);

        let armed = Arc::clone(&self.armed);
        let log = self.log.clone();
        let name = name.to_string();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if !armed.lock().unwrap().remove(&id) {
                return;
            }
            // A panicking callback must not take the scheduler down.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb))
                .is_err()
            {
                warn!(log, "scheduled callback {} panicked", name);
            }
        });

        SchedulerHandle(id)
    }

    fn cancel(&self, handle: SchedulerHandle) {
        self.armed.lock().unwrap().remove(&handle.0);
    }
}

/// Manual scheduler for tests: callbacks fire only when the test says so.
#[cfg(test)]
pub struct TestScheduler {
    next: AtomicU64,
    pending: Mutex<std::collections::BTreeMap<u64, (String, Callback)>>,
}

#[cfg(test)]
impl TestScheduler {
    pub fn new() -> TestScheduler {
        TestScheduler {
            next: AtomicU64::new(1),
            pending: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    pub fn armed(&self) -> Vec<SchedulerHandle> {
        self.pending
            .lock()
            .unwrap()
            .keys()
            .map(|k| SchedulerHandle(*k))
            .collect()
    }

    /// Fire one armed timer now, as the timer thread would.
    pub fn fire(&self, handle: SchedulerHandle) -> bool {
        let cb = self.pending.lock().unwrap().remove(&handle.0);
        match cb {
            Some((_, cb)) => {
                cb();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
impl Scheduler for TestScheduler {
    fn one_shot(
        &self,
        _delay: Duration,
        name: &str,
        cb: Callback,
    ) -> SchedulerHandle {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap()
            .insert(id, (name.to_string(), cb));
        SchedulerHandle(id)
    }

    fn cancel(&self, handle: SchedulerHandle) {
        self.pending.lock().unwrap().remove(&handle.0);
    }
}

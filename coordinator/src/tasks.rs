// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use slog::{error, info, o, Logger};
use uuid::Uuid;

use sxm_common::SxmError;

use crate::storage::VdiInfo;

/// What a finished task hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Mirror(String),
    Vdi(Box<VdiInfo>),
    Unit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Pending,
    Completed(TaskResult),
    Failed(SxmError),
    Cancelled,
}

/// Shared cancellation flag.  Long-running steps poll it; `sparse_dd`
/// checks between progress reads and kills its child when it trips.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct TaskEntry {
    name: String,
    status: TaskStatus,
    progress: f64,
    cancel: CancelToken,
}

/// Long-running verbs run as tasks: the id comes back immediately, a
/// dedicated worker thread does the work, and the caller polls or waits
/// for the terminal status.
pub struct TaskService {
    log: Logger,
    inner: Mutex<BTreeMap<String, TaskEntry>>,
    bell: Condvar,
}

/// The worker side of one task: progress reporting and cancellation
/// checks, without access to other tasks.
#[derive(Clone)]
pub struct TaskHandle {
    pub id: String,
    svc: Arc<TaskService>,
    cancel: CancelToken,
}

impl TaskHandle {
    pub fn set_progress(&self, progress: f64) {
        let mut inner = self.svc.inner.lock().unwrap();
        if let Some(t) = inner.get_mut(&self.id) {
            t.progress = progress.clamp(0.0, 1.0);
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fail fast at a step boundary if the task was cancelled.
    pub fn check_cancelled(&self) -> Result<(), SxmError> {
        if self.cancel.cancelled() {
            Err(SxmError::Cancelled(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

impl TaskService {
    pub fn new(log: Logger) -> TaskService {
        TaskService {
            log,
            inner: Mutex::new(BTreeMap::new()),
            bell: Condvar::new(),
        }
    }

    /// Register a task and run `f` on its own worker thread.  A worker
    /// that returns an error after its cancel token tripped completes as
    /// `Cancelled`, not `Failed`.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, f: F) -> String
    where
        F: FnOnce(TaskHandle) -> Result<TaskResult, SxmError>
            + Send
            + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(
                id.clone(),
                TaskEntry {
                    name: name.to_string(),
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    cancel: cancel.clone(),
                },
            );
        }

        let svc = Arc::clone(self);
        let handle = TaskHandle {
            id: id.clone(),
            svc: Arc::clone(self),
            cancel: cancel.clone(),
        };
        let log = self.log.new(o!("task" => id.clone(), "name" => name.to_string()));
        let tid = id.clone();
        std::thread::spawn(move || {
            let result = f(handle);
            let status = match result {
                Ok(r) => TaskStatus::Completed(r),
                Err(SxmError::Cancelled(_)) => TaskStatus::Cancelled,
                Err(e) if cancel.cancelled() => {
                    info!(log, "cancelled task failed with {}", e);
                    TaskStatus::Cancelled
                }
                Err(e) => {
                    error!(log, "task failed: {}", e);
                    TaskStatus::Failed(e)
                }
            };
            let mut inner = svc.inner.lock().unwrap();
            if let Some(t) = inner.get_mut(&tid) {
                t.status = status;
                if matches!(t.status, TaskStatus::Completed(_)) {
                    t.progress = 1.0;
                }
            }
            svc.bell.notify_all();
        });

        id
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.inner.lock().unwrap().get(id).map(|t| t.status.clone())
    }

    pub fn progress(&self, id: &str) -> Option<f64> {
        self.inner.lock().unwrap().get(id).map(|t| t.progress)
    }

    pub fn name(&self, id: &str) -> Option<String> {
        self.inner.lock().unwrap().get(id).map(|t| t.name.clone())
    }

    /// Trip the task's cancel token.  The worker still runs its cleanup
    /// actions; the terminal status becomes `Cancelled`.
    pub fn cancel(&self, id: &str) -> Result<(), SxmError> {
        let inner = self.inner.lock().unwrap();
        match inner.get(id) {
            Some(t) => {
                t.cancel.trip();
                Ok(())
            }
            None => {
                Err(SxmError::DoesNotExist("task".to_string(), id.to_string()))
            }
        }
    }

    /// Block until the task reaches a terminal status, or `timeout`.
    pub fn wait(&self, id: &str, timeout: Duration) -> Option<TaskStatus> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.get(id) {
                None => return None,
                Some(t) if t.status != TaskStatus::Pending => {
                    return Some(t.status.clone())
                }
                Some(_) => (),
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Some(TaskStatus::Pending);
            }
            let (guard, _) =
                self.bell.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Drop a finished task record.
    pub fn destroy(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }
}

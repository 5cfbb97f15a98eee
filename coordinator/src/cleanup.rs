// Copyright 2025 Oxide Computer Company

use slog::{info, warn, Logger};

use sxm_common::SxmError;

type Action = Box<dyn FnOnce() -> Result<(), SxmError> + Send>;

/// Ordered list of compensating actions.  Every irreversible step of a
/// multi-step operation pushes its undo here before the next step begins;
/// on failure the whole stack runs last-in-first-out, each action
/// best-effort so one failing cleanup never masks the rest.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, Action)>,
}

impl CleanupStack {
    pub fn new() -> CleanupStack {
        CleanupStack { actions: Vec::new() }
    }

    pub fn add<F>(&mut self, label: &str, f: F)
    where
        F: FnOnce() -> Result<(), SxmError> + Send + 'static,
    {
        self.actions.push((label.to_string(), Box::new(f)));
    }

    /// Prepend another stack's contents, so our own actions undo first.
    pub fn combine(&mut self, mut other: CleanupStack) {
        other.actions.append(&mut self.actions);
        self.actions = other.actions;
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn perform_actions(mut self, log: &Logger) {
        while let Some((label, action)) = self.actions.pop() {
            info!(log, "cleanup: {}", label);
            if let Err(e) = action() {
                warn!(log, "cleanup {} failed: {}", label, e);
            }
        }
    }
}

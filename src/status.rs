//! The coarse engine state that presentation layers observe.
//!
//! One [`StatusModel`] is owned by the engine and shared by reference. Every
//! change goes through it, and every change is pushed to the subscribed
//! observers in the order it happened.

use crate::progress::ProgressSample;
use crate::tools::ProvisionProgress;
use crate::ytdlp::TaskDescriptor;
use crate::{EngineError, Result};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Idle,
    ProvisioningTool {
        tool: String,
        progress: Option<ProvisionProgress>,
    },
    Running {
        task: TaskDescriptor,
        progress: Option<ProgressSample>,
    },
    Failed {
        reason: String,
        code: String,
    },
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::ProvisioningTool { .. } => "provisioning_tool",
            Status::Running { .. } => "running",
            Status::Failed { .. } => "failed",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Status::Idle)
    }

    fn failed(err: &EngineError) -> Self {
        Status::Failed {
            reason: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

fn transition_allowed(from: &Status, to: &Status) -> bool {
    matches!(
        (from, to),
        (Status::Idle, Status::ProvisioningTool { .. })
            | (Status::Idle, Status::Running { .. })
            | (Status::ProvisioningTool { .. }, Status::ProvisioningTool { .. })
            | (Status::ProvisioningTool { .. }, Status::Idle)
            | (Status::ProvisioningTool { .. }, Status::Failed { .. })
            | (Status::Running { .. }, Status::Running { .. })
            | (Status::Running { .. }, Status::Idle)
            | (Status::Running { .. }, Status::Failed { .. })
            | (Status::Failed { .. }, Status::Idle)
    )
}

type Observer = Box<dyn Fn(&Status) + Send + Sync>;

pub struct StatusModel {
    state: Mutex<Status>,
    observers: Mutex<Vec<Observer>>,
}

impl Default for StatusModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatusModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusModel")
            .field("state", &*self.lock_state())
            .finish_non_exhaustive()
    }
}

impl StatusModel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Status::Idle),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Status {
        self.lock_state().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.lock_state().is_idle()
    }

    /// Registers a change observer. Observers run while the model is locked
    /// and must not call back into it.
    pub fn subscribe(&self, observer: impl Fn(&Status) + Send + Sync + 'static) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(observer));
    }

    /// Applies a validated transition.
    pub fn transition(&self, next: Status) -> Result<()> {
        let mut state = self.lock_state();
        if !transition_allowed(&state, &next) {
            return Err(EngineError::InvalidTransition {
                from: state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        self.apply(&mut state, next);
        Ok(())
    }

    /// `Failed -> Idle`; any other state is left alone.
    pub fn acknowledge_failure(&self) {
        let mut state = self.lock_state();
        if matches!(*state, Status::Failed { .. }) {
            self.apply(&mut state, Status::Idle);
        }
    }

    pub fn begin_provisioning(&self, tool: &str) -> Result<ActiveSlot<'_>> {
        self.claim(Status::ProvisioningTool {
            tool: tool.to_string(),
            progress: None,
        })
    }

    pub fn begin_run(&self, task: TaskDescriptor) -> Result<ActiveSlot<'_>> {
        self.claim(Status::Running {
            task,
            progress: None,
        })
    }

    fn claim(&self, next: Status) -> Result<ActiveSlot<'_>> {
        let mut state = self.lock_state();
        if !state.is_idle() {
            return Err(EngineError::Busy {
                state: state.name().to_string(),
            });
        }
        self.apply(&mut state, next);
        Ok(ActiveSlot {
            model: self,
            finished: false,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, Status> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, state: &mut MutexGuard<'_, Status>, next: Status) {
        if state.name() != next.name() {
            info!(from = state.name(), to = next.name(), "status changed");
        }
        **state = next;
        let snapshot = (**state).clone();
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for observer in observers.iter() {
            observer(&snapshot);
        }
    }

    fn update_progress(&self, update: impl FnOnce(&mut Status) -> bool) {
        let mut state = self.lock_state();
        let mut next = (*state).clone();
        if update(&mut next) {
            self.apply(&mut state, next);
        }
    }

    fn settle(&self, next: Status) {
        let mut state = self.lock_state();
        if transition_allowed(&state, &next) {
            self.apply(&mut state, next);
        } else {
            debug!(from = state.name(), to = next.name(), "ignoring settle");
        }
    }
}

/// Exclusive claim on the model while provisioning or running. Finish it with
/// [`ActiveSlot::finish`]; dropping it unfinished marks the status failed.
#[must_use = "dropping the slot immediately marks the operation as interrupted"]
pub struct ActiveSlot<'a> {
    model: &'a StatusModel,
    finished: bool,
}

impl ActiveSlot<'_> {
    pub fn report_run_progress(&self, sample: ProgressSample) {
        self.model.update_progress(|state| match state {
            Status::Running { progress, .. } => {
                *progress = Some(sample);
                true
            }
            _ => false,
        });
    }

    pub fn report_provision_progress(&self, value: ProvisionProgress) {
        self.model.update_progress(|state| match state {
            Status::ProvisioningTool { progress, .. } => {
                if progress.as_ref() == Some(&value) {
                    return false;
                }
                *progress = Some(value);
                true
            }
            _ => false,
        });
    }

    pub fn finish<T>(mut self, result: &Result<T>) {
        self.finished = true;
        let next = match result {
            Ok(_) => Status::Idle,
            Err(err) => Status::failed(err),
        };
        self.model.settle(next);
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.model.settle(Status::Failed {
                reason: "operation interrupted".to_string(),
                code: "interrupted".to_string(),
            });
        }
    }
}

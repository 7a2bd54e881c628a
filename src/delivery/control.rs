//! Control-plane switch for the delivery engine.
//!
//! The flag is process-local and starts [`RunState::Stopped`]; a restart
//! always comes back stopped.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;

/// Whether the engine should process batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// Ticks are no-ops.
    #[default]
    Stopped,
    /// Ticks process a batch.
    Running,
}

/// Shared start/stop flag, handed around in an `Arc`.
#[derive(Debug, Default)]
pub struct DeliveryControl {
    state: Mutex<RunState>,
}

impl DeliveryControl {
    /// New control in the stopped state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin processing on the next tick. Returns the previous state.
    pub fn start(&self) -> RunState {
        let prev = std::mem::replace(&mut *self.lock(), RunState::Running);
        if prev != RunState::Running {
            info!("delivery started");
        }
        prev
    }

    /// Stop processing after the in-flight batch. Returns the previous state.
    pub fn stop(&self) -> RunState {
        let prev = std::mem::replace(&mut *self.lock(), RunState::Stopped);
        if prev != RunState::Stopped {
            info!("delivery stopped");
        }
        prev
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        *self.lock()
    }

    /// Shorthand for `state() == RunState::Running`.
    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Pause / override / resume / cancel signalling between an operator and a run.
//!
//! The operator holds a [`ControlHandle`]; the loop holds the
//! [`PauseController`]. Both share one small state behind a mutex and wake each
//! other through a [`Notify`]. The loop only samples the state at its safe
//! points, so a signal never interrupts an action that already started.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proto::{ControlError, Error, ToolCall};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::tool_registry::Catalog;

#[derive(Default)]
struct ControlState {
    pause_requested: bool,
    paused: bool,
    cancelled: bool,
    finished: bool,
    pending_override: Option<ToolCall>,
    catalog: Option<Arc<Catalog>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ControlState>,
    changed: Notify,
}

impl Shared {
    fn notify(&self) {
        self.changed.notify_waiters();
    }
}

/// Operator-side view of the control state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlStatus {
    pub pause_requested: bool,
    pub paused: bool,
    pub cancelled: bool,
    pub finished: bool,
    pub pending_override: Option<String>,
}

/// Cloneable handle for whoever drives pause/override/resume from outside the loop.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    /// Sets the pause flag. The loop honors it before its next dequeue.
    pub fn request_pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.pause_requested {
            info!("Pause requested");
        }
        state.pause_requested = true;
        drop(state);
        self.shared.notify();
    }

    /// Stores a human call to run before any queued model call.
    ///
    /// Fails with `NoPendingPause` unless a pause is in effect, and with
    /// `OverrideAlreadyPending` while an earlier override is unconsumed. When
    /// a run is active the call is also checked against its catalog.
    pub fn submit_override(&self, call: ToolCall) -> Result<(), Error> {
        let mut state = self.shared.state.lock();
        if !state.pause_requested || state.finished {
            return Err(ControlError::NoPendingPause.into());
        }
        if let Some(existing) = &state.pending_override {
            return Err(ControlError::OverrideAlreadyPending(existing.name.clone()).into());
        }
        if let Some(catalog) = &state.catalog {
            catalog.validate(&call)?;
        }
        info!(tool = %call.name, target = %call.target_key(), "Override accepted");
        state.pending_override = Some(call);
        drop(state);
        self.shared.notify();
        Ok(())
    }

    /// Clears the pause flag.
    pub fn resume(&self) -> Result<(), ControlError> {
        let mut state = self.shared.state.lock();
        if !state.pause_requested {
            return Err(ControlError::NoPendingPause);
        }
        state.pause_requested = false;
        drop(state);
        info!("Resume requested");
        self.shared.notify();
        Ok(())
    }

    /// Requests cancellation; honored at the same safe points as a pause.
    pub fn cancel(&self) {
        self.shared.state.lock().cancelled = true;
        info!("Cancellation requested");
        self.shared.notify();
    }

    /// True once the loop has reached a safe point and halted.
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn status(&self) -> ControlStatus {
        let state = self.shared.state.lock();
        ControlStatus {
            pause_requested: state.pause_requested,
            paused: state.paused,
            cancelled: state.cancelled,
            finished: state.finished,
            pending_override: state.pending_override.as_ref().map(|c| c.name.clone()),
        }
    }

    /// Waits until the loop acknowledges a pause. Returns `false` if the run
    /// finished first.
    pub async fn wait_until_paused(&self) -> bool {
        loop {
            let notified = self.shared.changed.notified();
            {
                let state = self.shared.state.lock();
                if state.paused {
                    return true;
                }
                if state.finished {
                    return false;
                }
            }
            notified.await;
        }
    }
}

/// How a pause ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseExit {
    Resumed,
    Cancelled,
}

/// Loop-side half of the control channel.
pub struct PauseController {
    shared: Arc<Shared>,
}

impl PauseController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Returns a handle for the operator side.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            shared: self.shared.clone(),
        }
    }

    /// Resets per-run flags and binds the catalog overrides are checked against.
    pub(crate) fn begin_run(&self, catalog: Arc<Catalog>) {
        let mut state = self.shared.state.lock();
        state.paused = false;
        state.finished = false;
        state.catalog = Some(catalog);
    }

    pub(crate) fn finish_run(&self) {
        {
            let mut state = self.shared.state.lock();
            state.finished = true;
            state.paused = false;
            state.pause_requested = false;
            state.pending_override = None;
            state.catalog = None;
        }
        self.shared.notify();
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.shared.state.lock().pause_requested
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }

    pub(crate) fn has_pending_override(&self) -> bool {
        self.shared.state.lock().pending_override.is_some()
    }

    pub(crate) fn take_override(&self) -> Option<ToolCall> {
        self.shared.state.lock().pending_override.take()
    }

    /// Marks the loop halted and waits for resume or cancel.
    ///
    /// `on_reminder` fires every `reminder` while still paused with the total
    /// time spent waiting.
    pub(crate) async fn wait_for_resume(
        &self,
        reminder: Duration,
        mut on_reminder: impl FnMut(Duration),
    ) -> PauseExit {
        self.shared.state.lock().paused = true;
        self.shared.notify();
        let started = Instant::now();

        let exit = loop {
            let notified = self.shared.changed.notified();
            {
                let state = self.shared.state.lock();
                if state.cancelled {
                    break PauseExit::Cancelled;
                }
                if !state.pause_requested {
                    break PauseExit::Resumed;
                }
            }
            if tokio::time::timeout(reminder, notified).await.is_err() {
                on_reminder(started.elapsed());
            }
        };

        self.shared.state.lock().paused = false;
        debug!(?exit, waited_ms = started.elapsed().as_millis() as u64, "Pause ended");
        exit
    }
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

//! Wake gate
//!
//! Permission flag for starting a capture. Closed the instant a capture is
//! accepted, reopened when the turn completes, and force-opened by a
//! failsafe timer if nothing else reopens it.

use crate::control::{StatusPush, StatusSink};
use crate::sync::lock;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Delay after which the failsafe reopens the gate
pub const FAILSAFE_DELAY: Duration = Duration::from_secs(45);

struct GateState {
    allowed: bool,
    changed_at: Instant,
    failsafe: Option<JoinHandle<()>>,
}

impl GateState {
    fn cancel_failsafe(&mut self) {
        if let Some(failsafe) = self.failsafe.take() {
            failsafe.abort();
        }
    }
}

pub struct WakeGate {
    state: Mutex<GateState>,
    status: Arc<dyn StatusSink>,
    failsafe_delay: Duration,
    weak: Weak<WakeGate>,
}

impl WakeGate {
    /// A closed gate
    pub fn new(status: Arc<dyn StatusSink>, failsafe_delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(GateState {
                allowed: false,
                changed_at: Instant::now(),
                failsafe: None,
            }),
            status,
            failsafe_delay,
            weak: weak.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        lock(&self.state)
    }

    pub fn is_allowed(&self) -> bool {
        self.state().allowed
    }

    /// When the gate last changed
    pub fn changed_at(&self) -> Instant {
        self.state().changed_at
    }

    /// Open the gate, cancelling a pending failsafe
    pub fn allow(&self) {
        self.set(true);
    }

    /// Close the gate, cancelling a pending failsafe
    pub fn disallow(&self) {
        self.set(false);
    }

    fn set(&self, allowed: bool) {
        let mut state = self.state();
        state.cancel_failsafe();
        if state.allowed != allowed {
            state.changed_at = Instant::now();
        }
        state.allowed = allowed;
        self.status.push(StatusPush::for_wake_gate(allowed));
        tracing::debug!(
            "Wake trigger is now {}",
            if allowed { "allowed" } else { "not allowed" }
        );
    }

    /// Close the gate if it is open; true if this call closed it
    pub fn try_close(&self) -> bool {
        let mut state = self.state();
        if !state.allowed {
            return false;
        }
        state.cancel_failsafe();
        state.allowed = false;
        state.changed_at = Instant::now();
        self.status.push(StatusPush::WakeUpNotAllowed);
        tracing::debug!("Wake trigger is now not allowed");
        true
    }

    /// Schedule the gate to open after the failsafe delay, replacing any
    /// pending failsafe
    pub fn arm_failsafe(&self) {
        let gate = self.weak.clone();
        let delay = self.failsafe_delay;
        let mut state = self.state();
        state.cancel_failsafe();
        state.failsafe = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(gate) = gate.upgrade() {
                tracing::debug!("Wake gate failsafe fired");
                gate.fire_failsafe();
            }
        }));
    }

    fn fire_failsafe(&self) {
        let mut state = self.state();
        // This task is the one being cleared; do not abort it
        state.failsafe.take();
        if !state.allowed {
            state.allowed = true;
            state.changed_at = Instant::now();
        }
        self.status.push(StatusPush::WakeUpAllowed);
    }

    /// Whether a failsafe is pending
    pub fn failsafe_pending(&self) -> bool {
        self.state()
            .failsafe
            .as_ref()
            .map_or(false, |f| !f.is_finished())
    }
}

impl Drop for WakeGate {
    fn drop(&mut self) {
        self.state().cancel_failsafe();
    }
}

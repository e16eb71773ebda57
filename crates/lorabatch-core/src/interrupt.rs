//! Operator interrupt handling.
//!
//! The Ctrl-C handler calls [`InterruptGate::request`]; everything else
//! observes the gate's [`CancellationToken`]. While a [`MaskGuard`] is alive
//! requests are held back and delivered when the last guard drops.

use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct InterruptGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    token: CancellationToken,
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    masks: usize,
    pending: bool,
}

impl InterruptGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires once an interrupt has been delivered.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// True while a request is held back by a mask.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.lock_state().pending
    }

    /// Ask the running batch to stop.
    pub fn request(&self) {
        let mut state = self.lock_state();
        if state.masks > 0 {
            if !state.pending {
                warn!("interrupt received during a protected step, it will take effect when the step finishes");
            }
            state.pending = true;
        } else {
            self.inner.token.cancel();
        }
    }

    /// Hold back interrupt delivery until the returned guard is dropped.
    #[must_use = "the mask is released as soon as the guard is dropped"]
    pub fn mask(&self) -> MaskGuard {
        self.lock_state().masks += 1;
        MaskGuard { gate: self.clone() }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct MaskGuard {
    gate: InterruptGate,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let mut state = self.gate.lock_state();
        state.masks = state.masks.saturating_sub(1);
        if state.masks == 0 && state.pending {
            state.pending = false;
            self.gate.inner.token.cancel();
        }
    }
}

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct GateState {
    ready: bool,
    closed: bool,
    pending: VecDeque<ReadyCallback>,
}

/// One-way readiness latch with a FIFO queue of deferred callbacks.
///
/// Callbacks registered before [`ReadyGate::set_ready`] run exactly once, in
/// registration order, on the thread that signals readiness. Callbacks
/// registered afterwards run immediately on the caller's thread. Callbacks are
/// always invoked without the internal lock held, so they may re-enter the gate.
///
/// [`ReadyGate::close`] marks a gate that will never become ready: queued
/// callbacks are dropped without running, as is anything registered later.
#[derive(Default)]
pub struct ReadyGate {
    state: Mutex<GateState>,
}

impl ReadyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns `true` only for the call that flipped the latch.
    pub fn set_ready(&self) -> bool {
        let drained = {
            let mut state = self.lock();
            if state.ready {
                return false;
            }
            state.ready = true;
            std::mem::take(&mut state.pending)
        };

        for callback in drained {
            callback();
        }
        true
    }

    pub fn resolve_when_ready(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.lock();
            if !state.ready {
                if !state.closed {
                    state.pending.push_back(Box::new(callback));
                }
                return;
            }
        }
        callback();
    }

    /// Returns the number of callbacks dropped. No effect once ready.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            if state.ready {
                return 0;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        dropped.len()
    }

    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.closed && !state.ready
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

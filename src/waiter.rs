//! The bounded FIFO of pending grant requests (§4.3 `WaiterQueue`).

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::time::Moment;

/// Why a waiter's `request_grant` future resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GrantReason {
    Grant,
    Stopping,
    Full,
}

/// The result delivered to a `request_grant` caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrantResult {
    pub done: bool,
    pub grant: f64,
    pub reason: GrantReason,
    pub wait_time: f64,
}

impl GrantResult {
    pub(crate) fn granted(grant: f64, wait_time: f64) -> Self {
        GrantResult {
            done: true,
            grant,
            reason: GrantReason::Grant,
            wait_time,
        }
    }

    pub(crate) fn stopping(wait_time: f64) -> Self {
        GrantResult {
            done: false,
            grant: 0.0,
            reason: GrantReason::Stopping,
            wait_time,
        }
    }

    pub(crate) fn full() -> Self {
        GrantResult {
            done: false,
            grant: 0.0,
            reason: GrantReason::Full,
            wait_time: 0.0,
        }
    }
}

/// An enqueued, not-yet-satisfied grant request.
pub(crate) struct Waiter {
    pub grant: f64,
    pub start_time: Moment,
    pub completion: oneshot::Sender<GrantResult>,
}

/// FIFO of [`Waiter`]s, drained only by the worker body and by `deny_all`.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    queue: VecDeque<Waiter>,
}

impl WaiterQueue {
    pub fn push_back(&mut self, waiter: Waiter) {
        self.queue.push_back(waiter);
    }

    pub fn front(&self) -> Option<&Waiter> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<Waiter> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain and fulfill every waiter with a `Stopping` result, in FIFO
    /// order, as required when `deny_all` completes the worker.
    pub fn drain_stopping(&mut self, now: Moment) {
        while let Some(waiter) = self.queue.pop_front() {
            let wait_time = (now - waiter.start_time).max(0.0);
            let _ = waiter.completion.send(GrantResult::stopping(wait_time));
        }
    }
}

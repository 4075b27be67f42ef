//! The accumulator, public API, and worker body (§4.4-§4.8).

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::config::BucketConfig;
use crate::error::BucketError;
use crate::quantity::Quantity;
use crate::threadlet::{Raced, Runner, Threadlet};
use crate::time::Moment;
use crate::waiter::{GrantResult, Waiter, WaiterQueue};

/// A point-in-time view of bucket occupancy, as of the most recent
/// top-up. Deliberately side-effect free: does not consult the time
/// source (§4.8).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub available_burst: f64,
    pub available_queue: f64,
    pub now: Moment,
    pub waiter_count: usize,
}

/// Outcome of a synchronous, non-blocking `take_now` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeResult {
    pub done: bool,
    pub grant: f64,
    pub wait_until: Moment,
}

struct BucketState {
    last_now: Moment,
    last_burst_size: f64,
    waiters: WaiterQueue,
    queue_size: f64,
}

/// Config + mutable state, shared between `TokenBucket`'s synchronous
/// methods and the worker task. Never held across an `.await`.
struct Core {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl Core {
    /// §4.4 `top_up`: accrue tokens for elapsed time, never past
    /// `max_burst_size`, never backward in time.
    fn top_up(&self, state: &mut BucketState, now: Moment) {
        if state.last_burst_size < self.config.max_burst_size() {
            let elapsed = (now - state.last_now).max(0.0);
            let accrued = elapsed * self.config.flow_rate();
            state.last_burst_size = (state.last_burst_size + accrued).min(self.config.max_burst_size());
        }
        state.last_now = state.last_now.max(now);
    }

    /// The value `compute_grant` should treat as "tokens in the bucket",
    /// floored when the bucket only deals in whole tokens.
    fn effective_available(&self, state: &BucketState) -> f64 {
        if self.config.partial_tokens() {
            state.last_burst_size
        } else {
            state.last_burst_size.floor()
        }
    }

    /// §4.4 `compute_grant`. Returns `0.0` (and the caller must separately
    /// check `available >= min_incl` to know whether that's a real grant
    /// of zero or "not enough tokens") when the minimum can't be met.
    fn compute_grant(&self, available: f64, min_incl: f64, max_incl: f64) -> f64 {
        let capacity = max_incl.min(self.config.max_burst_size());
        if available < min_incl {
            0.0
        } else {
            available.min(capacity)
        }
    }

    fn snapshot(&self, state: &BucketState) -> Snapshot {
        let available_queue = if self.config.max_queue_size().is_finite() {
            (self.config.max_queue_size() - state.queue_size).max(0.0)
        } else {
            f64::INFINITY
        };
        Snapshot {
            available_burst: state.last_burst_size,
            available_queue,
            now: state.last_now,
            waiter_count: state.waiters.len(),
        }
    }
}

/// Enum describing what the worker did in one loop iteration, used to
/// keep the `state` lock's scope separate from the `.await` that follows
/// it (§5: exactly one suspension point per iteration).
enum WorkerStep {
    QueueEmpty,
    Granted,
    Wait(Moment),
}

/// The rate limiter: a leaky bucket of tokens, a bounded FIFO of waiters,
/// and the cooperative worker that drains that FIFO.
pub struct TokenBucket {
    core: Arc<Core>,
    worker: Arc<Threadlet<BucketError>>,
}

impl TokenBucket {
    pub fn new(config: BucketConfig) -> Self {
        let state = BucketState {
            last_now: config.time_source().now(),
            last_burst_size: config.initial_burst_size(),
            waiters: WaiterQueue::default(),
            queue_size: 0.0,
        };
        let core = Arc::new(Core {
            config,
            state: Mutex::new(state),
        });

        let worker_core = Arc::clone(&core);
        let worker = Threadlet::new(
            "token_bucket_worker",
            || async { Ok(()) },
            move |runner: Runner| {
                let core = Arc::clone(&worker_core);
                async move { worker_body(core, runner).await }.instrument(info_span!("token_bucket_worker"))
            },
        );

        TokenBucket { core, worker }
    }

    pub fn config(&self) -> &BucketConfig {
        &self.core.config
    }

    /// §4.5. Never blocks, never enqueues, never touches the waiter queue.
    pub fn take_now(&self, quantity: impl Into<Quantity>) -> Result<TakeResult, BucketError> {
        let normalized = quantity.into().normalize(
            self.core.config.partial_tokens(),
            self.core.config.max_queue_grant_size(),
        )?;

        let mut state = self.core.state.lock().unwrap();
        let now = self.core.config.time_source().now();
        self.core.top_up(&mut state, now);
        let available = self.core.effective_available(&state);
        let queue_was_empty = state.waiters.is_empty();

        if queue_was_empty && available >= normalized.min_inclusive {
            let capacity = normalized.max_inclusive.min(self.core.config.max_burst_size());
            let grant = available.min(capacity);
            state.last_burst_size -= grant;
            trace!(grant, "take_now granted synchronously");
            return Ok(TakeResult {
                done: true,
                grant,
                wait_until: state.last_now,
            });
        }

        let waited_grant = normalized
            .max_inclusive
            .min(self.core.config.max_queue_grant_size());
        let deficit = (waited_grant - available).max(0.0);
        let wait_until =
            state.last_now + deficit / self.core.config.flow_rate() + state.queue_size / self.core.config.flow_rate();
        Ok(TakeResult {
            done: false,
            grant: 0.0,
            wait_until,
        })
    }

    /// §4.6. Resolves synchronously for the common cases; suspends at
    /// most once, on the worker's decision, otherwise.
    pub async fn request_grant(&self, quantity: impl Into<Quantity>) -> Result<GrantResult, BucketError> {
        let normalized = quantity.into().normalize(
            self.core.config.partial_tokens(),
            self.core.config.max_queue_grant_size(),
        )?;

        let rx = {
            let mut state = self.core.state.lock().unwrap();

            if state.waiters.is_empty() {
                let now = self.core.config.time_source().now();
                self.core.top_up(&mut state, now);
                let available = self.core.effective_available(&state);
                if available >= normalized.min_inclusive {
                    let grant = self.core.compute_grant(
                        available,
                        normalized.min_inclusive,
                        normalized.max_inclusive,
                    );
                    state.last_burst_size -= grant;
                    debug!(grant, "request_grant granted synchronously");
                    return Ok(GrantResult::granted(grant, 0.0));
                }
            }

            if normalized.min_inclusive == 0.0 {
                debug!("request_grant: zero-minimum request satisfied with an empty grant");
                return Ok(GrantResult::granted(0.0, 0.0));
            }

            let queued_grant = normalized
                .max_inclusive
                .min(self.core.config.max_queue_grant_size());
            if queued_grant == 0.0 || state.queue_size + queued_grant > self.core.config.max_queue_size() {
                warn!(queued_grant, queue_size = state.queue_size, "request_grant: queue full");
                return Ok(GrantResult::full());
            }

            let (tx, rx) = oneshot::channel();
            let start_time = state.last_now;
            state.waiters.push_back(Waiter {
                grant: queued_grant,
                start_time,
                completion: tx,
            });
            state.queue_size += queued_grant;
            debug!(queued_grant, queue_size = state.queue_size, "request_grant: enqueued");
            // Start (or confirm already-running) the worker before
            // releasing the lock, so invariant 5 ("non-empty queue implies
            // a running worker") holds with no externally observable gap.
            self.worker.run();
            rx
        };

        rx.await.map_err(|_| {
            BucketError::Unavailable("worker dropped the waiter's completion channel".into())
        })
    }

    /// §4.8. Resolves once every waiter enqueued up to this point has
    /// been told `reason = Stopping`. Idempotent.
    pub async fn deny_all(&self) {
        let already_empty = {
            let state = self.core.state.lock().unwrap();
            state.waiters.is_empty()
        };
        if already_empty {
            return;
        }
        if let Err(e) = self.worker.stop().await {
            warn!(error = ?e, "deny_all: worker ended with an error while stopping");
        }
    }

    /// §4.8. Cheap, side-effect-free snapshot as of the last top-up.
    pub fn latest_state(&self) -> Snapshot {
        let state = self.core.state.lock().unwrap();
        self.core.snapshot(&state)
    }
}

async fn worker_body(core: Arc<Core>, runner: Runner) -> Result<(), BucketError> {
    loop {
        if runner.should_stop() {
            break;
        }

        let step = {
            let mut state = core.state.lock().unwrap();
            if state.waiters.is_empty() {
                WorkerStep::QueueEmpty
            } else {
                let now = core.config.time_source().now();
                core.top_up(&mut state, now);
                let available = core.effective_available(&state);
                let head_grant = state.waiters.front().expect("just checked non-empty").grant;

                if available >= head_grant {
                    let waiter = state.waiters.pop_front().expect("front() just succeeded");
                    state.queue_size -= waiter.grant;
                    state.last_burst_size -= waiter.grant;
                    let wait_time = (state.last_now - waiter.start_time).max(0.0);
                    trace!(grant = waiter.grant, wait_time, "worker: head satisfied");
                    let _ = waiter.completion.send(GrantResult::granted(waiter.grant, wait_time));
                    WorkerStep::Granted
                } else {
                    let deficit = (head_grant - available).max(0.0);
                    let target = state.last_now + deficit / core.config.flow_rate();
                    WorkerStep::Wait(target)
                }
            }
        };

        match step {
            WorkerStep::QueueEmpty => break,
            WorkerStep::Granted => continue,
            WorkerStep::Wait(target) => {
                trace!(?target, "worker: waiting for head to become eligible");
                if let Raced::Stopped = runner
                    .race_with_stop(core.config.time_source().wait_until(target))
                    .await
                {
                    break;
                }
            }
        }
    }

    if runner.should_stop() {
        let mut state = core.state.lock().unwrap();
        let now = core.config.time_source().now();
        core.top_up(&mut state, now);
        let now = state.last_now;
        let remaining = state.waiters.len();
        state.waiters.drain_stopping(now);
        state.queue_size = 0.0;
        if remaining > 0 {
            debug!(remaining, "worker: denied remaining waiters on stop");
        }
    }

    Ok(())
}

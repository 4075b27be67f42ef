//! Time abstraction used throughout the bucket.
//!
//! `TimeSource` is the only way the rest of this crate learns what time it
//! is. Production code uses [`RealTimeSource`], backed by `tokio`'s
//! monotonic clock; tests use [`MockTimeSource`], which only advances when
//! told to and fires waiters deterministically.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::{Add, Sub};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant as TokioInstant;

/// A point in time, seconds since some fixed (implementation-defined) epoch.
///
/// Stored as `f64` so that sub-token fractional accounting (partial grants,
/// fractional flow rates) composes without an intermediate integer
/// nanosecond representation.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Moment(f64);

impl Moment {
    pub const EPOCH: Moment = Moment(0.0);

    pub fn from_secs_f64(secs: f64) -> Self {
        Moment(secs)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0
    }

    /// `self` if `self >= other`, else `other`.
    pub fn max(self, other: Moment) -> Moment {
        if self.0 >= other.0 { self } else { other }
    }
}

impl Add<f64> for Moment {
    type Output = Moment;
    fn add(self, rhs: f64) -> Moment {
        Moment(self.0 + rhs)
    }
}

impl Sub<Moment> for Moment {
    /// Duration in seconds between two moments. Negative if `self < rhs`,
    /// callers that need a non-negative duration should clamp explicitly.
    type Output = f64;
    fn sub(self, rhs: Moment) -> f64 {
        self.0 - rhs.0
    }
}

/// An injectable source of time. Implementations must be cheap to clone
/// (typically an `Arc`-wrapped handle) and safe to share across tasks.
#[async_trait]
pub trait TimeSource: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Moment;

    /// Resolves at or after `target`. An implementation may wake spuriously
    /// early; callers re-check their condition. Dropping the returned
    /// future must cancel the wait without any observable side effect.
    async fn wait_until(&self, target: Moment);
}

/// Real-clock `TimeSource`, backed by `tokio`'s monotonic clock.
///
/// `Moment::EPOCH` corresponds to the instant this value was constructed;
/// `now()` is the elapsed time since then.
#[derive(Clone)]
pub struct RealTimeSource {
    origin: TokioInstant,
}

impl RealTimeSource {
    pub fn new() -> Self {
        RealTimeSource {
            origin: TokioInstant::now(),
        }
    }

    fn instant_for(&self, moment: Moment) -> TokioInstant {
        let delta = moment.as_secs_f64();
        if delta <= 0.0 {
            self.origin
        } else {
            self.origin + std::time::Duration::from_secs_f64(delta)
        }
    }
}

impl Default for RealTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSource for RealTimeSource {
    fn now(&self) -> Moment {
        Moment::from_secs_f64((TokioInstant::now() - self.origin).as_secs_f64())
    }

    async fn wait_until(&self, target: Moment) {
        tokio::time::sleep_until(self.instant_for(target)).await;
    }
}

/// A pending `wait_until` call registered with a [`MockTimeSource`].
struct PendingWake {
    target: Moment,
    seq: u64,
    sender: oneshot::Sender<()>,
}

impl PartialEq for PendingWake {
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target && self.seq == other.seq
    }
}
impl Eq for PendingWake {}

impl PartialOrd for PendingWake {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingWake {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest target (and, among
        // ties, the earliest registered waiter) at the top, so reverse.
        other
            .target
            .partial_cmp(&self.target)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct MockInner {
    now: Moment,
    next_seq: u64,
    pending: BinaryHeap<PendingWake>,
}

/// A deterministic, manually-driven `TimeSource` for tests.
///
/// Time only moves when [`MockTimeSource::set`] or
/// [`MockTimeSource::advance`] is called. Every `wait_until` registered
/// with a target at or before the new time is fired, in target (then
/// registration) order, before `set` returns.
pub struct MockTimeSource {
    inner: Mutex<MockInner>,
}

impl MockTimeSource {
    pub fn new(start: Moment) -> Self {
        MockTimeSource {
            inner: Mutex::new(MockInner {
                now: start,
                next_seq: 0,
                pending: BinaryHeap::new(),
            }),
        }
    }

    pub fn now(&self) -> Moment {
        self.inner.lock().unwrap().now
    }

    /// Move the clock forward (or to the same instant; never backward) and
    /// fire every waiter whose target has been reached.
    pub fn set(&self, new_now: Moment) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            new_now.as_secs_f64() >= inner.now.as_secs_f64(),
            "MockTimeSource time must be monotonic"
        );
        inner.now = new_now;
        while let Some(top) = inner.pending.peek() {
            if top.target.as_secs_f64() > inner.now.as_secs_f64() {
                break;
            }
            let woken = inner.pending.pop().unwrap();
            // Ignore a dropped receiver; the waiting future was cancelled.
            let _ = woken.sender.send(());
        }
    }

    pub fn advance(&self, secs: f64) {
        let now = self.now();
        self.set(now + secs);
    }

    /// Number of callers currently blocked in `wait_until`.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Immediately wake every still-pending waiter without moving the
    /// clock. Intended for test teardown, so a dropped bucket's worker
    /// task doesn't stay parked in `wait_until` past the end of a test.
    pub fn fire_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(woken) = inner.pending.pop() {
            let _ = woken.sender.send(());
        }
    }
}

impl Drop for MockTimeSource {
    fn drop(&mut self) {
        self.fire_all();
    }
}

#[async_trait]
impl TimeSource for MockTimeSource {
    fn now(&self) -> Moment {
        MockTimeSource::now(self)
    }

    async fn wait_until(&self, target: Moment) {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if target.as_secs_f64() <= inner.now.as_secs_f64() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.pending.push(PendingWake {
                    target,
                    seq,
                    sender: tx,
                });
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            // A send failure only happens if the MockTimeSource itself was
            // dropped, in which case there's nothing left to wait for.
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moment_arithmetic() {
        let a = Moment::from_secs_f64(10.0);
        let b = a + 5.0;
        assert_eq!(b.as_secs_f64(), 15.0);
        assert_eq!(b - a, 5.0);
    }

    #[tokio::test]
    async fn mock_time_fires_in_target_order() {
        let clock = MockTimeSource::new(Moment::from_secs_f64(0.0));
        let clock = std::sync::Arc::new(clock);

        let c1 = clock.clone();
        let c2 = clock.clone();
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let h1 = tokio::spawn(async move {
            c1.wait_until(Moment::from_secs_f64(5.0)).await;
            o1.lock().unwrap().push(5);
        });
        let h2 = tokio::spawn(async move {
            c2.wait_until(Moment::from_secs_f64(2.0)).await;
            o2.lock().unwrap().push(2);
        });

        // give the spawned tasks a chance to register.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(clock.pending_count(), 2);

        clock.set(Moment::from_secs_f64(10.0));
        h1.await.unwrap();
        h2.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![2, 5]);
    }

    #[tokio::test]
    async fn fire_all_unblocks_waiters_without_advancing() {
        let clock = std::sync::Arc::new(MockTimeSource::new(Moment::EPOCH));
        let c1 = clock.clone();
        let h = tokio::spawn(async move {
            c1.wait_until(Moment::from_secs_f64(1000.0)).await;
        });
        tokio::task::yield_now().await;
        assert_eq!(clock.pending_count(), 1);

        clock.fire_all();
        h.await.unwrap();
        // the clock itself did not move.
        assert_eq!(clock.now().as_secs_f64(), 0.0);
    }
}

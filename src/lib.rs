//! A leaky-bucket rate limiter with bounded FIFO queueing and a
//! cooperative worker task.
//!
//! [`TokenBucket`] grants tokens at a steady [flow rate][BucketConfig],
//! allows short bursts up to a configured capacity, and queues excess
//! demand up to a configured backlog, releasing it as tokens accrue. A
//! single [`Threadlet`] services the queue so that waiters resolve in
//! strict FIFO order without busy-polling.
//!
//! Two entry points cover the opportunistic and the patient caller:
//! [`TokenBucket::take_now`] never blocks and never enqueues; it either
//! grants immediately or reports when enough tokens would be available.
//! [`TokenBucket::request_grant`] resolves synchronously when possible and
//! otherwise queues, resolving once the worker has granted it or the
//! bucket has been shut down via [`TokenBucket::deny_all`].
//!
//! [`PacedWriter`] adapts any `AsyncWrite` to draw one token per byte
//! from a shared bucket.

mod bucket;
mod config;
mod error;
mod quantity;
mod stream;
mod threadlet;
mod time;
mod waiter;

pub use bucket::{Snapshot, TakeResult, TokenBucket};
pub use config::{BucketConfig, BucketConfigBuilder, ConfigError};
pub use error::BucketError;
pub use quantity::{NormalizedQuantity, Quantity, QuantityError};
pub use stream::PacedWriter;
pub use threadlet::{Phase, Raced, Runner, Threadlet};
pub use time::{MockTimeSource, Moment, RealTimeSource, TimeSource};
pub use waiter::{GrantReason, GrantResult};

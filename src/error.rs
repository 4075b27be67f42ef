//! Crate-wide error taxonomy (§7).
//!
//! `Full` and `Stopping` are *not* represented here: per §7 they are
//! ordinary business outcomes carried on [`crate::GrantResult`], not
//! failures. Only malformed input and configuration are errors.

use thiserror::Error;

use crate::quantity::QuantityError;

/// Failure of a `request_grant` or `take_now` call.
#[derive(Debug, Error, Clone)]
pub enum BucketError {
    #[error("invalid quantity: {0}")]
    Quantity(#[from] QuantityError),

    /// The worker task ended abnormally (e.g. a future `TimeSource` that
    /// can itself fail) and the bucket can no longer make progress.
    /// Reserved: the `TimeSource` implementations in this crate are
    /// infallible, so this variant is not constructed today, but the type
    /// is kept so a fallible `TimeSource` can surface through it without
    /// a breaking change.
    #[error("the bucket is unavailable: {0}")]
    Unavailable(String),
}

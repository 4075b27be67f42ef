//! The "number or range" grant request shape (§9 Design Notes:
//! `Quantity::Exact | Quantity::Range`), plus the single normalization
//! routine both `request_grant` and `take_now` run it through.

use thiserror::Error;

/// How many tokens a caller wants.
///
/// `Exact(n)` is sugar for `Range { min_inclusive: n, max_inclusive: n }`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quantity {
    Exact(f64),
    Range { min_inclusive: f64, max_inclusive: f64 },
}

impl From<f64> for Quantity {
    fn from(n: f64) -> Self {
        Quantity::Exact(n)
    }
}

/// A normalized, validated request: `min_inclusive <= max_inclusive`, both
/// non-negative, both integers if the bucket disallows partial tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedQuantity {
    pub min_inclusive: f64,
    pub max_inclusive: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QuantityError {
    #[error("requested minimum {min} is negative")]
    NegativeMinimum { min: f64 },
    #[error("requested maximum {max} is negative")]
    NegativeMaximum { max: f64 },
    #[error(
        "requested minimum {min} exceeds the bucket's max_queue_grant_size of {max_queue_grant_size}"
    )]
    MinimumExceedsQueueGrantLimit { min: f64, max_queue_grant_size: f64 },
}

impl Quantity {
    /// Normalize against a bucket's `partial_tokens` and
    /// `max_queue_grant_size` settings, per §4.4 `normalize_quantity`.
    pub fn normalize(
        self,
        partial_tokens: bool,
        max_queue_grant_size: f64,
    ) -> Result<NormalizedQuantity, QuantityError> {
        let (mut min, mut max) = match self {
            Quantity::Exact(n) => (n, n),
            Quantity::Range {
                min_inclusive,
                max_inclusive,
            } => (min_inclusive, max_inclusive),
        };

        if !partial_tokens {
            min = min.ceil();
            max = max.floor();
        }

        // a max below the (possibly ceiled) min is raised to meet it, per spec.
        max = max.max(min);

        if min < 0.0 {
            return Err(QuantityError::NegativeMinimum { min });
        }
        if max < 0.0 {
            return Err(QuantityError::NegativeMaximum { max });
        }
        if min > max_queue_grant_size {
            return Err(QuantityError::MinimumExceedsQueueGrantLimit {
                min,
                max_queue_grant_size,
            });
        }

        Ok(NormalizedQuantity {
            min_inclusive: min,
            max_inclusive: max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_becomes_equal_min_max() {
        let n = Quantity::Exact(10.0).normalize(true, 100.0).unwrap();
        assert_eq!(n.min_inclusive, 10.0);
        assert_eq!(n.max_inclusive, 10.0);
    }

    #[test]
    fn integer_mode_ceils_min_and_floors_max() {
        let n = Quantity::Range {
            min_inclusive: 1.2,
            max_inclusive: 9.8,
        }
        .normalize(false, 100.0)
        .unwrap();
        assert_eq!(n.min_inclusive, 2.0);
        assert_eq!(n.max_inclusive, 9.0);
    }

    #[test]
    fn max_is_clamped_up_to_min() {
        let n = Quantity::Range {
            min_inclusive: 5.0,
            max_inclusive: 3.0,
        }
        .normalize(true, 100.0)
        .unwrap();
        assert_eq!(n.max_inclusive, 5.0);
    }

    #[test]
    fn negative_minimum_rejected() {
        let err = Quantity::Exact(-1.0).normalize(true, 100.0).unwrap_err();
        assert!(matches!(err, QuantityError::NegativeMinimum { .. }));
    }

    #[test]
    fn minimum_over_queue_grant_limit_rejected() {
        let err = Quantity::Exact(200.0).normalize(true, 100.0).unwrap_err();
        assert!(matches!(
            err,
            QuantityError::MinimumExceedsQueueGrantLimit { .. }
        ));
    }
}

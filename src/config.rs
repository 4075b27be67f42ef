//! Validation and normalization of bucket parameters (§4.9
//! `RateLimitConfig`) into an immutable [`BucketConfig`].

use std::sync::Arc;

use thiserror::Error;

use crate::time::TimeSource;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("flow_rate must be positive and finite, got {0}")]
    InvalidFlowRate(f64),
    #[error("max_burst_size must be positive and finite, got {0}")]
    InvalidMaxBurstSize(f64),
    #[error("max_queue_size must be non-negative, got {0}")]
    InvalidMaxQueueSize(f64),
    #[error(
        "max_queue_grant_size must be within [0, min(max_burst_size, max_queue_size)] = [0, {upper_bound}], got {value}"
    )]
    InvalidMaxQueueGrantSize { value: f64, upper_bound: f64 },
    #[error("initial_burst_size must be within [0, max_burst_size] = [0, {max_burst_size}], got {value}")]
    InvalidInitialBurstSize { value: f64, max_burst_size: f64 },
}

/// Immutable, validated configuration for a [`crate::TokenBucket`].
///
/// Constructed only via [`BucketConfigBuilder`]; there is no public way to
/// build an invalid `BucketConfig`.
#[derive(Clone)]
pub struct BucketConfig {
    pub(crate) flow_rate: f64,
    pub(crate) max_burst_size: f64,
    pub(crate) max_queue_grant_size: f64,
    pub(crate) max_queue_size: f64,
    pub(crate) partial_tokens: bool,
    pub(crate) initial_burst_size: f64,
    pub(crate) time_source: Arc<dyn TimeSource>,
}

impl std::fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketConfig")
            .field("flow_rate", &self.flow_rate)
            .field("max_burst_size", &self.max_burst_size)
            .field("max_queue_grant_size", &self.max_queue_grant_size)
            .field("max_queue_size", &self.max_queue_size)
            .field("partial_tokens", &self.partial_tokens)
            .field("initial_burst_size", &self.initial_burst_size)
            .finish_non_exhaustive()
    }
}

impl BucketConfig {
    pub fn flow_rate(&self) -> f64 {
        self.flow_rate
    }

    pub fn max_burst_size(&self) -> f64 {
        self.max_burst_size
    }

    pub fn max_queue_grant_size(&self) -> f64 {
        self.max_queue_grant_size
    }

    pub fn max_queue_size(&self) -> f64 {
        self.max_queue_size
    }

    pub fn partial_tokens(&self) -> bool {
        self.partial_tokens
    }

    pub fn initial_burst_size(&self) -> f64 {
        self.initial_burst_size
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.time_source
    }
}

/// Builds a [`BucketConfig`], normalizing and validating the parameters
/// from §3 in the order they're listed there.
pub struct BucketConfigBuilder {
    flow_rate: f64,
    max_burst_size: f64,
    max_queue_grant_size: Option<f64>,
    max_queue_size: f64,
    partial_tokens: bool,
    initial_burst_size: Option<f64>,
    time_source: Option<Arc<dyn TimeSource>>,
}

impl BucketConfigBuilder {
    /// Starts a builder with the two mandatory parameters: the steady flow
    /// rate (tokens/second) and the burst capacity.
    pub fn new(flow_rate: f64, max_burst_size: f64) -> Self {
        BucketConfigBuilder {
            flow_rate,
            max_burst_size,
            max_queue_grant_size: None,
            max_queue_size: f64::INFINITY,
            partial_tokens: true,
            initial_burst_size: None,
            time_source: None,
        }
    }

    pub fn max_queue_size(mut self, max_queue_size: f64) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn max_queue_grant_size(mut self, max_queue_grant_size: f64) -> Self {
        self.max_queue_grant_size = Some(max_queue_grant_size);
        self
    }

    pub fn partial_tokens(mut self, partial_tokens: bool) -> Self {
        self.partial_tokens = partial_tokens;
        self
    }

    pub fn initial_burst_size(mut self, initial_burst_size: f64) -> Self {
        self.initial_burst_size = Some(initial_burst_size);
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time_source);
        self
    }

    pub fn build(self) -> Result<BucketConfig, ConfigError> {
        if !(self.flow_rate.is_finite() && self.flow_rate > 0.0) {
            return Err(ConfigError::InvalidFlowRate(self.flow_rate));
        }
        if !(self.max_burst_size.is_finite() && self.max_burst_size > 0.0) {
            return Err(ConfigError::InvalidMaxBurstSize(self.max_burst_size));
        }
        if self.max_queue_size < 0.0 {
            return Err(ConfigError::InvalidMaxQueueSize(self.max_queue_size));
        }

        let grant_upper_bound = self.max_burst_size.min(self.max_queue_size);
        let mut max_queue_grant_size = self.max_queue_grant_size.unwrap_or(grant_upper_bound);
        if !self.partial_tokens {
            max_queue_grant_size = max_queue_grant_size.floor();
        }
        if !(0.0..=grant_upper_bound).contains(&max_queue_grant_size) {
            return Err(ConfigError::InvalidMaxQueueGrantSize {
                value: max_queue_grant_size,
                upper_bound: grant_upper_bound,
            });
        }

        let initial_burst_size = self.initial_burst_size.unwrap_or(self.max_burst_size);
        if !(0.0..=self.max_burst_size).contains(&initial_burst_size) {
            return Err(ConfigError::InvalidInitialBurstSize {
                value: initial_burst_size,
                max_burst_size: self.max_burst_size,
            });
        }

        let time_source = self
            .time_source
            .unwrap_or_else(|| Arc::new(crate::time::RealTimeSource::new()));

        Ok(BucketConfig {
            flow_rate: self.flow_rate,
            max_burst_size: self.max_burst_size,
            max_queue_grant_size,
            max_queue_size: self.max_queue_size,
            partial_tokens: self.partial_tokens,
            initial_burst_size,
            time_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MockTimeSource;

    fn mock() -> Arc<dyn TimeSource> {
        Arc::new(MockTimeSource::new(crate::time::Moment::EPOCH))
    }

    #[test]
    fn defaults_are_reasonable() {
        let cfg = BucketConfigBuilder::new(10.0, 100.0)
            .time_source(mock())
            .build()
            .unwrap();
        assert_eq!(cfg.initial_burst_size(), 100.0);
        assert_eq!(cfg.max_queue_grant_size(), 100.0);
        assert_eq!(cfg.max_queue_size(), f64::INFINITY);
    }

    #[test]
    fn rejects_non_positive_flow_rate() {
        let err = BucketConfigBuilder::new(0.0, 100.0)
            .time_source(mock())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFlowRate(_)));
    }

    #[test]
    fn rejects_negative_max_queue_size() {
        let err = BucketConfigBuilder::new(1.0, 100.0)
            .max_queue_size(-1.0)
            .time_source(mock())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMaxQueueSize(_)));
    }

    #[test]
    fn rejects_queue_grant_size_above_bound() {
        let err = BucketConfigBuilder::new(1.0, 100.0)
            .max_queue_size(50.0)
            .max_queue_grant_size(60.0)
            .time_source(mock())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMaxQueueGrantSize { .. }));
    }

    #[test]
    fn integer_mode_floors_default_queue_grant_size() {
        let cfg = BucketConfigBuilder::new(1.0, 100.5)
            .partial_tokens(false)
            .time_source(mock())
            .build()
            .unwrap();
        assert_eq!(cfg.max_queue_grant_size(), 100.0);
    }

    #[test]
    fn rejects_initial_burst_outside_range() {
        let err = BucketConfigBuilder::new(1.0, 100.0)
            .initial_burst_size(150.0)
            .time_source(mock())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInitialBurstSize { .. }));
    }
}

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

/// Broker configuration. Embeddable in a larger config file; every field
/// other than the topic has a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Config {
    /// Pub/sub topic this subscriber follows. Used for HTTP paths and
    /// diagnostics; the transport owns the actual subscription.
    pub topic: String,

    /// Capacity of each observer's event buffer. A lagging observer loses
    /// the oldest buffered events beyond this.
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,

    /// Default per-peer rate limit applied to incoming blocks. Absent means
    /// no gating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Token bucket parameters for the per-peer gate.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub blocks_per_second: NonZeroU32,
    pub burst: NonZeroU32,
}

impl Config {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            observer_capacity: default_observer_capacity(),
            rate_limit: None,
        }
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

const fn default_observer_capacity() -> usize {
    64
}

//! Dispatcher polling with adaptive backoff

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while work keeps turning up
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling when idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier after an empty poll
    pub backoff_multiplier: f64,

    /// Maximum instances admitted per queue per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            batch_size: 32,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Current poll interval: reset when work is found, grown when idle
#[derive(Debug)]
pub(crate) struct PollBackoff {
    config: PollerConfig,
    current: Duration,
}

impl PollBackoff {
    pub(crate) fn new(config: PollerConfig) -> Self {
        Self {
            current: config.min_interval,
            config,
        }
    }

    pub(crate) fn record(&mut self, found: usize) {
        if found > 0 {
            self.current = self.config.min_interval;
        } else {
            let grown = self.current.as_secs_f64() * self.config.backoff_multiplier;
            self.current = Duration::from_secs_f64(grown).min(self.config.max_interval);
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.current
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.config.batch_size
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

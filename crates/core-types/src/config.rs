//! Observer configuration.

use serde::{Deserialize, Serialize};

use crate::ObserverError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Capacity of the finalized store; the earliest-inserted record is evicted
    /// when full.
    pub max_requests: usize,
    /// Response bodies are truncated to this many characters.
    pub max_response_body_size: usize,
    /// Requests whose URL matches any of these patterns are dropped before
    /// processing. Invalid regexes degrade to case-insensitive substring match.
    pub exclude_patterns: Vec<String>,
    /// Widest gap between an action and a request start that still counts as a
    /// correlation candidate.
    pub max_correlation_window_ms: f64,
    /// Scored candidates below this confidence are discarded.
    pub min_confidence: f64,
    /// How long the in-flight count must stay at zero for the network to count
    /// as quiet.
    pub network_quiet_period_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            max_response_body_size: 524_288,
            exclude_patterns: Vec::new(),
            max_correlation_window_ms: 2000.0,
            min_confidence: 0.20,
            network_quiet_period_ms: 500,
        }
    }
}

impl ObserverConfig {
    pub fn validate(&self) -> Result<(), ObserverError> {
        if self.max_requests == 0 {
            return Err(ObserverError::InvalidConfig(
                "max_requests must be at least 1".into(),
            ));
        }
        if !(self.max_correlation_window_ms > 0.0) {
            return Err(ObserverError::InvalidConfig(
                "max_correlation_window_ms must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ObserverError::InvalidConfig(
                "min_confidence must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

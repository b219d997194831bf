//! Runtime Configuration
//!
//! Configuration is plain data so hosts can load it from whatever format they
//! already use. JSON parsing is provided for convenience.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of retained deltas in a single collection log after which a
    /// warning is logged. Retained deltas are never dropped; a reader that
    /// never pulls keeps them alive. `None` disables the warning.
    pub history_warning_threshold: Option<usize>,

    /// Convert panics inside derivations into a cached
    /// [`Error::Panicked`]. When false, panics unwind through `force`.
    pub catch_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            history_warning_threshold: Some(10_000),
            catch_panics: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set the history warning threshold.
    pub fn with_history_warning_threshold(mut self, threshold: Option<usize>) -> Self {
        self.history_warning_threshold = threshold;
        self
    }

    /// Set whether derivation panics are caught.
    pub fn with_catch_panics(mut self, catch: bool) -> Self {
        self.catch_panics = catch;
        self
    }
}

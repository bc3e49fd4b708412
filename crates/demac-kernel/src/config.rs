//! Configuration types for the coordinator.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Coordinator session configuration.
///
/// Loaded from JSON at runtime or built in code; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name given to the coordinator actor
    pub actor_name: String,

    /// Abort a round that has not filled within this many milliseconds.
    ///
    /// `None` waits forever: a single silent agent then stalls every other
    /// agent in the session.
    pub barrier_timeout_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            actor_name: "Coordinator".to_string(),
            barrier_timeout_ms: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Set the barrier timeout.
    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_ms.map(Duration::from_millis)
    }
}

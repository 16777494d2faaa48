//! Orchestrator configuration.

use std::time::Duration;

use crate::config::{Config, ProcessingConfig};

/// Timing and parameter settings for the job orchestrator.
///
/// Derived from the loaded [`Config`]; tests build it directly with short timeouts.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long to wait for the service to acknowledge a submission.
    pub ack_timeout: Duration,
    /// How long to wait for each artifact chunk.
    pub chunk_timeout: Duration,
    /// Wall-clock ceiling per task, measured from creation.
    pub task_timeout: Duration,
    /// Poll period of [`super::JobOrchestrator::wait_for_terminal`].
    pub poll_interval: Duration,
    pub processing: ProcessingConfig,
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            ack_timeout: config.server.timeout(),
            chunk_timeout: config.server.timeout(),
            task_timeout: config.server.task_timeout(),
            poll_interval: Duration::from_millis(250),
            processing: config.processing.clone(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

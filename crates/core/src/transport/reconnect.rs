//! Fixed-delay reconnection for session channels.
//!
//! When a channel drops while tasks are routed on it, the manager calls
//! [`reconnect`] to retry up to a bounded number of times, waiting the same
//! delay before every attempt.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Connection, Transport};
use crate::config::ServerConfig;
use crate::metrics::RECONNECT_ATTEMPTS;

/// Attempt budget and pacing.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Wait before each attempt.
    pub delay: Duration,
    /// Ceiling on a single connect attempt.
    pub connect_timeout: Duration,
}

impl From<&ServerConfig> for ReconnectPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            delay: config.reconnect_delay(),
            connect_timeout: config.timeout(),
        }
    }
}

pub enum ReconnectOutcome {
    Connected(Connection),
    Exhausted { attempts: u32, last_error: String },
    Cancelled,
}

/// Retry `transport.connect()` until it succeeds, the budget runs out, or
/// `cancel` fires.
pub async fn reconnect(
    transport: &dyn Transport,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
    session_id: &str,
) -> ReconnectOutcome {
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            _ = tokio::time::sleep(policy.delay) => {}
        }

        info!(
            session_id,
            attempt,
            max_attempts = policy.max_attempts,
            "Reconnecting to generation service",
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            result = tokio::time::timeout(policy.connect_timeout, transport.connect()) => result,
        };

        match result {
            Ok(Ok(connection)) => {
                RECONNECT_ATTEMPTS.with_label_values(&["success"]).inc();
                info!(session_id, attempt, "Reconnected to generation service");
                return ReconnectOutcome::Connected(connection);
            }
            Ok(Err(e)) => {
                RECONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                warn!(session_id, error = %e, "Reconnect attempt {attempt} failed");
                last_error = e.to_string();
            }
            Err(_) => {
                RECONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                warn!(session_id, "Reconnect attempt {attempt} timed out");
                last_error = format!("connect timed out after {:?}", policy.connect_timeout);
            }
        }
    }

    RECONNECT_ATTEMPTS.with_label_values(&["exhausted"]).inc();
    ReconnectOutcome::Exhausted {
        attempts: policy.max_attempts,
        last_error,
    }
}

use super::{types::Config, ConfigError};
use crate::params::{apply_preset, validate_params};

/// Validate configuration
/// Currently validates:
/// - Service URLs are present and use the right schemes
/// - Timeouts, retry budget and cache budget are non-zero
/// - Default parameters and every preset applied to them are in range
/// - API port is not 0
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let server = &config.server;

    if server.websocket_url.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "server.websocket_url cannot be empty".to_string(),
        ));
    }
    if !(server.websocket_url.starts_with("ws://") || server.websocket_url.starts_with("wss://")) {
        return Err(ConfigError::ValidationError(format!(
            "server.websocket_url must use ws:// or wss://, got {}",
            server.websocket_url
        )));
    }
    if !(server.rest_api_url.starts_with("http://") || server.rest_api_url.starts_with("https://"))
    {
        return Err(ConfigError::ValidationError(format!(
            "server.rest_api_url must use http:// or https://, got {}",
            server.rest_api_url
        )));
    }
    if server.timeout_seconds == 0 {
        return Err(ConfigError::ValidationError(
            "server.timeout_seconds cannot be 0".to_string(),
        ));
    }
    if server.reconnect_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "server.reconnect_attempts cannot be 0".to_string(),
        ));
    }
    if server.task_timeout_seconds < server.timeout_seconds {
        return Err(ConfigError::ValidationError(
            "server.task_timeout_seconds must be at least server.timeout_seconds".to_string(),
        ));
    }

    if config.storage.max_cache_size_mb == 0 {
        return Err(ConfigError::ValidationError(
            "storage.max_cache_size_mb cannot be 0".to_string(),
        ));
    }

    let defaults = &config.processing.default_parameters;
    validate_params(defaults).map_err(|e| {
        ConfigError::ValidationError(format!("processing.default_parameters: {}", e))
    })?;

    for name in config.processing.parameter_presets.keys() {
        apply_preset(defaults, name, &config.processing.parameter_presets)
            .and_then(|params| validate_params(&params))
            .map_err(|e| {
                ConfigError::ValidationError(format!(
                    "processing.parameter_presets.{}: {}",
                    name, e
                ))
            })?;
    }

    if config.api.port == 0 {
        return Err(ConfigError::ValidationError(
            "api.port cannot be 0".to_string(),
        ));
    }

    if config.api.max_request_body_mb == 0 {
        return Err(ConfigError::ValidationError(
            "api.max_request_body_mb cannot be 0".to_string(),
        ));
    }

    Ok(())
}

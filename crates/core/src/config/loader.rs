use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Prefix for environment overrides, e.g. `TRELLIS_SERVER__TIMEOUT_SECONDS=30`.
const ENV_PREFIX: &str = "TRELLIS_";

/// Load configuration from file with environment variable overrides.
///
/// Files ending in `.json` are read as JSON (the format the plugin ships its
/// `config.json` in); everything else is read as TOML.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let figment = if is_json {
        Figment::new().merge(Json::file(path))
    } else {
        Figment::new().merge(Toml::file(path))
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[server]
websocket_url = "ws://trellis.local:5000"
reconnect_attempts = 5
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.server.websocket_url, "ws://trellis.local:5000");
        assert_eq!(config.server.reconnect_attempts, 5);
        assert_eq!(config.server.timeout_seconds, 60);
    }

    #[test]
    fn test_load_config_from_str_empty_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.storage.max_cache_size_mb, 1024);
        assert_eq!(config.processing.parameter_presets.len(), 3);
    }

    #[test]
    fn test_load_config_from_str_wrong_type() {
        let toml = r#"
[server]
timeout_seconds = "soon"
"#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/trellis.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_config_from_toml_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            temp_file,
            r#"
[storage]
download_dir = "/tmp/trellis-out"
max_cache_size_mb = 64
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.storage.max_cache_size_mb, 64);
        assert_eq!(
            config.storage.download_dir.to_string_lossy(),
            "/tmp/trellis-out"
        );
    }

    #[test]
    fn test_load_config_from_json_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            temp_file,
            r#"{{
  "server": {{ "websocket_url": "ws://10.0.0.5:5000", "reconnect_delay_seconds": 7 }},
  "processing": {{
    "default_parameters": {{ "seed": 42, "texture_size": 2048 }}
  }}
}}"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.server.websocket_url, "ws://10.0.0.5:5000");
        assert_eq!(config.server.reconnect_delay_seconds, 7);
        assert_eq!(config.processing.default_parameters.seed, 42);
        assert_eq!(config.processing.default_parameters.texture_size, 2048);
        assert_eq!(config.processing.default_parameters.sparse_steps, 12);
    }
}

//! Configuration file loading.

use crate::config::{Config, validate_config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML or JSON file.
///
/// JSON documents are valid YAML, so a single parser handles both.
/// The result has already passed [`validate_config`].
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration text.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(contents)?;

    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, Layer, LayerSettings};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
layer: l4
algorithm: least_connections
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.layer(), Layer::L4);
        assert_eq!(config.algorithm, Algorithm::LeastConnections);
        assert_eq!(config.listen.port, 10000);
    }

    #[test]
    fn test_load_json_config() {
        let json = r#"{
  "layer": "l7",
  "algorithm": "content_based",
  "healthcheck": { "path": "/health", "interval": "2s" },
  "l7_settings": { "content": { "header": "x-tenant" } }
}"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.healthcheck.interval, Duration::from_secs(2));
        match config.settings {
            LayerSettings::L7(l7) => assert_eq!(l7.content.header.as_deref(), Some("x-tenant")),
            LayerSettings::L4(_) => panic!("expected l7 settings"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not: valid: yaml: {{{}}}").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_algorithm_invalid_for_layer() {
        let result = parse_config("layer: l4\nalgorithm: url_hash\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}

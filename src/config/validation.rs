//! Configuration validation.

use crate::config::{Algorithm, Config, LayerSettings, ProbeProtocol};

/// Validate the configuration.
///
/// Checks for:
/// - Algorithm allowed at the configured layer
/// - Non-zero thresholds, intervals and timeouts
/// - HTTP probes have a path
/// - Algorithm-specific settings are present
/// - Tuning values are in range
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();
    let layer = config.layer();

    if !config.algorithm.is_valid_for(layer) {
        errors.push(format!(
            "algorithm '{}' is not supported at layer {}",
            config.algorithm, layer
        ));
    }

    let hc = &config.healthcheck;
    if hc.failure_threshold == 0 {
        errors.push("healthcheck.failure_threshold must be >= 1".to_string());
    }
    if hc.success_threshold == 0 {
        errors.push("healthcheck.success_threshold must be >= 1".to_string());
    }
    if hc.interval.is_zero() {
        errors.push("healthcheck.interval must be non-zero".to_string());
    }
    if hc.timeout.is_zero() {
        errors.push("healthcheck.timeout must be non-zero".to_string());
    }
    if hc.enabled && hc.protocol_for(layer) == ProbeProtocol::Http && hc.path.is_none() {
        errors.push("healthcheck uses http probes but no path specified".to_string());
    }
    if let Some(staleness) = hc.staleness_timeout {
        if staleness <= hc.interval {
            errors.push(format!(
                "healthcheck.staleness_timeout ({:?}) must exceed the interval ({:?})",
                staleness, hc.interval
            ));
        }
    }
    if let Some(eviction) = hc.eviction_timeout {
        if eviction.is_zero() {
            errors.push("healthcheck.eviction_timeout must be non-zero".to_string());
        }
    }

    let selector = &config.selector;
    if !(selector.ewma_alpha > 0.0 && selector.ewma_alpha <= 1.0) {
        errors.push(format!(
            "selector.ewma_alpha must be in (0, 1], got {}",
            selector.ewma_alpha
        ));
    }
    if selector.virtual_nodes == 0 {
        errors.push("selector.virtual_nodes must be >= 1".to_string());
    }

    if let LayerSettings::L7(ref l7) = config.settings {
        if config.algorithm == Algorithm::ContentBased && l7.content.header.is_none() {
            errors.push("content_based requires l7_settings.content.header".to_string());
        }
        if config.algorithm == Algorithm::CookieBased && l7.sticky.cookie_name.is_empty() {
            errors.push("cookie_based requires a non-empty l7_settings.sticky.cookie_name".to_string());
        }
    }

    if config.metrics.enabled && !config.metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics.path '{}' must start with '/'",
            config.metrics.path
        ));
    }

    let manager = &config.manager;
    if manager.port_window == 0 {
        errors.push("manager.port_window must be >= 1".to_string());
    }
    if manager.heartbeat_interval.is_zero() {
        errors.push("manager.heartbeat_interval must be non-zero".to_string());
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use std::time::Duration;

    fn minimal_config() -> Config {
        Config::for_layer(Layer::L4, Algorithm::RoundRobin)
    }

    fn l7_config(algorithm: Algorithm) -> Config {
        let mut config = Config::for_layer(Layer::L7, algorithm);
        config.healthcheck.path = Some("/health".to_string());
        config
    }

    #[test]
    fn test_valid_config() {
        let config = minimal_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_layer_matrix() {
        for algorithm in Algorithm::ALL {
            let mut l4 = minimal_config();
            l4.algorithm = algorithm;
            assert_eq!(
                validate_config(&l4).is_ok(),
                algorithm.is_valid_for(Layer::L4),
                "{algorithm} at l4"
            );
        }

        assert!(validate_config(&l7_config(Algorithm::RoundRobin)).is_ok());
        assert!(validate_config(&l7_config(Algorithm::UrlHash)).is_ok());

        let result = validate_config(&l7_config(Algorithm::WeightedRoundRobin));
        assert!(result.unwrap_err().contains("not supported at layer l7"));
    }

    #[test]
    fn test_zero_thresholds() {
        let mut config = minimal_config();
        config.healthcheck.failure_threshold = 0;
        config.healthcheck.success_threshold = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("failure_threshold"));
        assert!(err.contains("success_threshold"));
    }

    #[test]
    fn test_http_health_check_missing_path() {
        let mut config = l7_config(Algorithm::UrlHash);
        config.healthcheck.path = None;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("no path specified"));

        config.healthcheck.enabled = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_staleness_must_exceed_interval() {
        let mut config = minimal_config();
        config.healthcheck.staleness_timeout = Some(config.healthcheck.interval);
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("staleness_timeout"));
    }

    #[test]
    fn test_ewma_alpha_range() {
        let mut config = minimal_config();
        config.selector.ewma_alpha = 0.0;
        assert!(validate_config(&config).is_err());

        config.selector.ewma_alpha = 1.0;
        assert!(validate_config(&config).is_ok());

        config.selector.ewma_alpha = 1.5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_content_based_needs_header() {
        let mut config = l7_config(Algorithm::ContentBased);
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("content.header"));

        if let LayerSettings::L7(ref mut l7) = config.settings {
            l7.content.header = Some("x-tenant".to_string());
        }
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_cookie_based_needs_cookie_name() {
        let mut config = l7_config(Algorithm::CookieBased);
        assert!(validate_config(&config).is_ok());

        if let LayerSettings::L7(ref mut l7) = config.settings {
            l7.sticky.cookie_name.clear();
        }
        assert!(validate_config(&config).unwrap_err().contains("cookie_name"));
    }

    #[test]
    fn test_manager_port_window() {
        let mut config = minimal_config();
        config.manager.port_window = 0;
        assert!(validate_config(&config).unwrap_err().contains("port_window"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        config.healthcheck.timeout = Duration::ZERO;
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("invalid log level"));
        assert!(err.contains("; "));
    }
}

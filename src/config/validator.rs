use crate::config::{parse_duration, Config, SCHEMA_VERSION};
use crate::error::{HopscopeError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem found
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_broker(config, &mut errors);
        Self::validate_tracer(config, &mut errors);
        Self::validate_geo(config, &mut errors);
        Self::validate_store(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_pipeline(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HopscopeError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_broker(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.broker.host.trim().is_empty() {
            errors.push(ValidationError::new("broker.host", "Host cannot be empty"));
        }

        if config.broker.inbound_queue.is_empty() {
            errors.push(ValidationError::new(
                "broker.inbound_queue",
                "Queue name cannot be empty",
            ));
        }

        if config.broker.outbound_queue.is_empty() {
            errors.push(ValidationError::new(
                "broker.outbound_queue",
                "Queue name cannot be empty",
            ));
        }

        // Publishing into the queue we consume from would loop every record
        if config.broker.inbound_queue == config.broker.outbound_queue {
            errors.push(ValidationError::new(
                "broker.outbound_queue",
                format!(
                    "Outbound queue must differ from inbound queue '{}'",
                    config.broker.inbound_queue
                ),
            ));
        }

        if config.broker.prefetch == Some(0) {
            errors.push(ValidationError::new(
                "broker.prefetch",
                "Prefetch must be greater than 0 (omit it for no limit)",
            ));
        }
    }

    fn validate_tracer(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.tracer.command.trim().is_empty() {
            errors.push(ValidationError::new(
                "tracer.command",
                "Trace command cannot be empty",
            ));
        }

        if let Some(timeout) = &config.tracer.timeout {
            Self::check_duration("tracer.timeout", timeout, errors);
        }
    }

    fn validate_geo(config: &Config, errors: &mut Vec<ValidationError>) {
        let url = &config.geo.api_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(ValidationError::new(
                "geo.api_url",
                format!("API URL must start with http:// or https://, got '{}'", url),
            ));
        }

        Self::check_duration("geo.request_timeout", &config.geo.request_timeout, errors);
    }

    fn validate_store(config: &Config, errors: &mut Vec<ValidationError>) {
        // Existence is not checked: the store creates its file on first open
        if config.store.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "store.path",
                "Store path cannot be empty",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        for (path, capacity) in [
            ("cache.max_addresses", config.cache.max_addresses),
            ("cache.max_flows", config.cache.max_flows),
        ] {
            if capacity == Some(0) {
                errors.push(ValidationError::new(
                    path,
                    "Capacity must be greater than 0 (omit it for no limit)",
                ));
            }
        }

        for (path, ttl) in [
            ("cache.address_ttl", &config.cache.address_ttl),
            ("cache.flow_ttl", &config.cache.flow_ttl),
        ] {
            if let Some(ttl) = ttl {
                Self::check_duration(path, ttl, errors);
            }
        }
    }

    fn validate_pipeline(config: &Config, errors: &mut Vec<ValidationError>) {
        Self::check_duration("pipeline.publish_wait", &config.pipeline.publish_wait, errors);
    }

    fn check_duration(path: &str, value: &str, errors: &mut Vec<ValidationError>) {
        match parse_duration(value) {
            Some(duration) if !duration.is_zero() => {}
            Some(_) => errors.push(ValidationError::new(path, "Duration must be non-zero")),
            None => errors.push(ValidationError::new(
                path,
                format!("Invalid duration format: {}", value),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn error_paths(config: &Config) -> Vec<String> {
        match ConfigValidator::validate(config) {
            Err(HopscopeError::ConfigValidation { errors }) => {
                errors.into_iter().map(|e| e.path).collect()
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_same_queue_rejected() {
        let mut config = Config::default();
        config.broker.outbound_queue = config.broker.inbound_queue.clone();
        assert_eq!(error_paths(&config), vec!["broker.outbound_queue"]);
    }

    #[test]
    fn test_bad_durations_collected() {
        let mut config = Config::default();
        config.tracer.timeout = Some("forever".to_string());
        config.pipeline.publish_wait = "0s".to_string();
        assert_eq!(
            error_paths(&config),
            vec!["tracer.timeout", "pipeline.publish_wait"]
        );
    }

    #[test]
    fn test_overflowing_minutes_reported() {
        let mut config = Config::default();
        config.cache.flow_ttl = Some("18446744073709551615m".to_string());
        assert_eq!(error_paths(&config), vec!["cache.flow_ttl"]);
    }

    #[test]
    fn test_zero_capacity_and_empty_store() {
        let mut config = Config::default();
        config.cache.max_flows = Some(0);
        config.store.path = PathBuf::new();
        assert_eq!(error_paths(&config), vec!["store.path", "cache.max_flows"]);
    }

    #[test]
    fn test_api_url_scheme() {
        let mut config = Config::default();
        config.geo.api_url = "api.ipstack.com".to_string();
        assert_eq!(error_paths(&config), vec!["geo.api_url"]);
    }
}

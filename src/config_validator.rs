use crate::bucket::BucketPolicy;
use crate::config::Config;
use crate::error::AdmissionError;
use axum::http::HeaderName;
use validator::Validate;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the whole configuration, reporting the first problem found.
    pub fn validate(config: &Config) -> Result<(), AdmissionError> {
        if config.uses_redis() {
            Self::validate_redis_url(&config.redis_url)?;
        }
        Self::validate_bucket_policy("global", &config.global_policy())?;
        Self::validate_bucket_policy("endpoint", &config.endpoint_policy())?;
        Self::validate_header_name(&config.idempotency_header)?;

        Self::validate_positive("IDEMPOTENCY_TTL_SECS", config.idempotency_ttl_secs)?;
        Self::validate_positive("IN_FLIGHT_CLAIM_TTL_SECS", config.in_flight_claim_ttl_secs)?;
        Self::validate_positive("BACKEND_TIMEOUT_MS", config.backend_timeout_ms)?;
        Self::validate_positive("REQUEST_TIMEOUT_MS", config.request_timeout_ms)?;
        Self::validate_positive("MAX_BODY_BYTES", config.max_body_bytes as u64)?;

        if config.backend_timeout_ms >= config.request_timeout_ms {
            return Err(AdmissionError::Configuration(
                "BACKEND_TIMEOUT_MS must be shorter than REQUEST_TIMEOUT_MS".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), AdmissionError> {
        if url.is_empty() {
            return Err(AdmissionError::Configuration("Redis URL cannot be empty".to_string()));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(AdmissionError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Capacity must be positive and the refill rate non-negative.
    pub fn validate_bucket_policy(name: &str, policy: &BucketPolicy) -> Result<(), AdmissionError> {
        policy
            .validate()
            .map_err(|e| AdmissionError::Configuration(format!("Invalid {} bucket policy: {}", name, e)))?;

        if !policy.capacity.is_finite() || !policy.refill_rate.is_finite() {
            return Err(AdmissionError::Configuration(format!(
                "Invalid {} bucket policy: values must be finite",
                name
            )));
        }

        Ok(())
    }

    pub fn validate_header_name(name: &str) -> Result<(), AdmissionError> {
        HeaderName::from_bytes(name.as_bytes())
            .map(|_| ())
            .map_err(|_| AdmissionError::Configuration(format!("'{}' is not a valid header name", name)))
    }

    fn validate_positive(name: &str, value: u64) -> Result<(), AdmissionError> {
        if value == 0 {
            return Err(AdmissionError::Configuration(format!("{} must be greater than 0", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());

        let config = Config {
            redis_url: "localhost:6379".to_string(),
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_bucket_policy() {
        assert!(ConfigValidator::validate_bucket_policy("global", &BucketPolicy::new(0.0, 1.0)).is_err());
        assert!(ConfigValidator::validate_bucket_policy("global", &BucketPolicy::new(3.0, -1.0)).is_err());
        assert!(ConfigValidator::validate_bucket_policy("global", &BucketPolicy::new(f64::INFINITY, 1.0)).is_err());
        assert!(ConfigValidator::validate_bucket_policy("global", &BucketPolicy::new(3.0, 0.0)).is_ok());
    }

    #[test]
    fn test_zero_ttls_are_rejected() {
        let config = Config {
            idempotency_ttl_secs: 0,
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());

        let config = Config {
            in_flight_claim_ttl_secs: 0,
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_backend_timeout_must_fit_request_timeout() {
        let config = Config {
            backend_timeout_ms: 5000,
            request_timeout_ms: 1000,
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_header_name() {
        assert!(ConfigValidator::validate_header_name("idempotency-key").is_ok());
        assert!(ConfigValidator::validate_header_name("bad header").is_err());
    }
}

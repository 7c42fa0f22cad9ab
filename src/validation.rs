use crate::error::AdmissionError;
use regex::Regex;
use std::sync::LazyLock;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const MAX_SUBJECT_LEN: usize = 512;

// Visible ASCII only; keeps keys safe to embed in backend key names and logs.
static IDEMPOTENCY_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\x21-\x7E]+$").expect("valid idempotency key pattern"));

static ROUTE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid route name pattern"));

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates a client-supplied idempotency key. Surrounding whitespace is
    /// trimmed; an empty value counts as missing.
    pub fn validate_idempotency_key(raw: Option<&str>) -> Result<String, AdmissionError> {
        let key = raw.map(str::trim).unwrap_or_default();

        if key.is_empty() {
            return Err(AdmissionError::MissingIdempotencyKey);
        }

        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AdmissionError::InvalidIdempotencyKey(format!(
                "must be at most {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        if !IDEMPOTENCY_KEY_PATTERN.is_match(key) {
            return Err(AdmissionError::InvalidIdempotencyKey(
                "must contain only visible ASCII characters".to_string(),
            ));
        }

        Ok(key.to_string())
    }

    /// Validates the caller identity handed over by subject extraction.
    pub fn validate_subject(subject: &str) -> Result<(), AdmissionError> {
        if subject.trim().is_empty() {
            return Err(AdmissionError::Validation("Subject cannot be empty".to_string()));
        }

        if subject.len() > MAX_SUBJECT_LEN {
            return Err(AdmissionError::Validation(format!(
                "Subject must be at most {} characters",
                MAX_SUBJECT_LEN
            )));
        }

        Ok(())
    }

    /// Route names double as bucket scope names, so they may not contain ':'.
    pub fn validate_route_name(name: &str) -> Result<(), AdmissionError> {
        if !ROUTE_NAME_PATTERN.is_match(name) {
            return Err(AdmissionError::Configuration(format!(
                "Route name '{}' can only contain alphanumeric characters, '.', '-' and '_'",
                name
            )));
        }

        Ok(())
    }
}

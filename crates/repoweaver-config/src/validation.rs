//! Configuration validation framework

use crate::{ConfigError, ConfigResult};

/// Trait for validating configuration values
pub trait Validate {
    /// Validate this configuration object
    ///
    /// # Errors
    /// Returns validation errors if the configuration is invalid
    fn validate(&self) -> ConfigResult<()>;
}

/// Validate that `url` starts with one of `schemes` and has something after it
///
/// # Errors
/// Returns `ConfigError::InvalidUrl` if the URL scheme is not accepted
pub fn validate_url(url: &str, schemes: &[&str], field_name: &str) -> ConfigResult<()> {
    let accepted = schemes.iter().any(|scheme| {
        url.strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix("://"))
            .is_some_and(|rest| !rest.trim().is_empty())
    });

    if accepted {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            field: field_name.to_string(),
            url: url.to_string(),
        })
    }
}

/// Validate a port number
///
/// # Errors
/// Returns `ConfigError::InvalidPort` if port is 0
pub fn validate_port(port: u16, field_name: &str) -> ConfigResult<()> {
    if port == 0 {
        Err(ConfigError::InvalidPort {
            field: field_name.to_string(),
            port,
        })
    } else {
        Ok(())
    }
}

/// Validate a value is within a range
///
/// # Errors
/// Returns `ConfigError::OutOfRange` if value is outside the specified range
pub fn validate_range(value: u64, min: u64, max: u64, field_name: &str) -> ConfigResult<()> {
    if value < min || value > max {
        Err(ConfigError::OutOfRange {
            field: field_name.to_string(),
            value,
            min,
            max,
        })
    } else {
        Ok(())
    }
}

/// Validate a fraction lies strictly between 0 and 1
///
/// # Errors
/// Returns `ConfigError::InvalidValue` for 0, 1, anything outside, or NaN
pub fn validate_fraction(value: f64, field_name: &str) -> ConfigResult<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field_name.to_string(),
            message: format!("{value} must be strictly between 0 and 1"),
        })
    }
}

/// Validate a string is not empty
///
/// # Errors
/// Returns `ConfigError::MissingField` if the string is empty or whitespace-only
pub fn validate_non_empty(value: &str, field_name: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingField {
            field: field_name.to_string(),
        })
    } else {
        Ok(())
    }
}

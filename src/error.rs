//! Structured error types for configuration operations.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Rejected input
    ValidationFailed,
    ConversionFailed,
    InvalidTree,

    // Type system
    DescriptorInvalid,
    TypeMismatch,
    InstantiationFailed,

    // Files
    ParseFailed,
    IoError,
}

/// Structured error raised by the reconciliation engine.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

impl ConfigError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            type_name: None,
            property: None,
        }
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    // Convenience constructors

    pub fn validation(type_name: &str, property: &str, validator: &str) -> Self {
        Self::new(
            ErrorCode::ValidationFailed,
            format!(
                "Validator {} rejected the value of {} in {}",
                validator, property, type_name
            ),
        )
        .with_type(type_name)
        .with_property(property)
    }

    pub fn conversion(property: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConversionFailed,
            format!("Can't convert value for {}: {}", property, reason),
        )
        .with_property(property)
    }

    pub fn descriptor(type_name: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::DescriptorInvalid,
            format!("Invalid descriptor for {}: {}", type_name, reason),
        )
        .with_type(type_name)
    }

    pub fn type_mismatch(expected: &str, found: &str) -> Self {
        Self::new(
            ErrorCode::TypeMismatch,
            format!("Expected an instance of {}, found {}", expected, found),
        )
        .with_type(expected)
    }

    pub fn instantiation(type_name: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InstantiationFailed,
            format!("Can't instantiate {}: {}", type_name, reason),
        )
        .with_type(type_name)
    }

    pub fn tree(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InvalidTree, err.to_string())
    }

    pub fn parse(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ParseFailed, err.to_string())
    }

    pub fn io(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::IoError, err.to_string())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<crate::merge::TreeError> for ConfigError {
    fn from(err: crate::merge::TreeError) -> Self {
        ConfigError::tree(err)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::io(err)
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_context() {
        let err = ConfigError::validation("Car", "size", "not_null");
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert_eq!(err.type_name.as_deref(), Some("Car"));
        assert_eq!(err.property.as_deref(), Some("size"));
        assert!(err.to_string().contains("not_null"));
    }

    #[test]
    fn test_error_serializes_code() {
        let err = ConfigError::instantiation("Wheel", "type is not registered");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "INSTANTIATION_FAILED");
        assert_eq!(json["type_name"], "Wheel");
        assert!(json.get("property").is_none());
    }
}

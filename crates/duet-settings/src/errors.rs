//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value parsed but cannot be used (zero interval, empty room, ...).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err = SettingsError::from(json_err);
        assert!(err.to_string().contains("parse settings JSON"));
    }

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue("room.participants must name two users".into());
        assert_eq!(
            err.to_string(),
            "invalid settings value: room.participants must name two users"
        );
    }
}

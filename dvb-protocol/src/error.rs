//! Error types for tuning parameter handling.

use thiserror::Error;

/// Errors raised while parsing or validating tuning parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A string did not name any value of the enumeration.
    #[error("Unknown {kind} value: {value:?}")]
    UnknownValue { kind: &'static str, value: String },

    /// The delivery system does not belong to the frontend family.
    #[error("Delivery system {delsys} is not valid for {family} multiplexes")]
    DeliverySystemMismatch { delsys: String, family: String },

    /// A configuration field had the wrong shape.
    #[error("Invalid configuration field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    /// Failed to decode a persisted configuration map.
    #[error("Failed to decode configuration: {0}")]
    DecodeError(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::DecodeError(e.to_string())
    }
}

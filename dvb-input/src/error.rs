//! Error types for frontend control and the input hierarchy.

use std::io;

use dvb_protocol::{FrontendType, ProtocolError};
use thiserror::Error;

use crate::settings::SettingsError;

/// Outcome of a failed `start`.
#[derive(Error, Debug)]
pub enum TuneError {
    /// Control device could not be opened.
    #[error("{frontend} - device unavailable: {source}")]
    DeviceUnavailable {
        frontend: String,
        #[source]
        source: io::Error,
    },

    /// Commit failed for a reason other than invalid parameters. The caller may retry.
    #[error("{frontend} - tuning failed: {source}")]
    TuningFailed {
        frontend: String,
        #[source]
        source: io::Error,
    },

    /// The device rejected the parameters. The instance must not be retried.
    #[error("{frontend} - tuning parameters rejected for {mux}")]
    TuningFailedPermanent { frontend: String, mux: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl TuneError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TuneError::TuningFailedPermanent { .. })
    }
}

/// Errors from hierarchy and configuration operations.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot set network on {0} frontend")]
    NetworkNotSettable(FrontendType),

    #[error("Network {network} is {network_type}, frontend {frontend} is {frontend_type}")]
    WrongNetworkType {
        frontend: String,
        frontend_type: FrontendType,
        network: String,
        network_type: FrontendType,
    },

    #[error("Frontend {number} already exists as {existing}, discovered {discovered}")]
    TypeMismatch {
        number: u32,
        existing: FrontendType,
        discovered: FrontendType,
    },

    #[error("Missing configuration field: {0}")]
    MissingField(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Tune(#[from] TuneError),
}

impl InputError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        InputError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InputError>;

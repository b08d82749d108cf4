//! Error handling for the Inverter Service
//!
//! Operation-level failures (transport, chunked reads, per-field decoding,
//! MQTT publishing) have their own enums next to the code that raises them.
//! This type is what crosses module boundaries and what `main` converts
//! into [`VoltageError`].

use errors::VoltageError;
use thiserror::Error;

/// Inverter Service Error Type
#[derive(Error, Debug, Clone)]
pub enum InvSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Register catalog layout errors (fatal at startup)
    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// Device unreachable after the retry budget was spent
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Malformed or unexpected device response
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Decoding errors
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Metrics endpoint errors
    #[error("Exporter error: {0}")]
    ExporterError(String),

    /// Internal errors (task failures, unexpected termination)
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the Inverter Service
pub type Result<T> = std::result::Result<T, InvSrvError>;

impl InvSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        InvSrvError::ConfigError(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        InvSrvError::CatalogError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        InvSrvError::InternalError(msg.into())
    }
}

impl From<InvSrvError> for VoltageError {
    fn from(err: InvSrvError) -> Self {
        match err {
            InvSrvError::ConfigError(msg) | InvSrvError::CatalogError(msg) => {
                VoltageError::Configuration(msg)
            },
            InvSrvError::TransportError(msg) => VoltageError::Communication(msg),
            InvSrvError::ProtocolError(msg) => VoltageError::Protocol {
                protocol: "solarman-v5".to_string(),
                message: msg,
            },
            InvSrvError::DecodeError(msg) => VoltageError::Processing(msg),
            InvSrvError::ExporterError(msg) => VoltageError::StartupFailed(msg),
            InvSrvError::InternalError(msg) => VoltageError::Internal(msg),
        }
    }
}

impl From<serde_yaml::Error> for InvSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        InvSrvError::ConfigError(format!("YAML: {}", err))
    }
}

//! Error types for the node controller

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// The control plane reported that the user list has not changed since
    /// the last fetch. Callers reuse their held user set.
    #[error("users no change")]
    UsersUnchanged,

    /// Protocol kind not supported by the resource binder
    #[error("unsupported node type: {0}")]
    UnsupportedProtocol(String),

    /// A field required by the protocol kind is absent or empty
    #[error("{kind} node is missing required field `{field}`")]
    MissingField { kind: String, field: &'static str },

    /// Descriptor is structurally invalid (e.g. port overflow)
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    /// Engine resource does not exist
    #[error("engine resource not found: {0}")]
    NotFound(String),

    /// Engine rejected a mutation
    #[error("engine error: {0}")]
    EngineError(String),

    /// Control plane answered with a non-success status
    #[error("control plane returned {status}: {message}")]
    ControlPlaneError { status: u16, message: String },

    /// HTTP transport error talking to the control plane
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Certificate issuance or inspection failed
    #[error("Certificate error: {0}")]
    CertificateError(String),

    /// Host vitals could not be read
    #[error("Vitals error: {0}")]
    VitalsError(String),

    /// Operation requires a started controller
    #[error("controller has not completed startup")]
    NotStarted,

    /// Startup was requested twice
    #[error("controller already started")]
    AlreadyStarted,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Engine removal targeting a resource that is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if the error is worth retrying on the next tick
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::HttpError(_)
            | Error::ControlPlaneError { .. }
            | Error::EngineError(_)
            | Error::NotFound(_)
            | Error::VitalsError(_)
            | Error::CertificateError(_)
            | Error::IoError(_) => true,
            Error::UsersUnchanged
            | Error::UnsupportedProtocol(_)
            | Error::MissingField { .. }
            | Error::InvalidDescriptor(_)
            | Error::SerializationError(_)
            | Error::ConfigParseError(_)
            | Error::ConfigError(_)
            | Error::NotStarted
            | Error::AlreadyStarted => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UsersUnchanged => "users_unchanged",
            Error::UnsupportedProtocol(_) => "unsupported_protocol",
            Error::MissingField { .. } | Error::InvalidDescriptor(_) => "invalid_descriptor",
            Error::NotFound(_) | Error::EngineError(_) => "engine",
            Error::ControlPlaneError { .. } | Error::HttpError(_) => "control_plane",
            Error::SerializationError(_) => "serialization",
            Error::ConfigParseError(_) | Error::ConfigError(_) => "config",
            Error::CertificateError(_) => "certificate",
            Error::VitalsError(_) => "vitals",
            Error::NotStarted | Error::AlreadyStarted => "lifecycle",
            Error::IoError(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Error types for the service host.
//!
//! `HostError` is the internal error type used by every module. Errors that
//! cross the client boundary are flattened into the closed [`ErrorCode`] set,
//! with an "extended error" escape hatch for service-defined error tokens.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the service host library.
#[derive(Debug, Error)]
pub enum HostError {
    // Transport errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Frame of {size} bytes is outside the allowed range (1..={max})")]
    FrameSize { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Peer ended the connection")]
    PeerEndedConnection,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Process errors
    #[error("Failed to spawn {path:?}: {message}")]
    SpawnFailed { path: PathBuf, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Controller already started for {0:?}")]
    AlreadyRunning(PathBuf),

    // Service errors
    #[error("No such service: {name} {version}")]
    NoSuchService { name: String, version: String },

    #[error("Invalid manifest {path:?}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("No provider satisfies dependent service {0}")]
    NoProvider(String),

    // Client/session errors
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Session failed ({code}): {message}")]
    Session { code: ErrorCode, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for service host operations.
pub type Result<T> = std::result::Result<T, HostError>;

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HostError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HostError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Map to the client-visible error code.
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            HostError::Io { .. } | HostError::NotConnected => ErrorCode::ConnectionFailure,
            HostError::FrameSize { .. } | HostError::Protocol(_) | HostError::Json { .. } => {
                ErrorCode::ProtocolError
            }
            HostError::PeerEndedConnection => ErrorCode::PeerEndedConnection,
            HostError::SpawnFailed { .. } | HostError::AlreadyRunning(_) => ErrorCode::SpawnFailed,
            HostError::Timeout(_) => ErrorCode::ConnectTimeout,
            HostError::NoSuchService { .. } | HostError::NoProvider(_) => ErrorCode::NoSuchService,
            HostError::InvalidManifest { .. } => ErrorCode::InvalidLocation,
            HostError::InvalidVersion(_) => ErrorCode::InvalidVersionString,
            HostError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            HostError::InvalidState(_) => ErrorCode::InvalidState,
            HostError::NotImplemented(_) => ErrorCode::NotImplemented,
            HostError::Session { code, .. } => *code,
            HostError::Other(_) => ErrorCode::GenericError,
        }
    }
}

/// Closed set of status codes surfaced to clients.
///
/// Numeric values are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    GenericError = 1,
    ConnectionFailure = 2,
    InvalidLocation = 3,
    InvalidParameter = 4,
    InvalidState = 5,
    ProtocolError = 7,
    NotImplemented = 8,
    NoSuchService = 9,
    NoSuchFunction = 10,
    ServiceExecError = 11,
    InvalidVersionString = 12,
    ExtendedError = 14,
    SpawnFailed = 15,
    ConnectTimeout = 16,
    PermissionsError = 17,
    PlatformBlacklisted = 18,
    UnapprovedDomain = 19,
    NotInstalled = 20,
    RequireError = 21,
    PlatformDisabled = 22,
    PeerEndedConnection = 23,
    SwitchVersion = 24,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::GenericError => "generic error",
            ErrorCode::ConnectionFailure => "connection failure",
            ErrorCode::InvalidLocation => "invalid location",
            ErrorCode::InvalidParameter => "invalid parameter",
            ErrorCode::InvalidState => "invalid state",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::NotImplemented => "not implemented",
            ErrorCode::NoSuchService => "no such service",
            ErrorCode::NoSuchFunction => "no such function",
            ErrorCode::ServiceExecError => "service execution error",
            ErrorCode::InvalidVersionString => "invalid version string",
            ErrorCode::ExtendedError => "extended error",
            ErrorCode::SpawnFailed => "spawn failed",
            ErrorCode::ConnectTimeout => "connect timeout",
            ErrorCode::PermissionsError => "permissions error",
            ErrorCode::PlatformBlacklisted => "platform blacklisted",
            ErrorCode::UnapprovedDomain => "unapproved domain",
            ErrorCode::NotInstalled => "not installed",
            ErrorCode::RequireError => "require error",
            ErrorCode::PlatformDisabled => "platform disabled",
            ErrorCode::PeerEndedConnection => "peer ended connection",
            ErrorCode::SwitchVersion => "switch version",
        }
    }

    /// Map a service or daemon error token to a code.
    ///
    /// Unknown tokens yield `ExtendedError`.
    pub fn from_token(token: &str) -> ErrorCode {
        match token {
            "BP.noSuchService" => ErrorCode::NoSuchService,
            "BP.noSuchFunction" => ErrorCode::NoSuchFunction,
            "BP.serviceExecError" => ErrorCode::ServiceExecError,
            "BP.extendedError" => ErrorCode::ExtendedError,
            "BP.permissionsError" => ErrorCode::PermissionsError,
            "BP.platformBlacklisted" => ErrorCode::PlatformBlacklisted,
            "BP.unapprovedDomain" => ErrorCode::UnapprovedDomain,
            "BP.requireError" => ErrorCode::RequireError,
            "BP.genericError" => ErrorCode::GenericError,
            _ => ErrorCode::ExtendedError,
        }
    }

    /// The wire token for codes that have one.
    pub fn token(&self) -> Option<&'static str> {
        match self {
            ErrorCode::NoSuchService => Some("BP.noSuchService"),
            ErrorCode::NoSuchFunction => Some("BP.noSuchFunction"),
            ErrorCode::ServiceExecError => Some("BP.serviceExecError"),
            ErrorCode::ExtendedError => Some("BP.extendedError"),
            ErrorCode::PermissionsError => Some("BP.permissionsError"),
            ErrorCode::PlatformBlacklisted => Some("BP.platformBlacklisted"),
            ErrorCode::UnapprovedDomain => Some("BP.unapprovedDomain"),
            ErrorCode::RequireError => Some("BP.requireError"),
            ErrorCode::GenericError => Some("BP.genericError"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure reported by a service or the daemon, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub code: ErrorCode,
    pub error: Option<String>,
    pub verbose_error: Option<String>,
}

impl ServiceFailure {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            error: None,
            verbose_error: None,
        }
    }

    /// Translate an `{error, verboseError}` pair into a failure.
    ///
    /// A missing error string is a protocol error. A verbose error always
    /// produces `ExtendedError` so the raw strings reach the caller.
    pub fn from_strings(error: Option<&str>, verbose_error: Option<&str>) -> Self {
        let Some(error) = error else {
            return Self::new(ErrorCode::ProtocolError);
        };
        let code = if verbose_error.is_some() {
            ErrorCode::ExtendedError
        } else {
            ErrorCode::from_token(error)
        };
        Self {
            code,
            error: Some(error.to_string()),
            verbose_error: verbose_error.map(str::to_string),
        }
    }
}

impl std::fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        if let Some(verbose) = &self.verbose_error {
            write!(f, " ({})", verbose)?;
        }
        Ok(())
    }
}

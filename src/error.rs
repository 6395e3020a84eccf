use std::fmt;
use std::io;

use thiserror::Error;

/// Requested access level for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Write,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of a network driver's connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// Transport-level dial
    Dial,
    /// Protocol session setup and authentication
    Handshake,
    /// Share / bucket mount
    Mount,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectStage::Dial => "dial",
            ConnectStage::Handshake => "handshake",
            ConnectStage::Mount => "mount",
        };
        f.write_str(s)
    }
}

/// Main error type for filehub operations
#[derive(Error, Debug)]
pub enum FileHubError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// The path escapes the storage root
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The permission checker rejected the request
    #[error("Permission denied: {action} on {path}")]
    PermissionDenied { path: String, action: Action },

    /// Authorization was attempted without a principal in the request context
    #[error("Unauthenticated: no principal in request context")]
    Unauthenticated,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown driver type: {0}")]
    UnknownDriver(String),

    #[error("Storage source not found: {0}")]
    SourceNotFound(String),

    #[error("Connection failed during {stage}: {message}")]
    Connection { stage: ConnectStage, message: String },

    #[error("Driver not initialized")]
    NotInitialized,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    TimedOut,

    #[error("Resource locked: {0}")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl FileHubError {
    pub fn connection(stage: ConnectStage, message: impl fmt::Display) -> Self {
        FileHubError::Connection {
            stage,
            message: message.to_string(),
        }
    }

    /// True for both sandbox escapes and permission-checker denials
    pub fn is_access_denied(&self) -> bool {
        match self {
            FileHubError::AccessDenied(_) | FileHubError::PermissionDenied { .. } => true,
            FileHubError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            FileHubError::NotFound(_) => true,
            FileHubError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Map to an HTTP status for the request handler in front of the bridge
    pub fn http_status(&self) -> u16 {
        match self {
            FileHubError::NotFound(_) | FileHubError::SourceNotFound(_) => 404,
            FileHubError::AlreadyExists(_) => 405,
            FileHubError::NotADirectory(_) | FileHubError::IsADirectory(_) => 409,
            FileHubError::InvalidPath(_) => 400,
            FileHubError::NotSupported(_) => 501,
            FileHubError::AccessDenied(_) | FileHubError::PermissionDenied { .. } => 403,
            FileHubError::Locked(_) => 423,
            FileHubError::Cancelled => 499,
            FileHubError::TimedOut => 504,
            FileHubError::Connection { .. } => 502,
            FileHubError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => 404,
                io::ErrorKind::PermissionDenied => 403,
                io::ErrorKind::AlreadyExists => 405,
                _ => 500,
            },
            // Missing principal means the call site skipped authentication
            FileHubError::Unauthenticated
            | FileHubError::Config(_)
            | FileHubError::UnknownDriver(_)
            | FileHubError::NotInitialized
            | FileHubError::Backend(_) => 500,
        }
    }
}

/// Result type alias for filehub operations
pub type Result<T> = std::result::Result<T, FileHubError>;

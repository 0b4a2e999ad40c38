//! Error types for the conversion relay
//!
//! Errors are grouped by the failure families a session can run into:
//! transport, protocol, transfer integrity, conversion engine, local
//! resources and configuration. None of them is fatal to the process.

use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::wire::{
    NOTICE_CONVERSION_FAILED, NOTICE_INCOMPLETE_UPLOAD, NOTICE_INVALID_OPTION, NOTICE_TOO_LARGE,
};

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Connection-level failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unrecognized protocol tokens
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Declared payload size not honoured
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Conversion engine failures
    #[error("Conversion error: {0}")]
    Engine(#[from] EngineError),

    /// Scratch files, sockets and other local resources
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Local file I/O
    #[error("File I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Connection-level error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer closed the stream before the expected message arrived
    #[error("Connection closed while waiting for {expected}")]
    Closed { expected: &'static str },

    /// Read or write failure on the stream
    #[error("I/O failure during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// Peer stalled for longer than the configured limit
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: &'static str,
        duration: Duration,
    },

    /// Could not reach the server
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Token longer than its bounded maximum
    #[error("Token exceeds {max} bytes")]
    TokenTooLong { max: usize },

    /// Token bytes are not valid UTF-8
    #[error("Token is not valid text")]
    NotText,

    /// Option token is not a decimal integer
    #[error("Invalid option token '{token}'")]
    InvalidOption { token: String },

    /// Option is not on the menu for the announced extension
    #[error("Option {option} is not offered for extension '{extension}'")]
    OptionNotOffered { option: u32, extension: String },

    /// Option has no descriptor in the dispatch table
    #[error("Unknown conversion option {option}")]
    UnknownOption { option: u32 },

    /// Server answered with a notice instead of a result
    #[error("Server replied: {message}")]
    Notice { message: String },
}

/// Transfer integrity error types
#[derive(Error, Debug)]
pub enum TransferError {
    /// Stream ended before the declared size was reached
    #[error("Incomplete transfer: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    /// Declared size exceeds the configured maximum
    #[error("File too large: {size} bytes exceeds maximum {max_size} bytes")]
    TooLarge { size: u64, max_size: u64 },
}

/// Conversion engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    /// External program could not be started
    #[error("Failed to launch '{program}': {reason}")]
    Launch { program: String, reason: String },

    /// External program exited unsuccessfully
    #[error("'{program}' exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// Engine reported success but left nothing behind
    #[error("Conversion produced no output at '{path}'")]
    MissingOutput { path: PathBuf },

    /// Image decoding or encoding failed
    #[error("Image conversion failed: {0}")]
    Image(#[from] image::ImageError),

    /// Engine did not finish in time
    #[error("Conversion timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Blocking conversion task was cancelled or panicked
    #[error("Conversion task failed: {reason}")]
    Task { reason: String },

    /// File access during conversion
    #[error("I/O error during conversion: {0}")]
    Io(#[from] io::Error),
}

/// Resource management error types
#[derive(Error, Debug)]
pub enum ResourceError {
    /// Scratch file could not be allocated
    #[error("Failed to create scratch file in '{dir}': {source}")]
    ScratchCreate {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Listener could not be bound
    #[error("Failed to bind {listener} listener at '{address}': {source}")]
    Bind {
        listener: &'static str,
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// Missing configuration file
    #[error("Configuration file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format in '{path}': {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    /// Configuration validation failed
    #[error("Configuration validation failed for '{section}': {reason}")]
    ValidationFailed { section: String, reason: String },

    /// Two dispatch rows share an id
    #[error("Duplicate conversion id {id}")]
    DuplicateConversion { id: u32 },
}

impl RelayError {
    /// Notice text to send to the peer for this failure, if any.
    ///
    /// Transport and resource failures return `None`: either the stream is
    /// gone or the failure is local and nothing useful can be said.
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            RelayError::Protocol(ProtocolError::Notice { .. }) => None,
            RelayError::Protocol(_) => Some(NOTICE_INVALID_OPTION),
            RelayError::Transfer(TransferError::Incomplete { .. }) => Some(NOTICE_INCOMPLETE_UPLOAD),
            RelayError::Transfer(TransferError::TooLarge { .. }) => Some(NOTICE_TOO_LARGE),
            RelayError::Engine(_) => Some(NOTICE_CONVERSION_FAILED),
            _ => None,
        }
    }

    /// Whether the failure happened on the connection itself
    pub fn is_transport(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }
}

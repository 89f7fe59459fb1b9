//! Error types for the order relay
//!
//! Each pipeline stage has its own closed error enum so replies can name the
//! exact failure. [`Error`] wraps them for code that crosses stages.

use thiserror::Error;

use crate::execution::order::OrderState;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse parse failure category, used for reply selection and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    MalformedNumber,
    UnknownAction,
    ArityMismatch,
    UnknownOptionType,
}

/// Syntactic failure while reading a text command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{field} must be a whole number, got '{token}'")]
    MalformedNumber { field: &'static str, token: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("expected {expected} words, got {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("option type must be CE or PE, got '{0}'")]
    UnknownOptionType(String),
}

impl ParseError {
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            ParseError::MalformedNumber { .. } => ParseErrorKind::MalformedNumber,
            ParseError::UnknownAction(_) => ParseErrorKind::UnknownAction,
            ParseError::ArityMismatch { .. } => ParseErrorKind::ArityMismatch,
            ParseError::UnknownOptionType(_) => ParseErrorKind::UnknownOptionType,
        }
    }
}

/// Brokerage session failures
///
/// Cloneable because one refresh outcome is shared by every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("timed out waiting for broker session")]
    Timeout,

    #[error("broker session down, retry after cooldown")]
    SessionDown,

    #[error("broker refused credentials: {0}")]
    InvalidCredentials(String),
}

/// Errors reported by a brokerage client for a single call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker call timed out after {0}ms")]
    Timeout(u64),

    #[error("broker server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("broker rejected token: {0}")]
    Unauthorized(String),

    #[error("broker rejected request: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Transport failures, timeouts and 5xx responses are worth resubmitting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_) | BrokerError::Timeout(_) | BrokerError::Server { .. }
        )
    }
}

/// Instrument resolution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no instrument for {0}")]
    NotFound(String),

    #[error("instrument lookup unavailable: {0}")]
    Unavailable(String),
}

/// Coarse execution failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    NotFound,
    BrokerRejected,
    BrokerUnavailable,
}

/// Order execution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("instrument not found: {0}")]
    NotFound(String),

    #[error("order rejected by broker: {0}")]
    BrokerRejected(String),

    #[error("broker unavailable after {attempts} attempt(s): {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },

    #[error("broker session unavailable: {0}")]
    Auth(#[from] AuthError),
}

impl ExecutionError {
    /// Session failures surface as broker unavailability
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ExecutionError::NotFound(_) => ExecutionErrorKind::NotFound,
            ExecutionError::BrokerRejected(_) => ExecutionErrorKind::BrokerRejected,
            ExecutionError::BrokerUnavailable { .. } | ExecutionError::Auth(_) => {
                ExecutionErrorKind::BrokerUnavailable
            }
        }
    }
}

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    // Order lifecycle errors
    #[error("Illegal order transition {from:?} -> {to:?}")]
    InvalidTransition { from: OrderState, to: OrderState },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Position management errors
    #[error("Position persistence failed: {0}")]
    PositionPersistence(String),

    // Instrument master errors
    #[error("Instrument master load failed: {0}")]
    InstrumentMaster(String),

    #[error("Dispatch queue closed for sender {0}")]
    DispatchClosed(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Broker(e) => e.is_retryable(),
            Error::Auth(AuthError::Timeout) => true,
            Error::Resolve(ResolveError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

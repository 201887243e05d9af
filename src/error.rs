//! Error types for the circuit engine
//!
//! This module provides the error taxonomy shared by every layer:
//! - Variants for framing, integrity, security and transport failures
//! - Error classification (fatal vs retryable)
//! - Error codes for programmatic handling
//!
//! A digest mismatch at a single hop is never surfaced as an error; the
//! circuit simply tries the next hop. Everything else propagates as
//! `Result<T, TorError>`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    Timeout = 101,
    Cancelled = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    IntegrityFailure = 202,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    StreamFailed = 302,
    WindowExhausted = 303,

    // Security errors (4xx) - FATAL
    SecurityViolation = 400,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Directory errors (6xx)
    DirectoryError = 600,
    NoRelaysAvailable = 601,

    // Configuration errors (8xx)
    ConfigError = 800,
    InvalidRelay = 801,

    // Internal errors (9xx)
    InternalError = 900,
    InvalidState = 901,
}

/// Main error type for the circuit engine
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Transport Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    // ===== Protocol Errors =====
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Integrity check failed: {0}")]
    CryptoIntegrity(String),

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Flow control window exhausted: {0}")]
    WindowExhausted(String),

    // ===== Security Errors (FATAL) =====
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    // ===== Directory Errors =====
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    // ===== Configuration Errors =====
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Transport
            TorError::ConnectionFailed(_) | TorError::Transport(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout(_) => ErrorCode::Timeout,
            TorError::Cancelled(_) => ErrorCode::Cancelled,

            // Protocol
            TorError::ProtocolFraming(_) | TorError::ProtocolViolation(_) => {
                ErrorCode::ProtocolViolation
            }
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,
            TorError::CryptoIntegrity(_) => ErrorCode::IntegrityFailure,

            // Circuit
            TorError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } | TorError::CircuitClosed(_) => {
                ErrorCode::CircuitDestroyed
            }
            TorError::Stream(_) => ErrorCode::StreamFailed,
            TorError::WindowExhausted(_) => ErrorCode::WindowExhausted,

            // Security (fatal)
            TorError::SecurityViolation(_) => ErrorCode::SecurityViolation,

            // Crypto
            TorError::Crypto(_) => ErrorCode::CryptoError,

            // Directory
            TorError::Directory(_) => ErrorCode::DirectoryError,
            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,

            // Config
            TorError::Config(_) | TorError::ParseError(_) => ErrorCode::ConfigError,
            TorError::InvalidRelay(_) => ErrorCode::InvalidRelay,

            // Internal
            TorError::Internal(_) => ErrorCode::InternalError,
            TorError::InvalidState(_) => ErrorCode::InvalidState,
        }
    }

    /// Whether this error is fatal (must abort whatever produced it)
    ///
    /// Fatal errors indicate a forged or tampered document or key. They are
    /// never retried against the same input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorError::SecurityViolation(_))
    }

    /// Whether this error can be retried with different relays
    ///
    /// Retryable errors are typically transient network or relay issues.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Transport(_)
                | TorError::Timeout(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::CircuitClosed(_)
                | TorError::CryptoIntegrity(_)
                | TorError::Stream(_)
                | TorError::Directory(_)
        )
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        TorError::CircuitDestroyed {
            reason,
            reason_name: destroy_reason_name(reason).to_string(),
        }
    }
}

/// Name of a DESTROY / TRUNCATED reason code
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TorError::Timeout(err.to_string())
            }
            _ => TorError::Transport(err.to_string()),
        }
    }
}

impl From<TorError> for std::io::Error {
    fn from(err: TorError) -> Self {
        let kind = match &err {
            TorError::Timeout(_) => std::io::ErrorKind::TimedOut,
            TorError::WindowExhausted(_) => std::io::ErrorKind::WouldBlock,
            TorError::Stream(_) | TorError::CircuitClosed(_) | TorError::CircuitDestroyed { .. } => {
                std::io::ErrorKind::BrokenPipe
            }
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

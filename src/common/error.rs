//! Error types for the relay daemon

use std::io;
use thiserror::Error;

/// Daemon error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("no bind address available: {0}")]
    BindUnavailable(String),

    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("timeout waiting for {0}")]
    ReadinessTimeout(String),

    #[error("socks5 connect failed: 0x{code:02x}")]
    UpstreamConnectFailed { code: u8 },

    #[error("socks5 no-auth not accepted")]
    AuthNotAccepted,

    #[error("process exited: {0}")]
    ProcessExit(String),

    #[error("candidate search exhausted: {0}")]
    SearchExhausted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn spawn_failed<P: Into<String>, R: ToString>(program: P, reason: R) -> Self {
        Error::SpawnFailed {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a failed candidate should be skipped rather than aborting the search.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SpawnFailed { .. }
                | Error::ReadinessTimeout(_)
                | Error::ProcessExit(_)
                | Error::UpstreamConnectFailed { .. }
                | Error::AuthNotAccepted
                | Error::Protocol(_)
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::RegistrationFailed(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

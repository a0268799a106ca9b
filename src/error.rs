//! Error types for mail-attachment-fetcher

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Email parsing error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Poll loop is already running")]
    AlreadyRunning,

    #[error("Stop requested")]
    Cancelled,
}

impl Error {
    /// Short, stable name of the error category, used as a log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Connection(_) => "connection",
            Self::Tls(_) => "tls",
            Self::Protocol(_) => "protocol",
            Self::Parse(_) => "parse",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::AlreadyRunning => "already_running",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the next poll tick may succeed where this one failed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::AlreadyRunning)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the PostgreSQL wire client.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to PostgreSQL.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (unexpected message, invalid framing, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server returned an `ErrorResponse`.
    #[error(transparent)]
    Server(Box<ServerError>),

    /// A codec refused a value (out of range, invalid text form, etc.).
    #[error("type error: {0}")]
    Type(String),

    /// Connection is closed or was closed while waiting on it.
    #[error("connection closed")]
    ConnectionClosed,

    /// Commit or rollback on a transaction that is no longer open.
    #[error("transaction is not open")]
    TransactionClosed,

    /// Receiving on a channel that is no longer registered.
    #[error("channel {0:?} is not listening")]
    ChannelClosed(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// The SQLSTATE code if this is a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(&e.code),
            _ => None,
        }
    }

    /// Borrow the server error record, if any.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Error::Server(Box::new(e))
    }
}

/// An error or notice record from the server.
///
/// Fields follow the letter-tagged error-and-notice field protocol. Missing
/// severity and code default to `ERROR` and `XX000`.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<i32>,
    pub routine: Option<String>,
}

impl ServerError {
    /// Build from the letter-tagged field map of an ErrorResponse or
    /// NoticeResponse.
    pub fn from_fields(mut fields: HashMap<u8, String>) -> Self {
        Self {
            // 'V' is the nonlocalized severity, preferred when present.
            severity: fields
                .remove(&b'V')
                .or_else(|| fields.remove(&b'S'))
                .unwrap_or_else(|| "ERROR".to_string()),
            code: fields.remove(&b'C').unwrap_or_else(|| "XX000".to_string()),
            message: fields.remove(&b'M').unwrap_or_default(),
            detail: fields.remove(&b'D'),
            hint: fields.remove(&b'H'),
            position: fields.remove(&b'P'),
            where_: fields.remove(&b'W'),
            schema: fields.remove(&b's'),
            table: fields.remove(&b't'),
            column: fields.remove(&b'c'),
            data_type: fields.remove(&b'd'),
            constraint: fields.remove(&b'n'),
            file: fields.remove(&b'F'),
            line: fields.remove(&b'L').and_then(|l| l.parse().ok()),
            routine: fields.remove(&b'R'),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

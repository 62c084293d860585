// shared/src/lib.rs

/// Every failure the proxy can report. The `Display` text is what ends up in
/// the `message` field of an error reply.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("\"command\" property is mandatory for request")]
    MissingCommand,
    #[error("unknown command: '{0}'")]
    UnknownCommand(String),
    #[error("missing mandatory non-empty field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("operation '{0}' timed out")]
    Timeout(String),
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("unsupported object type: {0}")]
    UnsupportedValueType(String),
    #[error("connection pool unavailable: {0}")]
    PoolUnavailable(String),
    #[error("no handler registered at '{0}'")]
    NoHandler(String),
    #[error("address '{0}' already has a handler")]
    AddressInUse(String),
    #[error("handler at '{0}' did not reply")]
    NoReply(String),
    #[error("no reply from '{address}' within {limit:?}")]
    ReplyTimeout {
        address: String,
        limit: std::time::Duration,
    },
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// True for the failures a caller causes by sending a malformed envelope.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::MissingField(_) | Error::InvalidField { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;

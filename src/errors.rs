use crate::query;
use std::{borrow::Cow, fmt, io};

/// Failures while reading the request line and headers.
///
/// Any of them means the request is treated as absent and the client gets
/// the fixed `400 Bad Request` answer.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProtocolError {
    #[error("request line or header longer than {0} bytes")]
    LineTooLong(usize),
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("unknown HTTP method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("more than {0} headers")]
    TooManyHeaders(usize),
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,
    #[error("invalid query string: {0}")]
    Query(#[from] query::Error),
    #[error("i/o error while reading request: {0}")]
    Io(#[from] io::Error),
}

/// Stable identity of a handler failure.
///
/// Used as the key of exception handlers registered with
/// [`App::exception_handler`](crate::App::exception_handler). Applications
/// name their own failure classes with [`ErrorKind::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input supplied by the client (bad form encoding, bad parameter).
    InvalidInput,
    /// [`body`](crate::Request::body) and [`stream`](crate::Request::stream)
    /// were both used on one request.
    BodyConflict,
    /// The declared body is larger than
    /// [`max_body_length`](crate::limits::ReqLimits::max_body_length);
    /// it can still be consumed through [`stream`](crate::Request::stream).
    BodyTooLarge,
    /// JSON encoding or decoding failed.
    Json,
    /// I/O failure (reading the body, opening a file, ...).
    Io,
    /// The handler panicked.
    Panic,
    /// Application-defined failure class.
    Custom(&'static str),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => f.write_str("invalid input"),
            ErrorKind::BodyConflict => f.write_str("body conflict"),
            ErrorKind::BodyTooLarge => f.write_str("body too large"),
            ErrorKind::Json => f.write_str("json"),
            ErrorKind::Io => f.write_str("i/o"),
            ErrorKind::Panic => f.write_str("panic"),
            ErrorKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Error returned by route handlers and hooks.
///
/// # Examples
/// ```
/// use nanodot::{Error, ErrorKind};
///
/// let err = Error::custom("valve", "valve 3 is stuck");
/// assert_eq!(err.kind(), ErrorKind::Custom("valve"));
/// assert_eq!(err.to_string(), "valve: valve 3 is stuck");
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new<M: Into<Cow<'static, str>>>(kind: ErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for `Error::new(ErrorKind::Custom(name), message)`.
    pub fn custom<M: Into<Cow<'static, str>>>(name: &'static str, message: M) -> Self {
        Self::new(ErrorKind::Custom(name), message)
    }

    /// Attaches the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Json, err.to_string()).with_source(err)
    }
}

impl From<query::Error> for Error {
    fn from(err: query::Error) -> Self {
        Error::new(ErrorKind::InvalidInput, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn conversions() {
        let err = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.source().is_some());

        let err = Error::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err());
        assert_eq!(err.kind(), ErrorKind::Json);

        let err = Error::from(query::Error::InvalidEscape);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn display() {
        assert_eq!(
            Error::new(ErrorKind::BodyConflict, "stream already used").to_string(),
            "body conflict: stream already used"
        );
        assert_eq!(
            ProtocolError::LineTooLong(2048).to_string(),
            "request line or header longer than 2048 bytes"
        );
    }
}

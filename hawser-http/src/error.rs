use std::io;

/// Errors produced by the HTTP client.
///
/// A 4xx or 5xx response is not an error: any response the server actually
/// produced is returned as a [`Response`](crate::Response). Errors are
/// reserved for exchanges that never completed.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Unrecoverable problem with the request itself (malformed URL,
    /// unsupported scheme, empty host). Never retried.
    #[error("bad request: {0}")]
    Request(String),

    /// Failure opening or handshaking one specific route. Recoverable by
    /// trying the next route while the selector has more.
    #[error("route {route} failed: {source}")]
    Route {
        route: String,
        #[source]
        source: io::Error,
    },

    /// The peer produced malformed or disallowed bytes. Not retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The call was canceled.
    #[error("canceled")]
    Canceled,

    /// A configured deadline elapsed. Not retried.
    #[error("timeout")]
    Timeout,

    /// TLS handshake or certificate pinning failure. Not retried.
    #[error("security error: {0}")]
    Security(String),

    /// Transient I/O failure. Retried on a fresh route when the request
    /// body is replayable.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The redirect/auth chain exceeded the follow-up bound.
    #[error("too many follow-up requests: {0}")]
    TooManyFollowUps(u32),
}

impl HttpError {
    /// Maps timeout-flavored I/O errors onto [`HttpError::Timeout`] so the
    /// recovery logic can refuse to retry them.
    pub(crate) fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => HttpError::Timeout,
            _ => HttpError::Io(e),
        }
    }
}

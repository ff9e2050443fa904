//! The wire transport contract.
//!
//! A transport drives one request/response exchange over a connection:
//! HTTP/1.x framing in [`crate::http1`], HTTP/2 framing in an external
//! driver wired in through [`TransportFactory`].

use std::io::Write;
use std::sync::Arc;

use crate::body::{ResponseBody, RetryableSink};
use crate::connection::Connection;
use crate::error::HttpError;
use crate::request::Request;
use crate::response::{Response, ResponseBuilder};

/// The deadline for draining a residual response stream so its connection
/// can be reused. Connection setup costs far more than this; past it, the
/// socket is closed instead.
pub const DISCARD_STREAM_TIMEOUT_MILLIS: u64 = 100;

/// One request/response exchange on the wire.
pub trait Transport: Send {
    /// Emit the request line and headers. The engine records the send
    /// timestamp immediately before calling this.
    fn write_request_headers(&mut self, request: &Request) -> Result<(), HttpError>;

    /// A sink that frames request body bytes onto the wire: fixed-length
    /// when `content_length` is known, chunked when the request asks for
    /// it.
    fn create_request_body(
        &mut self,
        request: &Request,
        content_length: Option<u64>,
    ) -> Result<Box<dyn Write + Send>, HttpError>;

    /// Replay a fully buffered body onto the wire.
    fn write_request_body(&mut self, body: &RetryableSink) -> Result<(), HttpError>;

    /// Complete request framing (terminal chunk, length check) and flush.
    fn finish_request(&mut self) -> Result<(), HttpError>;

    /// Block until the status line and headers are available.
    fn read_response_headers(&mut self) -> Result<ResponseBuilder, HttpError>;

    /// A body stream framed by Content-Length, chunked encoding, or
    /// end of stream.
    fn open_response_body(&mut self, response: &Response) -> Result<ResponseBody, HttpError>;

    /// Arrange for the connection to return to the pool once the response
    /// body is fully consumed or closed.
    fn release_connection_on_idle(&mut self) -> Result<(), HttpError>;

    /// False after protocol errors or `Connection: close`.
    fn can_reuse_connection(&self) -> bool;

    /// Forcibly drop the socket, interrupting blocked I/O.
    fn disconnect(&mut self);
}

/// Builds transports for protocols this crate does not frame itself.
/// Install one on the client to speak HTTP/2 over connections whose ALPN
/// negotiated it.
pub trait TransportFactory: Send + Sync {
    fn new_transport(&self, connection: Arc<Connection>) -> Result<Box<dyn Transport>, HttpError>;
}

//! HTTP/1.1 wire driver.
//!
//! One request/response pair at a time over a pooled connection: request
//! serialization, status line and header parsing, and body framing by
//! Content-Length, chunked transfer encoding, or end of stream. Response
//! body sources return the connection to the pool when the body is fully
//! consumed, and bounded residual-stream discard keeps short abandons
//! from costing the socket.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;

use crate::body::{ResponseBody, RetryableSink};
use crate::connection::{Connection, Protocol};
use crate::engine::has_body;
use crate::error::HttpError;
use crate::pool::ConnectionPool;
use crate::request::{request_path, Request};
use crate::response::{Response, ResponseBuilder};
use crate::transport::{Transport, DISCARD_STREAM_TIMEOUT_MILLIS};

/// HTTP/1.1 transport over a [`Connection`].
pub struct Http1Transport {
    state: Arc<H1State>,
    body_framing: Option<BodyFraming>,
}

enum BodyFraming {
    Chunked { finished: Arc<AtomicBool> },
    Fixed { remaining: Arc<AtomicU64> },
}

impl Http1Transport {
    pub fn new(
        connection: Arc<Connection>,
        pool: Arc<ConnectionPool>,
        engine_id: u64,
        read_timeout: Option<Duration>,
    ) -> Http1Transport {
        Http1Transport {
            state: Arc::new(H1State {
                connection,
                pool,
                engine_id,
                read_timeout,
                reusable: AtomicBool::new(true),
                release_on_idle: AtomicBool::new(false),
                released: AtomicBool::new(false),
                body_in_flight: AtomicBool::new(false),
            }),
            body_framing: None,
        }
    }
}

impl Transport for Http1Transport {
    fn write_request_headers(&mut self, request: &Request) -> Result<(), HttpError> {
        let route = self.state.connection.route();
        // Absolute-form target when speaking plaintext through an HTTP
        // proxy; origin-form otherwise.
        let proxied_cleartext = matches!(route.proxy(), crate::address::Proxy::Http { .. })
            && route.address().tls_config().is_none();
        let target = if proxied_cleartext {
            let mut absolute = request.url().clone();
            absolute.set_fragment(None);
            absolute.to_string()
        } else {
            request_path(request.url())
        };

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(request.method().as_bytes());
        head.push(b' ');
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in request.headers().iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        if request
            .header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            self.state.reusable.store(false, Ordering::Release);
        }

        self.state.write_all(&head)
    }

    fn create_request_body(
        &mut self,
        request: &Request,
        content_length: Option<u64>,
    ) -> Result<Box<dyn Write + Send>, HttpError> {
        let chunked = request
            .header("Transfer-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        if chunked {
            let finished = Arc::new(AtomicBool::new(false));
            self.body_framing = Some(BodyFraming::Chunked {
                finished: finished.clone(),
            });
            return Ok(Box::new(ChunkedSink {
                state: self.state.clone(),
                finished,
            }));
        }
        if let Some(length) = content_length {
            let remaining = Arc::new(AtomicU64::new(length));
            self.body_framing = Some(BodyFraming::Fixed {
                remaining: remaining.clone(),
            });
            return Ok(Box::new(FixedSink {
                state: self.state.clone(),
                remaining,
            }));
        }
        Err(HttpError::Request(
            "cannot stream a request body without chunked encoding or a known length".to_string(),
        ))
    }

    fn write_request_body(&mut self, body: &RetryableSink) -> Result<(), HttpError> {
        self.state.write_all(body.bytes())
    }

    fn finish_request(&mut self) -> Result<(), HttpError> {
        match self.body_framing.take() {
            Some(BodyFraming::Chunked { finished }) => {
                if !finished.swap(true, Ordering::AcqRel) {
                    self.state.write_all(b"0\r\n\r\n")?;
                }
            }
            Some(BodyFraming::Fixed { remaining }) => {
                let left = remaining.load(Ordering::Acquire);
                if left > 0 {
                    return Err(HttpError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("request body ended {left} bytes short of content-length"),
                    )));
                }
            }
            None => {}
        }
        self.state.flush()
    }

    fn read_response_headers(&mut self) -> Result<ResponseBuilder, HttpError> {
        let status_line = self.state.read_line()?;
        let (protocol, code, message) = parse_status_line(&status_line).ok_or_else(|| {
            self.state.reusable.store(false, Ordering::Release);
            HttpError::Protocol(format!("unexpected status line: {status_line}"))
        })?;

        let mut builder = ResponseBuilder::new()
            .protocol(protocol)
            .code(code)
            .message(message);
        loop {
            let line = self.state.read_line()?;
            if line.is_empty() {
                break;
            }
            if let Some(value) = header_value(&line, "Connection") {
                if value.eq_ignore_ascii_case("close") {
                    self.state.reusable.store(false, Ordering::Release);
                }
            }
            builder = builder.add_lenient_header_line(&line);
        }

        // HTTP/1.0 peers do not keep connections alive by default.
        if protocol == Protocol::Http10 {
            self.state.reusable.store(false, Ordering::Release);
        }

        Ok(builder)
    }

    fn open_response_body(&mut self, response: &Response) -> Result<ResponseBody, HttpError> {
        let content_type = response.header("Content-Type").map(str::to_string);

        if !has_body(response) {
            return Ok(ResponseBody::new(
                content_type,
                Some(0),
                Box::new(EmptySource {
                    state: self.state.clone(),
                    notified: false,
                }),
            ));
        }

        let chunked = response
            .header("Transfer-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        if chunked {
            self.state.body_in_flight.store(true, Ordering::Release);
            return Ok(ResponseBody::new(
                content_type,
                None,
                Box::new(ChunkedSource {
                    state: self.state.clone(),
                    chunk_remaining: 0,
                    read_any_chunk: false,
                    complete: false,
                }),
            ));
        }

        if let Some(length) = content_length(response) {
            let source = FixedSource {
                state: self.state.clone(),
                remaining: length,
                complete: length == 0,
            };
            if length == 0 {
                self.state.maybe_release_idle();
            } else {
                self.state.body_in_flight.store(true, Ordering::Release);
            }
            return Ok(ResponseBody::new(
                content_type,
                Some(length),
                Box::new(source),
            ));
        }

        // No framing: the body runs to end of stream, so the connection
        // cannot carry another exchange.
        self.state.reusable.store(false, Ordering::Release);
        self.state.body_in_flight.store(true, Ordering::Release);
        Ok(ResponseBody::new(
            content_type,
            None,
            Box::new(UntilEofSource {
                state: self.state.clone(),
                complete: false,
            }),
        ))
    }

    fn release_connection_on_idle(&mut self) -> Result<(), HttpError> {
        self.state.release_on_idle.store(true, Ordering::Release);
        self.state.maybe_release_idle();
        Ok(())
    }

    fn can_reuse_connection(&self) -> bool {
        self.state.reusable.load(Ordering::Acquire) && !self.state.connection.is_closed()
    }

    fn disconnect(&mut self) {
        self.state.connection.close();
    }
}

struct H1State {
    connection: Arc<Connection>,
    pool: Arc<ConnectionPool>,
    engine_id: u64,
    read_timeout: Option<Duration>,
    reusable: AtomicBool,
    release_on_idle: AtomicBool,
    released: AtomicBool,
    body_in_flight: AtomicBool,
}

impl H1State {
    fn write_all(&self, data: &[u8]) -> Result<(), HttpError> {
        let mut io = self.connection.io().lock();
        io.stream.write_all(data).map_err(HttpError::from_io)
    }

    fn flush(&self) -> Result<(), HttpError> {
        let mut io = self.connection.io().lock();
        io.stream.flush().map_err(HttpError::from_io)
    }

    /// Read one CRLF-terminated line, filling the buffer from the socket
    /// as needed.
    fn read_line(&self) -> Result<String, HttpError> {
        let mut io = self.connection.io().lock();
        loop {
            if let Some(pos) = io.read_buf.iter().position(|&b| b == b'\n') {
                let raw = io.read_buf.split_to(pos + 1);
                let mut line = &raw[..raw.len() - 1];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                return String::from_utf8(line.to_vec())
                    .map_err(|_| HttpError::Protocol("non-utf-8 header line".to_string()));
            }
            if io.read_buf.len() > 256 * 1024 {
                return Err(HttpError::Protocol("headers too large".to_string()));
            }
            let mut chunk = [0u8; 8 * 1024];
            let n = io.stream.read(&mut chunk).map_err(HttpError::from_io)?;
            if n == 0 {
                return Err(HttpError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a complete header",
                )));
            }
            io.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read body bytes: buffered leftovers first, then the socket.
    fn read_data(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut io = self.connection.io().lock();
        if !io.read_buf.is_empty() {
            let n = io.read_buf.len().min(buf.len());
            buf[..n].copy_from_slice(&io.read_buf[..n]);
            io.read_buf.advance(n);
            return Ok(n);
        }
        io.stream.read(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) {
        let mut io = self.connection.io().lock();
        let _ = io.stream.set_read_timeout(timeout);
    }

    /// The body finished cleanly.
    fn on_body_complete(&self) {
        self.body_in_flight.store(false, Ordering::Release);
        self.maybe_release_idle();
    }

    /// The body failed; the socket is in an unknown state.
    fn on_body_error(&self) {
        self.reusable.store(false, Ordering::Release);
        self.body_in_flight.store(false, Ordering::Release);
        if !self.released.swap(true, Ordering::AcqRel) {
            self.connection.close();
        }
    }

    /// Recycle or close once the engine asked for release and the body is
    /// done.
    fn maybe_release_idle(&self) {
        if !self.release_on_idle.load(Ordering::Acquire)
            || self.body_in_flight.load(Ordering::Acquire)
            || self.released.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.connection.clear_owner(self.engine_id);
        if self.reusable.load(Ordering::Acquire) && !self.connection.is_closed() {
            self.pool.recycle(self.connection.clone());
        } else {
            self.connection.close();
        }
    }

    /// Drain an abandoned body so the socket can be reused, giving up
    /// after [`DISCARD_STREAM_TIMEOUT_MILLIS`] or too many residual
    /// bytes. Returns true if the source reached its clean end.
    fn discard<R: Read>(&self, source: &mut R) -> bool {
        if self.released.load(Ordering::Acquire) {
            return false;
        }
        self.set_read_timeout(Some(Duration::from_millis(DISCARD_STREAM_TIMEOUT_MILLIS)));
        let mut buf = [0u8; 8 * 1024];
        let mut drained = 0usize;
        let clean = loop {
            match source.read(&mut buf) {
                Ok(0) => break true,
                Ok(n) => {
                    drained += n;
                    if drained > 256 * 1024 {
                        break false;
                    }
                }
                Err(_) => break false,
            }
        };
        self.set_read_timeout(self.read_timeout);
        clean
    }
}

fn parse_status_line(line: &str) -> Option<(Protocol, u16, &str)> {
    let rest = line.strip_prefix("HTTP/1.")?;
    let protocol = match rest.chars().next()? {
        '0' => Protocol::Http10,
        '1' => Protocol::Http11,
        _ => return None,
    };
    let rest = rest.get(1..)?.strip_prefix(' ')?;
    let (code_str, message) = match rest.split_once(' ') {
        Some((code, message)) => (code, message),
        None => (rest, ""),
    };
    let code: u16 = code_str.parse().ok()?;
    Some((protocol, code, message))
}

/// The value of `line` if its name matches, honoring optional whitespace
/// before the colon.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (line_name, value) = line.split_once(':')?;
    if line_name.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

fn content_length(response: &Response) -> Option<u64> {
    response.header("Content-Length")?.trim().parse().ok()
}

// -- Request body sinks --

struct ChunkedSink {
    state: Arc<H1State>,
    finished: Arc<AtomicBool>,
}

impl Write for ChunkedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.finished.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "chunked body finished"));
        }
        let mut framed = format!("{:x}\r\n", buf.len()).into_bytes();
        framed.extend_from_slice(buf);
        framed.extend_from_slice(b"\r\n");
        self.state
            .write_all(&framed)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state
            .flush()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

struct FixedSink {
    state: Arc<H1State>,
    remaining: Arc<AtomicU64>,
}

impl Write for FixedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.remaining.load(Ordering::Acquire);
        if buf.len() as u64 > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {remaining} more bytes, got {}", buf.len()),
            ));
        }
        self.state
            .write_all(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.remaining
            .fetch_sub(buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state
            .flush()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

// -- Response body sources --

/// A zero-length body that still participates in connection release.
struct EmptySource {
    state: Arc<H1State>,
    notified: bool,
}

impl Read for EmptySource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Drop for EmptySource {
    fn drop(&mut self) {
        if !self.notified {
            self.notified = true;
            self.state.maybe_release_idle();
        }
    }
}

struct FixedSource {
    state: Arc<H1State>,
    remaining: u64,
    complete: bool,
}

impl Read for FixedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            if !self.complete {
                self.complete = true;
                self.state.on_body_complete();
            }
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.state.read_data(&mut buf[..want])?;
        if n == 0 {
            self.state.on_body_error();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.complete = true;
            self.state.on_body_complete();
        }
        Ok(n)
    }
}

impl Drop for FixedSource {
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        let state = self.state.clone();
        let clean = state.discard(&mut DrainAdapter { inner: self });
        if !clean || !self.complete {
            state.on_body_error();
        }
    }
}

/// Reads from a source during drop-time discard without re-entering its
/// `Drop`.
struct DrainAdapter<'a, T: Read> {
    inner: &'a mut T,
}

impl<T: Read> Read for DrainAdapter<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

struct ChunkedSource {
    state: Arc<H1State>,
    chunk_remaining: u64,
    read_any_chunk: bool,
    complete: bool,
}

impl ChunkedSource {
    /// Advance to the next chunk header. Returns false at the last chunk.
    fn next_chunk(&mut self) -> io::Result<bool> {
        if self.read_any_chunk {
            // Consume the CRLF that trails every chunk's data.
            let trailer = self
                .state
                .read_line()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if !trailer.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected chunk data terminator",
                ));
            }
        }
        let size_line = self
            .state
            .read_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        // Chunk extensions (";key=value") are ignored.
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_hex, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
        self.read_any_chunk = true;
        if size == 0 {
            // Trailers run to the empty line.
            loop {
                let line = self
                    .state
                    .read_line()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                if line.is_empty() {
                    break;
                }
            }
            return Ok(false);
        }
        self.chunk_remaining = size;
        Ok(true)
    }
}

impl Read for ChunkedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.complete {
            return Ok(0);
        }
        if self.chunk_remaining == 0 {
            match self.next_chunk() {
                Ok(true) => {}
                Ok(false) => {
                    self.complete = true;
                    self.state.on_body_complete();
                    return Ok(0);
                }
                Err(e) => {
                    self.state.on_body_error();
                    return Err(e);
                }
            }
        }
        let want = buf.len().min(self.chunk_remaining as usize);
        let n = self.state.read_data(&mut buf[..want])?;
        if n == 0 {
            self.state.on_body_error();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-chunk",
            ));
        }
        self.chunk_remaining -= n as u64;
        Ok(n)
    }
}

impl Drop for ChunkedSource {
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        let state = self.state.clone();
        let clean = state.discard(&mut DrainAdapter { inner: self });
        if !clean || !self.complete {
            state.on_body_error();
        }
    }
}

struct UntilEofSource {
    state: Arc<H1State>,
    complete: bool,
}

impl Read for UntilEofSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.complete {
            return Ok(0);
        }
        let n = self.state.read_data(buf)?;
        if n == 0 {
            self.complete = true;
            self.state.on_body_complete();
        }
        Ok(n)
    }
}

impl Drop for UntilEofSource {
    fn drop(&mut self) {
        if !self.complete {
            // Unframed bodies cannot be drained to a reusable point.
            self.state.on_body_error();
        }
    }
}

//! A live socket to an origin server or proxy.
//!
//! A [`Connection`] owns one socket, its TLS state, and the bookkeeping
//! the pool needs: protocol, idle timestamp, owner, and stream counts.
//! An HTTP/1.x connection is owned by at most one engine at a time; an
//! HTTP/2 connection is shared and tracks its live stream count instead.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::HttpError;
use crate::metrics;
use crate::response::Handshake;
use crate::route::Route;
use crate::tls;

/// Wire protocols the client can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
    H2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "http/1.0",
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
        }
    }
}

/// Shuts a socket down from another thread, interrupting blocked I/O.
pub trait ShutdownHandle: Send + Sync {
    fn shutdown(&self);
}

struct TcpShutdown(TcpStream);

impl ShutdownHandle for TcpShutdown {
    fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// A no-op handle for streams without a socket.
#[cfg(test)]
pub(crate) struct NoopShutdown;

#[cfg(test)]
impl ShutdownHandle for NoopShutdown {
    fn shutdown(&self) {}
}

/// Blocking byte stream under a connection.
pub trait Stream: Read + Write + Send {
    /// Probe whether an idle stream is still usable: open, with no
    /// unexpected bytes waiting.
    fn is_healthy(&mut self) -> bool;

    /// Adjust the read deadline; used to bound residual-stream discards.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn is_healthy(&mut self) -> bool {
        probe_socket(self)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl Stream for tls::TlsStream {
    fn is_healthy(&mut self) -> bool {
        // Socket-level probe: buffered close_notify or stray bytes read as
        // waiting data, which conservatively fails the probe.
        probe_socket(&self.sock)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }
}

/// True if the socket is open with nothing buffered: a healthy idle
/// keep-alive connection. EOF, stray bytes, and probe errors all fail.
fn probe_socket(socket: &TcpStream) -> bool {
    if socket.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let healthy = match socket.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    socket.set_nonblocking(false).is_ok() && healthy
}

/// Buffered I/O state for one connection: the stream plus bytes read from
/// the socket but not yet consumed by a parser.
pub(crate) struct ConnIo {
    pub stream: Box<dyn Stream>,
    pub read_buf: BytesMut,
}

/// One live socket and its lifecycle state.
pub struct Connection {
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    io: Mutex<ConnIo>,
    shutdown: Arc<dyn ShutdownHandle>,
    idle_at: Mutex<Instant>,
    owner_id: Mutex<Option<u64>>,
    recycle_count: AtomicU32,
    stream_count: AtomicU32,
    closed: AtomicBool,
}

impl Connection {
    /// Open a socket along `route`, tunneling and handshaking as the
    /// route demands.
    pub fn connect(
        route: Route,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Connection, HttpError> {
        let route_error = |source: io::Error| HttpError::Route {
            route: route.to_string(),
            source,
        };

        let tcp = match connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&route.socket_addr(), timeout),
            None => TcpStream::connect(route.socket_addr()),
        }
        .map_err(route_error)?;
        tcp.set_read_timeout(read_timeout).map_err(route_error)?;
        tcp.set_write_timeout(write_timeout).map_err(route_error)?;
        tcp.set_nodelay(true).map_err(route_error)?;

        let shutdown: Arc<dyn ShutdownHandle> =
            Arc::new(TcpShutdown(tcp.try_clone().map_err(route_error)?));

        let mut tcp = tcp;
        if route.requires_tunnel() {
            establish_tunnel(&mut tcp, &route).map_err(route_error)?;
        }

        let address = route.address();
        let (stream, handshake, protocol): (Box<dyn Stream>, Option<Handshake>, Protocol) =
            match address.tls_config() {
                Some(config) => {
                    let (tls_stream, handshake, protocol) = tls::handshake(
                        tcp,
                        address.host(),
                        config.clone(),
                        address.certificate_pinner(),
                    )?;
                    (Box::new(tls_stream), Some(handshake), protocol)
                }
                None => (Box::new(tcp), None, Protocol::Http11),
            };

        debug!(route = %route, protocol = protocol.as_str(), "connection established");
        metrics::CONNECTIONS_CREATED.increment();

        Ok(Connection {
            route,
            protocol,
            handshake,
            io: Mutex::new(ConnIo {
                stream,
                read_buf: BytesMut::new(),
            }),
            shutdown,
            idle_at: Mutex::new(Instant::now()),
            owner_id: Mutex::new(None),
            recycle_count: AtomicU32::new(0),
            stream_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// A connection over an arbitrary stream; used by in-process tests.
    #[cfg(test)]
    pub(crate) fn from_stream(
        route: Route,
        protocol: Protocol,
        stream: Box<dyn Stream>,
    ) -> Connection {
        Connection {
            route,
            protocol,
            handshake: None,
            io: Mutex::new(ConnIo {
                stream,
                read_buf: BytesMut::new(),
            }),
            shutdown: Arc::new(NoopShutdown),
            idle_at: Mutex::new(Instant::now()),
            owner_id: Mutex::new(None),
            recycle_count: AtomicU32::new(0),
            stream_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// True for protocols that multiplex many exchanges over one socket.
    pub fn is_multiplexed(&self) -> bool {
        self.protocol == Protocol::H2
    }

    pub(crate) fn io(&self) -> &Mutex<ConnIo> {
        &self.io
    }

    /// Claim exclusive ownership for an engine. Multiplexed connections
    /// are never exclusively owned.
    pub(crate) fn set_owner(&self, engine_id: u64) {
        *self.owner_id.lock() = Some(engine_id);
    }

    /// Release ownership. Returns false if `engine_id` was not the owner,
    /// in which case the caller must not touch the socket further.
    pub(crate) fn clear_owner(&self, engine_id: u64) -> bool {
        let mut owner = self.owner_id.lock();
        if *owner == Some(engine_id) {
            *owner = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.owner_id.lock().is_none() && self.stream_count.load(Ordering::Acquire) == 0
    }

    pub(crate) fn mark_idle_now(&self) {
        *self.idle_at.lock() = Instant::now();
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        self.idle_at.lock().elapsed()
    }

    /// Times this connection has been returned to the pool. A failure on
    /// a recycled connection is not held against its route.
    pub fn recycle_count(&self) -> u32 {
        self.recycle_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_recycle_count(&self) {
        self.recycle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Live multiplexed stream count.
    pub fn stream_count(&self) -> u32 {
        self.stream_count.load(Ordering::Acquire)
    }

    pub(crate) fn allocate_stream(&self) {
        self.stream_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_stream(&self) {
        self.stream_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Probe socket liveness for pooled reuse.
    pub fn is_healthy(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.io.try_lock() {
            // Stray buffered bytes mean the previous exchange did not end
            // cleanly; the socket cannot be reused.
            Some(mut io) => io.read_buf.is_empty() && io.stream.is_healthy(),
            // Someone is mid-exchange on this connection.
            None => false,
        }
    }

    /// A handle that drops the socket from any thread.
    pub fn shutdown_handle(&self) -> Arc<dyn ShutdownHandle> {
        self.shutdown.clone()
    }

    /// Drop the socket. In-flight blocking I/O observes an error.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("route", &self.route.to_string())
            .field("protocol", &self.protocol)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Send a `CONNECT` and confirm the proxy opened the tunnel.
fn establish_tunnel(tcp: &mut TcpStream, route: &Route) -> io::Result<()> {
    let target = format!("{}:{}", route.address().host(), route.address().port());
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    tcp.write_all(request.as_bytes())?;

    // Read up to the blank line; the proxy sends nothing further until it
    // sees our TLS ClientHello.
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 16 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized proxy response",
            ));
        }
        match tcp.read(&mut byte)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed during tunnel setup",
                ))
            }
            _ => response.push(byte[0]),
        }
    }

    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let status_line = String::from_utf8_lossy(status_line);
    let code: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if code != 200 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused tunnel: {status_line}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// An in-memory stream: reads from a script, captures writes.
    pub(crate) struct ScriptedStream {
        pub input: io::Cursor<Vec<u8>>,
        pub output: Arc<PlMutex<Vec<u8>>>,
        pub healthy: bool,
    }

    impl ScriptedStream {
        pub fn new(input: &[u8]) -> (ScriptedStream, Arc<PlMutex<Vec<u8>>>) {
            let output = Arc::new(PlMutex::new(Vec::new()));
            (
                ScriptedStream {
                    input: io::Cursor::new(input.to_vec()),
                    output: output.clone(),
                    healthy: true,
                },
                output,
            )
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Stream for ScriptedStream {
        fn is_healthy(&mut self) -> bool {
            self.healthy
        }

        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }
}

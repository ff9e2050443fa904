//! Request and response body types.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::HttpError;

/// A request body: a producer of bytes with a known or unknown length.
///
/// `Bytes` bodies are fully buffered and can be replayed after a mid-flight
/// connection failure. `Stream` bodies are one-shot: the reader is taken
/// the first time the body is written, and a retry that needs it again
/// surfaces the original failure instead.
#[derive(Clone)]
pub enum Body {
    Bytes(Bytes),
    Stream(StreamBody),
}

/// One-shot streaming body. Cloning shares the underlying reader; whichever
/// clone writes first consumes it.
#[derive(Clone)]
pub struct StreamBody {
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
    content_length: Option<u64>,
}

impl Body {
    pub fn from_reader(reader: impl Read + Send + 'static, content_length: Option<u64>) -> Self {
        Body::Stream(StreamBody {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
            content_length,
        })
    }

    /// Bytes the body will produce, if known up front.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream(s) => s.content_length,
        }
    }

    /// True if the body can be written more than once.
    pub fn is_replayable(&self) -> bool {
        matches!(self, Body::Bytes(_))
    }

    /// Write the body to `sink`. A stream body can only be written once.
    pub(crate) fn write_to(&self, sink: &mut dyn Write) -> Result<(), HttpError> {
        match self {
            Body::Bytes(bytes) => {
                sink.write_all(bytes)?;
                Ok(())
            }
            Body::Stream(stream) => {
                let mut reader = stream.reader.lock().take().ok_or_else(|| {
                    HttpError::Request("streaming request body already consumed".to_string())
                })?;
                io::copy(&mut reader, sink)?;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Body::Stream(s) => f
                .debug_struct("Stream")
                .field("content_length", &s.content_length)
                .finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Body {
    fn from(s: &[u8]) -> Self {
        Body::Bytes(Bytes::copy_from_slice(s))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::from(s.as_bytes())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s.into_bytes()))
    }
}

/// A request body sink that buffers everything it is given so the bytes
/// can be replayed onto a fresh connection after a transient failure.
///
/// When constructed with a length limit, closing before `limit` bytes were
/// written is an error: the request promised a `Content-Length` it did not
/// honor.
#[derive(Debug, Default)]
pub struct RetryableSink {
    buffer: BytesMut,
    limit: Option<u64>,
    closed: bool,
}

impl RetryableSink {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            buffer: BytesMut::new(),
            limit,
            closed: false,
        }
    }

    /// Bytes buffered so far.
    pub fn content_length(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Mark the body complete, verifying any promised length.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(limit) = self.limit {
            if self.content_length() < limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "content-length promised {limit} bytes, but received {}",
                        self.content_length()
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl Write for RetryableSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "sink closed"));
        }
        if let Some(limit) = self.limit {
            if self.buffer.len() as u64 + buf.len() as u64 > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("exceeded content-length limit of {limit} bytes"),
                ));
            }
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A one-shot response body stream.
///
/// The body is readable at most once: either incrementally through the
/// [`Read`] impl or wholesale with [`bytes`](ResponseBody::bytes) /
/// [`string`](ResponseBody::string), which consume the value.
pub struct ResponseBody {
    content_type: Option<String>,
    content_length: Option<u64>,
    source: Box<dyn Read + Send>,
}

impl ResponseBody {
    pub fn new(
        content_type: Option<String>,
        content_length: Option<u64>,
        source: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            content_type,
            content_length,
            source,
        }
    }

    /// An empty body with zero length.
    pub fn empty() -> Self {
        Self::new(None, Some(0), Box::new(io::empty()))
    }

    /// A body backed by an in-memory buffer.
    pub fn from_bytes(content_type: Option<String>, content: Bytes) -> Self {
        let len = content.len() as u64;
        Self::new(content_type, Some(len), Box::new(BytesReader(content)))
    }

    /// The `Content-Type` of this body, if known.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Bytes this body will produce, or `None` if unknown.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Read the entire body. Fails if a declared `Content-Length`
    /// disagrees with the stream length.
    pub fn bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
        self.source.read_to_end(&mut buf)?;
        if let Some(expected) = self.content_length {
            if expected != buf.len() as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "content-length and stream length disagree",
                ));
            }
        }
        Ok(Bytes::from(buf))
    }

    /// Read the entire body as UTF-8 text.
    pub fn string(self) -> io::Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "body is not valid utf-8"))
    }

    pub(crate) fn into_source(self) -> Box<dyn Read + Send> {
        self.source
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish()
    }
}

struct BytesReader(Bytes);

impl Read for BytesReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.0.len().min(buf.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0 = self.0.slice(n..);
        Ok(n)
    }
}

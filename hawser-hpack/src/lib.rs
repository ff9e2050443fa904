//! Sans-IO HPACK header block codec (RFC 7541).
//!
//! This crate implements the header compression format used by HTTP/2
//! HEADERS and PUSH_PROMISE frames. It is a pure state machine -- the
//! caller hands the decoder complete header block fragments and drains
//! decoded fields, and hands the encoder a field list and receives wire
//! bytes. No IO, no framing.
//!
//! # Example
//!
//! ```rust
//! use hawser_hpack::{Decoder, Encoder, HeaderField};
//!
//! let mut encoder = Encoder::new();
//! let mut decoder = Decoder::new(4096);
//!
//! let headers = vec![
//!     HeaderField::new(b":method", b"GET"),
//!     HeaderField::new(b":path", b"/"),
//!     HeaderField::new(b"x-request-id", b"abc123"),
//! ];
//!
//! let mut block = Vec::new();
//! encoder.encode(&headers, &mut block);
//!
//! decoder.read_headers(&block).unwrap();
//! assert_eq!(decoder.take_header_list(), headers);
//! ```
//!
//! # Encoding strategy
//!
//! The encoder is deliberately conservative: every field is emitted as a
//! literal without indexing, referencing the static table by name where
//! possible. It never populates the dynamic table and never Huffman-codes
//! values, so a header block can be re-sent on a fresh connection without
//! shared compression state. The decoder implements the full instruction
//! set, including dynamic table inserts, size updates, and Huffman-coded
//! string literals from peers that use them.

mod codec;
mod huffman;

pub use codec::{Decoder, Encoder, HeaderField, STATIC_TABLE};
pub use huffman::decode as huffman_decode;

/// Errors produced while decoding an HPACK header block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    /// The block ended in the middle of an instruction or string literal.
    #[error("truncated header block")]
    Truncated,

    /// An indexed representation referenced index 0 or an index beyond
    /// both tables.
    #[error("invalid header index {0}")]
    InvalidIndex(u64),

    /// A dynamic table size update exceeded the SETTINGS-negotiated bound.
    #[error("dynamic table size update {got} exceeds setting {max}")]
    TableSizeUpdate { got: usize, max: usize },

    /// A received literal header name contained an uppercase ASCII letter.
    #[error("malformed header block: mixed-case name")]
    MixedCaseName,

    /// A Huffman-coded string literal did not decode to a whole number of
    /// symbols with valid EOS padding.
    #[error("invalid huffman-coded string literal")]
    InvalidHuffman,
}

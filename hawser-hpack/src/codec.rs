//! HPACK encoder and decoder (RFC 7541).
//!
//! The decoder maintains the dynamic table and a reusable header list;
//! the encoder is stateless by design (see crate docs).

use std::collections::VecDeque;

use crate::huffman;
use crate::HpackError;

/// A single header name-value pair.
///
/// Names and values are raw octets. HTTP/2 requires names to be lowercase
/// on the wire; the decoder enforces this for received literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size of this field for dynamic table accounting (RFC 7541 Section 4.1):
    /// len(name) + len(value) + 32.
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

// -- HPACK prefix integer codec (RFC 7541 Section 5.1) --

fn encode_prefix_int(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, pattern: u8) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
    } else {
        buf.push(pattern | max as u8);
        let mut remaining = value - max;
        while remaining >= 128 {
            buf.push(0x80 | (remaining & 0x7f) as u8);
            remaining >>= 7;
        }
        buf.push(remaining as u8);
    }
}

/// Decode a prefix integer. Returns the value and the number of bytes
/// consumed, or `None` if the input is truncated or the continuation
/// overflows 62 bits.
fn decode_prefix_int(buf: &[u8], prefix_bits: u8) -> Option<(u64, usize)> {
    if buf.is_empty() {
        return None;
    }
    let max = (1u64 << prefix_bits) - 1;
    let value = u64::from(buf[0]) & max;
    if value < max {
        return Some((value, 1));
    }
    let mut value = max;
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value += u64::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Some((value, i + 2));
        }
        if shift > 56 {
            return None;
        }
    }
    None
}

// -- Static table (RFC 7541 Appendix A) --

/// The 61-entry HPACK static table, indexed 1..=61 on the wire.
pub const STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),                   // 1
    (b":method", b"GET"),                   // 2
    (b":method", b"POST"),                  // 3
    (b":path", b"/"),                       // 4
    (b":path", b"/index.html"),             // 5
    (b":scheme", b"http"),                  // 6
    (b":scheme", b"https"),                 // 7
    (b":status", b"200"),                   // 8
    (b":status", b"204"),                   // 9
    (b":status", b"206"),                   // 10
    (b":status", b"304"),                   // 11
    (b":status", b"400"),                   // 12
    (b":status", b"404"),                   // 13
    (b":status", b"500"),                   // 14
    (b"accept-charset", b""),               // 15
    (b"accept-encoding", b"gzip, deflate"), // 16
    (b"accept-language", b""),              // 17
    (b"accept-ranges", b""),                // 18
    (b"accept", b""),                       // 19
    (b"access-control-allow-origin", b""),  // 20
    (b"age", b""),                          // 21
    (b"allow", b""),                        // 22
    (b"authorization", b""),                // 23
    (b"cache-control", b""),                // 24
    (b"content-disposition", b""),          // 25
    (b"content-encoding", b""),             // 26
    (b"content-language", b""),             // 27
    (b"content-length", b""),               // 28
    (b"content-location", b""),             // 29
    (b"content-range", b""),                // 30
    (b"content-type", b""),                 // 31
    (b"cookie", b""),                       // 32
    (b"date", b""),                         // 33
    (b"etag", b""),                         // 34
    (b"expect", b""),                       // 35
    (b"expires", b""),                      // 36
    (b"from", b""),                         // 37
    (b"host", b""),                         // 38
    (b"if-match", b""),                     // 39
    (b"if-modified-since", b""),            // 40
    (b"if-none-match", b""),                // 41
    (b"if-range", b""),                     // 42
    (b"if-unmodified-since", b""),          // 43
    (b"last-modified", b""),                // 44
    (b"link", b""),                         // 45
    (b"location", b""),                     // 46
    (b"max-forwards", b""),                 // 47
    (b"proxy-authenticate", b""),           // 48
    (b"proxy-authorization", b""),          // 49
    (b"range", b""),                        // 50
    (b"referer", b""),                      // 51
    (b"refresh", b""),                      // 52
    (b"retry-after", b""),                  // 53
    (b"server", b""),                       // 54
    (b"set-cookie", b""),                   // 55
    (b"strict-transport-security", b""),    // 56
    (b"transfer-encoding", b""),            // 57
    (b"user-agent", b""),                   // 58
    (b"vary", b""),                         // 59
    (b"via", b""),                          // 60
    (b"www-authenticate", b""),             // 61
];

/// Find the first static table entry whose name matches.
/// Returns the 1-based wire index.
fn find_static_name(name: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, _)| *n == name)
        .map(|i| i + 1)
}

// -- Dynamic table --

/// HPACK dynamic table (RFC 7541 Section 2.3.2).
///
/// Entries are stored newest-first: position 0 of the deque is wire index
/// 62 (one past the static table).
struct DynamicTable {
    entries: VecDeque<HeaderField>,
    byte_count: usize,
    max_byte_count: usize,
}

impl DynamicTable {
    fn new(max_byte_count: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            byte_count: 0,
            max_byte_count,
        }
    }

    /// Entry by 0-based dynamic table position (0 = newest).
    fn get(&self, position: usize) -> Option<&HeaderField> {
        self.entries.get(position)
    }

    /// Insert a new entry, evicting from the oldest end until it fits
    /// (RFC 7541 Section 4.4). An entry larger than the entire table
    /// clears the table and is dropped.
    fn insert(&mut self, field: HeaderField) {
        let entry_size = field.size();
        if entry_size > self.max_byte_count {
            self.entries.clear();
            self.byte_count = 0;
            return;
        }
        while self.byte_count + entry_size > self.max_byte_count {
            if let Some(evicted) = self.entries.pop_back() {
                self.byte_count -= evicted.size();
            }
        }
        self.entries.push_front(field);
        self.byte_count += entry_size;
    }

    /// Lower the size bound, evicting oldest entries as needed.
    fn set_max_byte_count(&mut self, max_byte_count: usize) {
        self.max_byte_count = max_byte_count;
        while self.byte_count > self.max_byte_count {
            if let Some(evicted) = self.entries.pop_back() {
                self.byte_count -= evicted.size();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// -- String literals --

/// Emit a string literal without Huffman coding: 7-bit length prefix with
/// a clear H bit, then the raw octets.
fn encode_string_literal(buf: &mut Vec<u8>, data: &[u8]) {
    encode_prefix_int(buf, data.len() as u64, 7, 0x00);
    buf.extend_from_slice(data);
}

/// Decode a string literal (raw or Huffman-coded). Returns the octets and
/// the total bytes consumed.
fn decode_string_literal(buf: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    if buf.is_empty() {
        return Err(HpackError::Truncated);
    }
    let huffman_coded = buf[0] & 0x80 != 0;
    let (len, n) = decode_prefix_int(buf, 7).ok_or(HpackError::Truncated)?;
    let len = len as usize;
    let total = n.checked_add(len).ok_or(HpackError::Truncated)?;
    if buf.len() < total {
        return Err(HpackError::Truncated);
    }
    let data = &buf[n..total];
    let octets = if huffman_coded {
        huffman::decode(data)?
    } else {
        data.to_vec()
    };
    Ok((octets, total))
}

/// A received header name must not contain uppercase ASCII
/// (RFC 7540 Section 8.1.2).
fn check_lowercase(name: &[u8]) -> Result<(), HpackError> {
    if name.iter().any(|b| b.is_ascii_uppercase()) {
        return Err(HpackError::MixedCaseName);
    }
    Ok(())
}

// -- Encoder --

/// HPACK header block encoder.
///
/// Emits every field as a literal without indexing, using a static table
/// name reference when one exists. Never writes dynamic table state, so
/// encoded blocks carry no cross-request compression context.
#[derive(Debug, Default)]
pub struct Encoder {
    _private: (),
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a header list into `buf`. Names are lowercased on emission.
    pub fn encode(&mut self, headers: &[HeaderField], buf: &mut Vec<u8>) {
        for header in headers {
            let name = header.name.to_ascii_lowercase();
            if let Some(index) = find_static_name(&name) {
                // Literal without indexing, indexed name
                // (RFC 7541 Section 6.2.2): pattern 0000xxxx, 4-bit prefix.
                encode_prefix_int(buf, index as u64, 4, 0x00);
            } else {
                // Literal without indexing, new name: 0x00 then the name.
                buf.push(0x00);
                encode_string_literal(buf, &name);
            }
            encode_string_literal(buf, &header.value);
        }
    }
}

// -- Decoder --

/// HPACK header block decoder.
///
/// Decoded fields accumulate in an internal list across `read_headers`
/// calls (a header block may span several HEADERS/CONTINUATION payloads)
/// and are drained with [`take_header_list`](Decoder::take_header_list).
pub struct Decoder {
    dynamic_table: DynamicTable,
    /// Bound negotiated via SETTINGS_HEADER_TABLE_SIZE. Size update
    /// instructions may lower the effective max below this but never
    /// raise it above.
    header_table_size_setting: usize,
    header_list: Vec<HeaderField>,
}

impl Decoder {
    pub fn new(header_table_size_setting: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(header_table_size_setting),
            header_table_size_setting,
            header_list: Vec::new(),
        }
    }

    /// Apply a new SETTINGS_HEADER_TABLE_SIZE from the peer's settings
    /// frame. Evicts entries if the bound shrank.
    pub fn set_header_table_size(&mut self, setting: usize) {
        self.header_table_size_setting = setting;
        self.dynamic_table.set_max_byte_count(setting);
    }

    /// Total bytes currently accounted to the dynamic table.
    pub fn dynamic_table_byte_count(&self) -> usize {
        self.dynamic_table.byte_count
    }

    /// Number of entries currently in the dynamic table.
    pub fn dynamic_table_len(&self) -> usize {
        self.dynamic_table.len()
    }

    /// Decode one header block fragment, appending fields to the internal
    /// list.
    pub fn read_headers(&mut self, buf: &[u8]) -> Result<(), HpackError> {
        let mut pos = 0;

        while pos < buf.len() {
            let first = buf[pos];

            if first & 0x80 != 0 {
                // Indexed header field (Section 6.1): 1xxxxxxx.
                let (index, n) =
                    decode_prefix_int(&buf[pos..], 7).ok_or(HpackError::Truncated)?;
                pos += n;
                let field = self.get_indexed(index)?;
                self.header_list.push(field);
            } else if first & 0x40 != 0 {
                // Literal with incremental indexing (Section 6.2.1): 01xxxxxx.
                let (name_index, n) =
                    decode_prefix_int(&buf[pos..], 6).ok_or(HpackError::Truncated)?;
                pos += n;
                let name = if name_index > 0 {
                    self.get_name(name_index)?
                } else {
                    let (name, consumed) = decode_string_literal(&buf[pos..])?;
                    pos += consumed;
                    check_lowercase(&name)?;
                    name
                };
                let (value, consumed) = decode_string_literal(&buf[pos..])?;
                pos += consumed;
                let field = HeaderField { name, value };
                self.dynamic_table.insert(field.clone());
                self.header_list.push(field);
            } else if first & 0x20 != 0 {
                // Dynamic table size update (Section 6.3): 001xxxxx.
                let (new_max, n) =
                    decode_prefix_int(&buf[pos..], 5).ok_or(HpackError::Truncated)?;
                pos += n;
                let new_max = new_max as usize;
                if new_max > self.header_table_size_setting {
                    return Err(HpackError::TableSizeUpdate {
                        got: new_max,
                        max: self.header_table_size_setting,
                    });
                }
                self.dynamic_table.set_max_byte_count(new_max);
            } else {
                // Literal without indexing (Section 6.2.2) or never indexed
                // (Section 6.2.3): 000?xxxx. The never-indexed bit is not
                // propagated.
                let (name_index, n) =
                    decode_prefix_int(&buf[pos..], 4).ok_or(HpackError::Truncated)?;
                pos += n;
                let name = if name_index > 0 {
                    self.get_name(name_index)?
                } else {
                    let (name, consumed) = decode_string_literal(&buf[pos..])?;
                    pos += consumed;
                    check_lowercase(&name)?;
                    name
                };
                let (value, consumed) = decode_string_literal(&buf[pos..])?;
                pos += consumed;
                self.header_list.push(HeaderField { name, value });
            }
        }

        Ok(())
    }

    /// Drain the accumulated header list, leaving the decoder ready for
    /// the next block.
    pub fn take_header_list(&mut self) -> Vec<HeaderField> {
        std::mem::take(&mut self.header_list)
    }

    /// Resolve a full indexed field. Index 0 is a protocol error.
    fn get_indexed(&self, index: u64) -> Result<HeaderField, HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex(0));
        }
        let index = index as usize;
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok(HeaderField::new(name, value));
        }
        self.dynamic_table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(HpackError::InvalidIndex(index as u64))
    }

    /// Resolve only the name of an indexed entry.
    fn get_name(&self, index: u64) -> Result<Vec<u8>, HpackError> {
        self.get_indexed(index).map(|field| field.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField::new(name.as_bytes(), value.as_bytes())
    }

    fn decode_all(decoder: &mut Decoder, block: &[u8]) -> Vec<HeaderField> {
        decoder.read_headers(block).unwrap();
        decoder.take_header_list()
    }

    #[test]
    fn static_table_has_61_entries() {
        assert_eq!(STATIC_TABLE.len(), 61);
        assert_eq!(STATIC_TABLE[1], (b":method".as_slice(), b"GET".as_slice()));
        assert_eq!(
            STATIC_TABLE[60],
            (b"www-authenticate".as_slice(), b"".as_slice())
        );
    }

    #[test]
    fn rfc7541_c1_integer_examples() {
        // C.1.1: 10 with a 5-bit prefix.
        let mut buf = Vec::new();
        encode_prefix_int(&mut buf, 10, 5, 0x00);
        assert_eq!(buf, [0x0a]);
        assert_eq!(decode_prefix_int(&buf, 5), Some((10, 1)));

        // C.1.2: 1337 with a 5-bit prefix.
        let mut buf = Vec::new();
        encode_prefix_int(&mut buf, 1337, 5, 0x00);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_prefix_int(&buf, 5), Some((1337, 3)));

        // C.1.3: 42 at an octet boundary.
        let mut buf = Vec::new();
        encode_prefix_int(&mut buf, 42, 8, 0x00);
        assert_eq!(buf, [0x2a]);
        assert_eq!(decode_prefix_int(&buf, 8), Some((42, 1)));
    }

    #[test]
    fn prefix_int_round_trip() {
        for &(value, prefix_bits) in &[
            (0u64, 7u8),
            (126, 7),
            (127, 7),
            (128, 7),
            (1000, 7),
            (62, 6),
            (63, 6),
            (64, 6),
            (31, 5),
            (32, 5),
            (4096, 5),
            (15, 4),
            (16, 4),
        ] {
            let mut buf = Vec::new();
            encode_prefix_int(&mut buf, value, prefix_bits, 0x00);
            let (decoded, len) = decode_prefix_int(&buf, prefix_bits).unwrap();
            assert_eq!(decoded, value, "value={value} prefix={prefix_bits}");
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn decode_indexed_static_entry() {
        // 0x82 is the indexed representation of static entry 2.
        let mut decoder = Decoder::new(4096);
        let headers = decode_all(&mut decoder, &[0x82]);
        assert_eq!(headers, vec![field(":method", "GET")]);
        assert_eq!(decoder.dynamic_table_len(), 0);
        assert_eq!(decoder.dynamic_table_byte_count(), 0);
    }

    #[test]
    fn decode_index_zero_is_error() {
        let mut decoder = Decoder::new(4096);
        assert_eq!(
            decoder.read_headers(&[0x80]),
            Err(HpackError::InvalidIndex(0))
        );
    }

    #[test]
    fn decode_index_beyond_tables_is_error() {
        let mut decoder = Decoder::new(4096);
        // Index 62 with an empty dynamic table.
        assert_eq!(
            decoder.read_headers(&[0xbe]),
            Err(HpackError::InvalidIndex(62))
        );
    }

    #[test]
    fn rfc7541_c2_1_literal_with_indexing() {
        // custom-key: custom-header, incremental indexing, new name.
        let block = [
            0x40, 0x0a, b'c', b'u', b's', b't', b'o', b'm', b'-', b'k', b'e', b'y', 0x0d, b'c',
            b'u', b's', b't', b'o', b'm', b'-', b'h', b'e', b'a', b'd', b'e', b'r',
        ];
        let mut decoder = Decoder::new(4096);
        let headers = decode_all(&mut decoder, &block);
        assert_eq!(headers, vec![field("custom-key", "custom-header")]);
        assert_eq!(decoder.dynamic_table_len(), 1);
        assert_eq!(decoder.dynamic_table_byte_count(), 55);
    }

    #[test]
    fn rfc7541_c3_request_examples_without_huffman() {
        let mut decoder = Decoder::new(4096);

        // C.3.1: first request.
        let block1 = [
            0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', b'.', b'c', b'o', b'm',
        ];
        let headers = decode_all(&mut decoder, &block1);
        assert_eq!(
            headers,
            vec![
                field(":method", "GET"),
                field(":scheme", "http"),
                field(":path", "/"),
                field(":authority", "www.example.com"),
            ]
        );
        assert_eq!(decoder.dynamic_table_byte_count(), 57);

        // C.3.2: second request reuses the dynamic entry at index 62.
        let block2 = [
            0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, b'n', b'o', b'-', b'c', b'a', b'c', b'h', b'e',
        ];
        let headers = decode_all(&mut decoder, &block2);
        assert_eq!(
            headers,
            vec![
                field(":method", "GET"),
                field(":scheme", "http"),
                field(":path", "/"),
                field(":authority", "www.example.com"),
                field("cache-control", "no-cache"),
            ]
        );
        assert_eq!(decoder.dynamic_table_len(), 2);
        assert_eq!(decoder.dynamic_table_byte_count(), 110);
    }

    #[test]
    fn rfc7541_c4_request_examples_with_huffman() {
        let mut decoder = Decoder::new(4096);

        // C.4.1: :authority value is Huffman-coded "www.example.com".
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let headers = decode_all(&mut decoder, &block);
        assert_eq!(headers[3], field(":authority", "www.example.com"));
        assert_eq!(decoder.dynamic_table_byte_count(), 57);

        // C.4.2: Huffman-coded "no-cache".
        let block = [0x82, 0x86, 0x84, 0xbe, 0x58, 0x86, 0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf];
        let headers = decode_all(&mut decoder, &block);
        assert_eq!(headers[4], field("cache-control", "no-cache"));
    }

    #[test]
    fn dynamic_table_size_update_within_setting() {
        let mut decoder = Decoder::new(4096);
        decoder.read_headers(&[0x3f, 0xe1, 0x01]).unwrap(); // update to 256
        assert!(decoder.take_header_list().is_empty());
    }

    #[test]
    fn dynamic_table_size_update_above_setting_is_error() {
        let mut decoder = Decoder::new(128);
        // Update to 256 against a 128-byte setting.
        assert_eq!(
            decoder.read_headers(&[0x3f, 0xe1, 0x01]),
            Err(HpackError::TableSizeUpdate { got: 256, max: 128 })
        );
    }

    #[test]
    fn size_update_evicts_existing_entries() {
        let mut decoder = Decoder::new(4096);
        let mut block = vec![0x40];
        encode_string_literal(&mut block, b"custom-key");
        encode_string_literal(&mut block, b"custom-header");
        decoder.read_headers(&block).unwrap();
        assert_eq!(decoder.dynamic_table_len(), 1);

        // Shrink the table to zero; the entry must be evicted.
        decoder.read_headers(&[0x20]).unwrap();
        assert_eq!(decoder.dynamic_table_len(), 0);
        assert_eq!(decoder.dynamic_table_byte_count(), 0);
    }

    #[test]
    fn oversized_entry_clears_table_and_is_dropped() {
        let mut decoder = Decoder::new(64);
        let mut block = vec![0x40];
        encode_string_literal(&mut block, b"a");
        encode_string_literal(&mut block, b"b");
        decoder.read_headers(&block).unwrap();
        assert_eq!(decoder.dynamic_table_len(), 1);

        // 34 + 64 + 32 > 64: too large to ever fit.
        let mut block = vec![0x40];
        encode_string_literal(&mut block, &vec![b'x'; 34]);
        encode_string_literal(&mut block, &vec![b'y'; 64]);
        decoder.read_headers(&block).unwrap();
        assert_eq!(decoder.dynamic_table_len(), 0);
        assert_eq!(decoder.dynamic_table_byte_count(), 0);
        // The field itself is still emitted to the caller.
        assert_eq!(decoder.take_header_list().len(), 2);
    }

    #[test]
    fn eviction_keeps_byte_count_within_bound() {
        let max = 128;
        let mut decoder = Decoder::new(max);
        for i in 0..32 {
            let mut block = vec![0x40];
            encode_string_literal(&mut block, format!("name-{i}").as_bytes());
            encode_string_literal(&mut block, format!("value-{i}").as_bytes());
            decoder.read_headers(&block).unwrap();
            assert!(decoder.dynamic_table_byte_count() <= max);
        }
    }

    #[test]
    fn uppercase_literal_name_is_error() {
        let mut block = vec![0x40];
        encode_string_literal(&mut block, b"Bad-Name");
        encode_string_literal(&mut block, b"v");
        let mut decoder = Decoder::new(4096);
        assert_eq!(decoder.read_headers(&block), Err(HpackError::MixedCaseName));
    }

    #[test]
    fn truncated_block_is_error() {
        let mut decoder = Decoder::new(4096);
        // Length prefix promises 10 bytes, only 3 present.
        assert_eq!(
            decoder.read_headers(&[0x40, 0x0a, b'a', b'b', b'c']),
            Err(HpackError::Truncated)
        );
    }

    #[test]
    fn encoder_uses_static_name_reference() {
        let mut encoder = Encoder::new();
        let mut buf = Vec::new();
        encoder.encode(&[field(":method", "GET")], &mut buf);
        // Static index 2 with a 4-bit prefix, then the raw value.
        assert_eq!(buf, [0x02, 0x03, b'G', b'E', b'T']);
    }

    #[test]
    fn encoder_emits_new_name_literal() {
        let mut encoder = Encoder::new();
        let mut buf = Vec::new();
        encoder.encode(&[field("custom-key", "custom-header")], &mut buf);
        let mut expected = vec![0x00];
        encode_string_literal(&mut expected, b"custom-key");
        encode_string_literal(&mut expected, b"custom-header");
        assert_eq!(buf, expected);
    }

    #[test]
    fn encoder_lowercases_names() {
        let mut encoder = Encoder::new();
        let mut buf = Vec::new();
        encoder.encode(&[field("Content-Type", "text/plain")], &mut buf);
        let mut decoder = Decoder::new(4096);
        let headers = decode_all(&mut decoder, &buf);
        assert_eq!(headers, vec![field("content-type", "text/plain")]);
    }

    #[test]
    fn encoder_never_touches_dynamic_table() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(4096);
        let headers = vec![field("x-token", "abc"), field("x-token", "abc")];
        let mut buf = Vec::new();
        encoder.encode(&headers, &mut buf);
        assert_eq!(decode_all(&mut decoder, &buf), headers);
        assert_eq!(decoder.dynamic_table_len(), 0);
    }

    #[test]
    fn round_trip_mixed_headers() {
        let headers = vec![
            field(":method", "GET"),
            field(":path", "/search?q=rust"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field("accept", "*/*"),
            field("x-request-id", "abc123"),
            field("cookie", "a=b; c=d"),
        ];
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(4096);
        let mut buf = Vec::new();
        encoder.encode(&headers, &mut buf);
        assert_eq!(decode_all(&mut decoder, &buf), headers);
    }

    #[test]
    fn take_header_list_resets_accumulator() {
        let mut decoder = Decoder::new(4096);
        decoder.read_headers(&[0x82]).unwrap();
        assert_eq!(decoder.take_header_list().len(), 1);
        assert!(decoder.take_header_list().is_empty());
    }
}

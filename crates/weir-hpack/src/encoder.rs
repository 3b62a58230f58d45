//! Encoding of header lists into HPACK header blocks.
//!
//! The encoder picks a representation per field: fully indexed if the table
//! has an exact match, otherwise a literal, added to the dynamic table unless
//! the field is sensitive or not worth remembering. String literals are
//! Huffman-coded whenever that is shorter.

use tracing::trace;

use crate::{huffman, DynamicTable, HeaderTable, TableMatch, DEFAULT_TABLE_SIZE};

/// Encodes `value` with an N-bit prefix (RFC 7541, section 5.1). `flags`
/// holds the bits above the prefix in the first octet.
pub fn encode_integer(mut value: usize, prefix_size: u8, flags: u8, dst: &mut Vec<u8>) {
    let mask = if prefix_size >= 8 {
        0xff
    } else {
        (1usize << prefix_size) - 1
    };

    if value < mask {
        dst.push(flags | value as u8);
        return;
    }

    dst.push(flags | mask as u8);
    value -= mask;
    while value >= 0x80 {
        dst.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Encodes a string literal. The Huffman flag is the bit just above the
/// length prefix, `flags` holds anything above that.
pub fn encode_string(value: &[u8], prefix_size: u8, flags: u8, dst: &mut Vec<u8>) {
    let huffman_len = huffman::encoded_len(value);
    if huffman_len < value.len() {
        encode_integer(huffman_len, prefix_size, flags | (1 << prefix_size), dst);
        huffman::encode_into(value, dst);
    } else {
        encode_integer(value.len(), prefix_size, flags, dst);
        dst.extend_from_slice(value);
    }
}

/// How a literal field relates to the dynamic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Indexing {
    Incremental,
    Without,
    Never,
}

impl Indexing {
    fn for_field(name: &[u8], value: &[u8]) -> Self {
        match name {
            b"authorization" | b"proxy-authorization" | b"set-cookie" => Indexing::Never,
            // short cookies are easy to brute force through the table
            b"cookie" if value.len() < 20 => Indexing::Never,
            b":path" | b"content-length" | b"content-range" | b"date" | b"etag" | b"age"
            | b"expires" | b"if-modified-since" | b"if-none-match" | b"last-modified"
            | b"location" | b"range" => Indexing::Without,
            _ => Indexing::Incremental,
        }
    }

    fn prefix_and_flags(self) -> (u8, u8) {
        match self {
            Indexing::Incremental => (6, 0x40),
            Indexing::Without => (4, 0x00),
            Indexing::Never => (4, 0x10),
        }
    }
}

/// Encodes header lists, maintaining a dynamic table that mirrors the one in
/// the peer's decoder.
#[derive(Debug)]
pub struct Encoder {
    header_table: HeaderTable,

    /// Size updates to announce at the start of the next block: the smallest
    /// size requested since the last block, and the latest one.
    pending_size_update: Option<(usize, usize)>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            header_table: HeaderTable::with_max_size(DEFAULT_TABLE_SIZE),
            pending_size_update: None,
        }
    }

    /// Changes the dynamic table size, typically because the peer sent
    /// SETTINGS_HEADER_TABLE_SIZE. The change is signalled at the start of
    /// the next header block.
    pub fn set_max_table_size(&mut self, size: usize) {
        let (min, _) = self.pending_size_update.unwrap_or((size, size));
        self.pending_size_update = Some((min.min(size), size));
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.header_table.dynamic_table
    }

    /// Encodes one header block onto the end of `dst`.
    pub fn encode_into<'a, I>(&mut self, headers: I, dst: &mut Vec<u8>)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        if let Some((min, last)) = self.pending_size_update.take() {
            if min < last {
                self.emit_size_update(min, dst);
            }
            self.emit_size_update(last, dst);
        }

        for (name, value) in headers {
            self.encode_field(name, value, dst);
        }
    }

    /// Encodes one header block into a new buffer.
    pub fn encode<'a, I>(&mut self, headers: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let mut dst = Vec::new();
        self.encode_into(headers, &mut dst);
        dst
    }

    fn emit_size_update(&mut self, size: usize, dst: &mut Vec<u8>) {
        trace!(%size, "emitting dynamic table size update");
        encode_integer(size, 5, 0x20, dst);
        self.header_table.dynamic_table.set_max_size(size);
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut Vec<u8>) {
        let indexing = Indexing::for_field(name, value);
        let found = self.header_table.find_header(name, value);

        let name_index = match found {
            Some(TableMatch::Full(index)) if indexing != Indexing::Never => {
                encode_integer(index, 7, 0x80, dst);
                return;
            }
            Some(TableMatch::Full(index)) | Some(TableMatch::Name(index)) => Some(index),
            None => None,
        };

        let (prefix, flags) = indexing.prefix_and_flags();
        match name_index {
            Some(index) => encode_integer(index, prefix, flags, dst),
            None => {
                encode_integer(0, prefix, flags, dst);
                encode_string(name, 7, 0, dst);
            }
        }
        encode_string(value, 7, 0, dst);

        if indexing == Indexing::Incremental {
            self.header_table.add_header(name.to_vec(), value.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Decoder;
    use pretty_assertions::assert_eq;

    fn fields<'a>(list: &'a [(&'a str, &'a str)]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> {
        list.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))
    }

    #[test]
    fn test_encode_integer() {
        let mut dst = Vec::new();
        encode_integer(10, 5, 0, &mut dst);
        assert_eq!(dst, [10]);

        // RFC 7541, C.1.2
        dst.clear();
        encode_integer(1337, 5, 0, &mut dst);
        assert_eq!(dst, [31, 154, 10]);

        // RFC 7541, C.1.3
        dst.clear();
        encode_integer(42, 8, 0, &mut dst);
        assert_eq!(dst, [42]);

        dst.clear();
        encode_integer(31, 5, 0x20, &mut dst);
        assert_eq!(dst, [0x3f, 0x00]);
    }

    #[test]
    fn test_first_request_matches_rfc() {
        // RFC 7541, C.4.1
        let mut encoder = Encoder::new();
        let block = encoder.encode(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":authority", "www.example.com"),
        ]));
        assert_eq!(
            block,
            [
                0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0,
                0xab, 0x90, 0xf4, 0xff,
            ]
        );
        assert_eq!(encoder.dynamic_table().size(), 57);
    }

    #[test]
    fn test_tables_stay_in_sync() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        let blocks: &[&[(&str, &str)]] = &[
            &[
                (":method", "POST"),
                (":scheme", "https"),
                (":path", "/upload?id=42"),
                (":authority", "example.org"),
                ("content-type", "application/json"),
                ("authorization", "Bearer hunter2"),
            ],
            &[
                (":method", "POST"),
                (":scheme", "https"),
                (":path", "/upload?id=43"),
                (":authority", "example.org"),
                ("content-type", "application/json"),
                ("x-request-id", "0b2c6d1e"),
            ],
            &[(":status", "200"), ("x-request-id", "0b2c6d1e"), ("cookie", "a=b")],
        ];

        for &block in blocks {
            let encoded = encoder.encode(fields(block));
            let decoded = decoder.decode(&encoded).unwrap();
            let expected: Vec<_> = fields(block)
                .map(|(n, v)| (n.to_vec(), v.to_vec()))
                .collect();
            assert_eq!(decoded, expected);
            assert_eq!(encoder.dynamic_table().size(), decoder.dynamic_table().size());
            assert_eq!(encoder.dynamic_table().to_vec(), decoder.dynamic_table().to_vec());
        }

        // sensitive fields never enter the table
        assert!(encoder
            .dynamic_table()
            .iter()
            .all(|(n, _)| n != b"authorization" && n != b"cookie"));
    }

    #[test]
    fn test_size_update_is_announced() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        decoder
            .decode(&encoder.encode(fields(&[("x-a", "1"), ("x-b", "2")])))
            .unwrap();
        assert_eq!(decoder.dynamic_table().len(), 2);

        encoder.set_max_table_size(0);
        encoder.set_max_table_size(64);
        let block = encoder.encode(fields(&[("x-c", "3")]));
        // 0 first, then 64
        assert_eq!(&block[..3], &[0x20, 0x3f, 0x21]);

        decoder.decode(&block).unwrap();
        assert_eq!(decoder.dynamic_table().max_size(), 64);
        assert_eq!(decoder.dynamic_table().to_vec(), encoder.dynamic_table().to_vec());
        assert_eq!(decoder.dynamic_table().len(), 1);
    }
}

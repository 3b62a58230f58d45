//! Decoding of HPACK header blocks into name/value pairs.
//!
//! The decoder only follows HPACK rules: names and values are opaque octets,
//! semantic checks belong to whoever consumes the callback.
//!
//! ```rust
//! use weir_hpack::Decoder;
//! let mut decoder = Decoder::new();
//!
//! let header_list = decoder.decode(&[0x82, 0x84]).unwrap();
//!
//! assert_eq!(header_list, [
//!     (b":method".to_vec(), b"GET".to_vec()),
//!     (b":path".to_vec(), b"/".to_vec()),
//! ]);
//! ```

use std::borrow::Cow;

use tracing::trace;

use crate::huffman::{HuffmanDecoder, HuffmanDecoderError};
use crate::{DynamicTable, HeaderTable, DEFAULT_TABLE_SIZE};

/// Integers never take more than this many octets, which keeps every decoded
/// value well within `u32`.
const INTEGER_OCTET_LIMIT: usize = 5;

/// Decodes an integer encoded with a given prefix size (in bits). The first
/// octet of `buf` holds the prefix.
///
/// Returns the decoded integer and the number of octets consumed.
pub fn decode_integer(buf: &[u8], prefix_size: u8) -> Result<(usize, usize), DecoderError> {
    if !(1..=8).contains(&prefix_size) {
        return Err(IntegerDecodingError::InvalidPrefix.into());
    }
    let Some(&first) = buf.first() else {
        return Err(IntegerDecodingError::NotEnoughOctets.into());
    };

    let mask = if prefix_size == 8 {
        0xff
    } else {
        (1u8 << prefix_size) - 1
    };
    let mut value = (first & mask) as usize;
    if value < mask as usize {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        let consumed = i + 2;
        if consumed > INTEGER_OCTET_LIMIT {
            return Err(IntegerDecodingError::TooManyOctets.into());
        }

        value = ((b & 0x7f) as usize)
            .checked_shl(shift)
            .and_then(|v| value.checked_add(v))
            .ok_or(IntegerDecodingError::ValueTooLarge)?;
        shift += 7;

        if b & 0x80 == 0 {
            return Ok((value, consumed));
        }
    }

    Err(IntegerDecodingError::NotEnoughOctets.into())
}

/// Decodes an octet string (length-prefixed, optionally Huffman-coded) at the
/// start of `buf`. `prefix_size` is 7 for HPACK; QPACK packs a few extra bits
/// into the first octet and uses smaller prefixes.
///
/// Returns the string and the number of octets consumed.
pub fn decode_string(buf: &[u8], prefix_size: u8) -> Result<(Cow<'_, [u8]>, usize), DecoderError> {
    let huffman_bit = 1u8 << prefix_size;
    let (len, consumed) = decode_integer(buf, prefix_size)?;
    trace!(%consumed, %len, "decode_string");

    let end = consumed
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or(StringDecodingError::NotEnoughOctets)?;
    let raw = &buf[consumed..end];

    if buf[0] & huffman_bit == huffman_bit {
        let decoded = HuffmanDecoder::new()
            .decode(raw)
            .map_err(StringDecodingError::HuffmanDecoderError)?;
        Ok((Cow::Owned(decoded), end))
    } else {
        Ok((Cow::Borrowed(raw), end))
    }
}

/// The ways a field line can be represented in a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRepresentation {
    Indexed,
    LiteralWithIncrementalIndexing,
    SizeUpdate,
    LiteralNeverIndexed,
    LiteralWithoutIndexing,
}

impl FieldRepresentation {
    fn new(octet: u8) -> FieldRepresentation {
        if octet & 0x80 != 0 {
            FieldRepresentation::Indexed
        } else if octet & 0x40 != 0 {
            FieldRepresentation::LiteralWithIncrementalIndexing
        } else if octet & 0x20 != 0 {
            FieldRepresentation::SizeUpdate
        } else if octet & 0x10 != 0 {
            FieldRepresentation::LiteralNeverIndexed
        } else {
            FieldRepresentation::LiteralWithoutIndexing
        }
    }
}

#[derive(PartialEq, Eq, Copy, Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IntegerDecodingError {
    /// Integers that need more than 5 octets are refused (RFC 7541, section
    /// 5.1, "excessively large integer decodings").
    #[error("Too many octets in the integer encoding")]
    TooManyOctets,
    #[error("Integer value too large")]
    ValueTooLarge,
    #[error("Not enough octets in the buffer")]
    NotEnoughOctets,
    /// Only valid prefixes are [1, 8]
    #[error("Invalid prefix")]
    InvalidPrefix,
}

#[derive(PartialEq, Eq, Copy, Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StringDecodingError {
    #[error("Not enough octets in the buffer")]
    NotEnoughOctets,
    #[error("Huffman decoder error: {0}")]
    HuffmanDecoderError(HuffmanDecoderError),
}

/// Everything that can go wrong while decoding a header block. Any of these
/// means the decoder's dynamic table can no longer be trusted.
#[derive(PartialEq, Eq, Copy, Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecoderError {
    #[error("Header index out of bounds")]
    HeaderIndexOutOfBounds,
    #[error("Integer decoding error: {0}")]
    IntegerDecodingError(#[from] IntegerDecodingError),
    #[error("String decoding error: {0}")]
    StringDecodingError(#[from] StringDecodingError),
    /// A dynamic table size update asked for more than we allowed through
    /// SETTINGS_HEADER_TABLE_SIZE.
    #[error("Dynamic table size update to {requested} exceeds the allowed maximum of {allowed}")]
    InvalidMaxDynamicSize { requested: usize, allowed: usize },
    /// Dynamic table size updates must come before the first field line of a
    /// header block (RFC 7541, section 4.2).
    #[error("Dynamic table size update after a field line")]
    SizeUpdateNotAtStart,
    /// We lowered the allowed table size and the peer's next block did not
    /// acknowledge it with a size update.
    #[error("Missing dynamic table size update")]
    SizeUpdateRequired,
}

/// Either the decoder failed, or the callback asked to stop.
#[derive(Debug)]
pub enum DecoderOrCallbackError<E> {
    DecoderError(DecoderError),
    CallbackError(E),
}

impl<E> From<DecoderError> for DecoderOrCallbackError<E> {
    fn from(err: DecoderError) -> Self {
        Self::DecoderError(err)
    }
}

/// Decodes header blocks, keeping the dynamic table in sync with the peer's
/// encoder across blocks.
///
/// Blocks must be decoded in the order they were received, whole: in
/// HTTP/2, CONTINUATION fragments are concatenated first.
#[derive(Debug)]
pub struct Decoder {
    header_table: HeaderTable,
    max_allowed_table_size: usize,
    /// Set when the allowed size dropped below the table's current size, the
    /// next block must then start with a size update.
    size_update_required: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

type Field<'a> = (Cow<'a, [u8]>, Cow<'a, [u8]>);

impl Decoder {
    pub fn new() -> Self {
        Self {
            header_table: HeaderTable::with_max_size(DEFAULT_TABLE_SIZE),
            max_allowed_table_size: DEFAULT_TABLE_SIZE,
            size_update_required: false,
        }
    }

    /// Sets the upper bound for dynamic table size updates, which is the
    /// SETTINGS_HEADER_TABLE_SIZE we advertised, once the peer acknowledged
    /// it. Going below the table's current size means the peer's next block
    /// has to start with a size update (RFC 7541, section 4.2).
    pub fn set_max_allowed_table_size(&mut self, max_allowed_size: usize) {
        self.max_allowed_table_size = max_allowed_size;
        if self.header_table.dynamic_table.max_size() > max_allowed_size {
            self.header_table.dynamic_table.set_max_size(max_allowed_size);
            self.size_update_required = true;
        }
    }

    pub fn max_allowed_table_size(&self) -> usize {
        self.max_allowed_table_size
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.header_table.dynamic_table
    }

    /// Decodes the block in `buf`, handing each field to `cb` in order.
    ///
    /// The `Cow`s may borrow from the header table, so they only live as long
    /// as the callback invocation. If `cb` returns an error, decoding stops
    /// and the error is handed back; the table is left as it was at that
    /// point.
    pub fn decode_with_cb<E>(
        &mut self,
        buf: &[u8],
        mut cb: impl FnMut(Cow<[u8]>, Cow<[u8]>) -> Result<(), E>,
    ) -> Result<(), DecoderOrCallbackError<E>> {
        let mut pos = 0;
        let mut seen_field = false;

        if self.size_update_required {
            let first = buf.first().map(|&octet| FieldRepresentation::new(octet));
            if first != Some(FieldRepresentation::SizeUpdate) {
                return Err(DecoderError::SizeUpdateRequired.into());
            }
            self.size_update_required = false;
        }

        while pos < buf.len() {
            let rest = &buf[pos..];
            let repr = FieldRepresentation::new(rest[0]);

            let consumed = match repr {
                FieldRepresentation::SizeUpdate => {
                    if seen_field {
                        return Err(DecoderError::SizeUpdateNotAtStart.into());
                    }
                    self.update_max_dynamic_size(rest)?
                }
                FieldRepresentation::Indexed => {
                    seen_field = true;
                    let (index, consumed) = decode_integer(rest, 7)?;
                    let (name, value) = self.get_from_table(index)?;
                    cb(Cow::Borrowed(name), Cow::Borrowed(value))
                        .map_err(DecoderOrCallbackError::CallbackError)?;
                    consumed
                }
                FieldRepresentation::LiteralWithIncrementalIndexing => {
                    seen_field = true;
                    let ((name, value), consumed) = self.decode_literal(rest, 6)?;
                    let (name, value) = (name.into_owned(), value.into_owned());
                    cb(Cow::Borrowed(&name), Cow::Borrowed(&value))
                        .map_err(DecoderOrCallbackError::CallbackError)?;
                    self.header_table.add_header(name, value);
                    consumed
                }
                FieldRepresentation::LiteralWithoutIndexing
                | FieldRepresentation::LiteralNeverIndexed => {
                    seen_field = true;
                    let ((name, value), consumed) = self.decode_literal(rest, 4)?;
                    cb(name, value).map_err(DecoderOrCallbackError::CallbackError)?;
                    consumed
                }
            };

            trace!(?repr, %consumed, "decoded field representation");
            pos += consumed;
        }

        Ok(())
    }

    /// Decodes a whole block into owned pairs.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DecoderError> {
        let mut fields = Vec::new();
        let res = self.decode_with_cb(buf, |n, v| {
            fields.push((n.into_owned(), v.into_owned()));
            Ok::<_, std::convert::Infallible>(())
        });
        match res {
            Ok(()) => Ok(fields),
            Err(DecoderOrCallbackError::DecoderError(e)) => Err(e),
            Err(DecoderOrCallbackError::CallbackError(never)) => match never {},
        }
    }

    fn get_from_table(&self, index: usize) -> Result<(&[u8], &[u8]), DecoderError> {
        self.header_table
            .get_from_table(index)
            .ok_or(DecoderError::HeaderIndexOutOfBounds)
    }

    fn decode_literal<'b>(
        &'b self,
        buf: &'b [u8],
        prefix: u8,
    ) -> Result<(Field<'b>, usize), DecoderError> {
        let (table_index, mut consumed) = decode_integer(buf, prefix)?;

        let name = if table_index == 0 {
            let (name, len) = decode_string(&buf[consumed..], 7)?;
            consumed += len;
            name
        } else {
            let (name, _) = self.get_from_table(table_index)?;
            Cow::Borrowed(name)
        };

        let (value, len) = decode_string(&buf[consumed..], 7)?;
        consumed += len;

        Ok(((name, value), consumed))
    }

    fn update_max_dynamic_size(&mut self, buf: &[u8]) -> Result<usize, DecoderError> {
        let (new_size, consumed) = decode_integer(buf, 5)?;
        if new_size > self.max_allowed_table_size {
            return Err(DecoderError::InvalidMaxDynamicSize {
                requested: new_size,
                allowed: self.max_allowed_table_size,
            });
        }

        trace!(
            old_size = %self.header_table.dynamic_table.max_size(),
            %new_size,
            "peer changed dynamic table size"
        );
        self.header_table.dynamic_table.set_max_size(new_size);

        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pairs(list: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        list.iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!((10, 1), decode_integer(&[10], 5).unwrap());
        // RFC 7541, C.1.2
        assert_eq!((1337, 3), decode_integer(&[31, 154, 10], 5).unwrap());
        // RFC 7541, C.1.3
        assert_eq!((42, 1), decode_integer(&[42], 8).unwrap());
        // trailing octets are not consumed
        assert_eq!((1337, 3), decode_integer(&[31 + 32, 154, 10, 0xff], 5).unwrap());
    }

    #[test]
    fn test_decode_integer_errors() {
        assert_eq!(
            decode_integer(&[], 5),
            Err(DecoderError::from(IntegerDecodingError::NotEnoughOctets))
        );
        assert_eq!(
            decode_integer(&[31, 154], 5),
            Err(DecoderError::from(IntegerDecodingError::NotEnoughOctets))
        );
        assert_eq!(
            decode_integer(&[31, 0xff, 0xff, 0xff, 0xff, 0x01], 5),
            Err(DecoderError::from(IntegerDecodingError::TooManyOctets))
        );
        assert_eq!(
            decode_integer(&[10], 0),
            Err(DecoderError::from(IntegerDecodingError::InvalidPrefix))
        );
    }

    #[test]
    fn test_decode_string() {
        let (s, consumed) = decode_string(&[3, b'a', b'b', b'c', b'd'], 7).unwrap();
        assert!(matches!(s, Cow::Borrowed(_)));
        assert_eq!((&s[..], consumed), (&b"abc"[..], 4));

        assert_eq!(
            decode_string(&[4, b'a', b'b'], 7),
            Err(DecoderError::from(StringDecodingError::NotEnoughOctets))
        );
    }

    #[test]
    fn test_request_sequence_no_huffman() {
        let mut decoder = Decoder::new();

        // RFC 7541, C.3.1
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d, 0x70,
            0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );
        assert_eq!(decoder.dynamic_table().size(), 57);

        // RFC 7541, C.3.2
        let block = [
            0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, 0x6e, 0x6f, 0x2d, 0x63, 0x61, 0x63, 0x68, 0x65,
        ];
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
                ("cache-control", "no-cache"),
            ])
        );
        assert_eq!(decoder.dynamic_table().size(), 110);

        // RFC 7541, C.3.3
        let block = [
            0x82, 0x87, 0x85, 0xbf, 0x40, 0x0a, 0x63, 0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x6b,
            0x65, 0x79, 0x0c, 0x63, 0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x76, 0x61, 0x6c, 0x75,
            0x65,
        ];
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/index.html"),
                (":authority", "www.example.com"),
                ("custom-key", "custom-value"),
            ])
        );
        assert_eq!(decoder.dynamic_table().size(), 164);
        assert_eq!(
            decoder.dynamic_table().to_vec(),
            pairs(&[
                ("custom-key", "custom-value"),
                ("cache-control", "no-cache"),
                (":authority", "www.example.com"),
            ])
        );
    }

    #[test]
    fn test_request_huffman() {
        let mut decoder = Decoder::new();

        // RFC 7541, C.4.1
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );
        assert_eq!(decoder.dynamic_table().size(), 57);
    }

    #[test]
    fn test_response_sequence_evicts() {
        let mut decoder = Decoder::new();
        decoder.set_max_allowed_table_size(256);

        // RFC 7541, C.5.1, behind the size update our lower limit calls for
        let block = [
            0x3f, 0xe1, 0x01, 0x48, 0x03, 0x33, 0x30, 0x32, 0x58, 0x07, 0x70, 0x72, 0x69, 0x76,
            0x61, 0x74, 0x65, 0x61, 0x1d, 0x4d, 0x6f, 0x6e, 0x2c, 0x20, 0x32, 0x31, 0x20, 0x4f,
            0x63, 0x74, 0x20, 0x32, 0x30, 0x31, 0x33, 0x20, 0x32, 0x30, 0x3a, 0x31, 0x33, 0x3a,
            0x32, 0x31, 0x20, 0x47, 0x4d, 0x54, 0x6e, 0x17, 0x68, 0x74, 0x74, 0x70, 0x73, 0x3a,
            0x2f, 0x2f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2e,
            0x63, 0x6f, 0x6d,
        ];
        decoder.decode(&block).unwrap();
        assert_eq!(decoder.dynamic_table().size(), 222);
        assert_eq!(decoder.dynamic_table().len(), 4);

        // RFC 7541, C.5.2: the new ':status: 307' pushes ':status: 302' out
        let block = [0x48, 0x03, 0x33, 0x30, 0x37, 0xc1, 0xc0, 0xbf];
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[
                (":status", "307"),
                ("cache-control", "private"),
                ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
                ("location", "https://www.example.com"),
            ])
        );
        assert_eq!(decoder.dynamic_table().size(), 222);
        assert_eq!(
            decoder.dynamic_table().to_vec(),
            pairs(&[
                (":status", "307"),
                ("location", "https://www.example.com"),
                ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
                ("cache-control", "private"),
            ])
        );
    }

    #[test]
    fn test_size_updates() {
        let mut decoder = Decoder::new();
        decoder.decode(&[0x41, 0x01, b'a']).unwrap();
        assert_eq!(decoder.dynamic_table().len(), 1);

        // size update to 0 at the start of a block clears the table
        decoder.decode(&[0x20, 0x82]).unwrap();
        assert_eq!(decoder.dynamic_table().len(), 0);
        assert_eq!(decoder.dynamic_table().max_size(), 0);

        assert_eq!(
            decoder.decode(&[0x82, 0x20]),
            Err(DecoderError::SizeUpdateNotAtStart)
        );

        // 4097 > the 4096 we allowed
        assert_eq!(
            decoder.decode(&[0x3f, 0xe2, 0x1f]),
            Err(DecoderError::InvalidMaxDynamicSize {
                requested: 4097,
                allowed: 4096
            })
        );
    }

    #[test]
    fn test_lowered_limit_requires_size_update() {
        let mut decoder = Decoder::new();
        decoder.decode(&[0x41, 0x01, b'a']).unwrap();

        decoder.set_max_allowed_table_size(64);
        assert_eq!(
            decoder.decode(&[0x82]),
            Err(DecoderError::SizeUpdateRequired)
        );

        // an update to anything within the new limit satisfies it, once
        decoder.decode(&[0x3f, 0x01, 0x82]).unwrap();
        assert_eq!(decoder.dynamic_table().max_size(), 32);
        decoder.decode(&[0x82]).unwrap();

        // raising the limit asks for nothing
        decoder.set_max_allowed_table_size(4096);
        decoder.decode(&[0x82]).unwrap();
    }

    #[test]
    fn test_index_out_of_bounds() {
        let mut decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&[0xbe]),
            Err(DecoderError::HeaderIndexOutOfBounds)
        );
        assert_eq!(
            decoder.decode(&[0x80]),
            Err(DecoderError::HeaderIndexOutOfBounds)
        );
    }

    #[test]
    fn test_callback_error_stops_decoding() {
        let mut decoder = Decoder::new();
        let mut seen = 0;
        let res = decoder.decode_with_cb(&[0x82, 0x84, 0x86], |_, _| {
            seen += 1;
            if seen == 2 {
                Err("enough")
            } else {
                Ok(())
            }
        });
        assert!(matches!(res, Err(DecoderOrCallbackError::CallbackError("enough"))));
        assert_eq!(seen, 2);
    }
}

//! An HPACK (RFC 7541) codec for the weir HTTP/2 engine.
//!
//! Both halves of the codec keep their own [HeaderTable]: the static table
//! shared by every connection, plus a bounded dynamic table whose size
//! accounting has to match the peer's exactly.

use std::collections::VecDeque;

use tracing::trace;

pub mod decoder;
pub mod encoder;
pub mod huffman;

pub use decoder::{decode_integer, Decoder, DecoderError};
pub use encoder::{encode_integer, Encoder};

/// Per-entry overhead counted against the dynamic table size (RFC 7541,
/// section 4.1). Header list size limits use the same figure.
pub const ENTRY_OVERHEAD: usize = 32;

/// Default size of the dynamic table, as per SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// The size an entry occupies in the dynamic table.
pub fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

pub type StaticTable<'a> = &'a [(&'a [u8], &'a [u8])];

/// The static table, RFC 7541 Appendix A. Index 1 is at position 0.
pub static STATIC_TABLE: StaticTable<'static> = &[
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// The dynamic part of the header table. New entries go in the front,
/// evictions happen from the back.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl Default for DynamicTable {
    fn default() -> Self {
        Self::with_max_size(DEFAULT_TABLE_SIZE)
    }
}

impl DynamicTable {
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Current size of the table, in the RFC 7541 sense (octets of every
    /// name and value plus 32 per entry).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes the maximum size, evicting as many entries as necessary.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_until(max_size);
    }

    /// Inserts a new entry. An entry larger than the maximum size empties the
    /// table and is not inserted (RFC 7541, section 4.4).
    pub fn add(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let size = entry_size(&name, &value);
        if size > self.max_size {
            trace!(%size, max_size = %self.max_size, "entry too large, emptying dynamic table");
            self.entries.clear();
            self.size = 0;
            return;
        }

        self.evict_until(self.max_size - size);
        self.size += size;
        self.entries.push_front((name, value));
    }

    /// Gets the entry at the 0-based position within the dynamic table.
    pub fn get(&self, index: usize) -> Option<(&[u8], &[u8])> {
        self.entries
            .get(index)
            .map(|(n, v)| (n.as_slice(), v.as_slice()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_slice(), v.as_slice()))
    }

    pub fn to_vec(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries.iter().cloned().collect()
    }

    fn evict_until(&mut self, target: usize) {
        while self.size > target {
            match self.entries.pop_back() {
                Some((name, value)) => {
                    self.size -= entry_size(&name, &value);
                }
                None => {
                    // nothing left to evict, the books must balance
                    self.size = 0;
                }
            }
        }
    }
}

/// The combined static + dynamic header table, 1-indexed.
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    pub dynamic_table: DynamicTable,
}

/// What a table lookup found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMatch {
    /// Both name and value matched at this index.
    Full(usize),
    /// Only the name matched at this index.
    Name(usize),
}

impl HeaderTable {
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::with_max_size(max_size),
        }
    }

    /// Gets the entry at the given 1-based index of the combined table.
    pub fn get_from_table(&self, index: usize) -> Option<(&[u8], &[u8])> {
        if index == 0 {
            return None;
        }
        let index = index - 1;
        if index < STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[index];
            return Some((n, v));
        }
        self.dynamic_table.get(index - STATIC_TABLE.len())
    }

    pub fn add_header(&mut self, name: Vec<u8>, value: Vec<u8>) {
        self.dynamic_table.add(name, value);
    }

    /// Finds the best match for the given header: a full match anywhere wins
    /// over a name-only match, and the static table is searched first.
    pub fn find_header(&self, name: &[u8], value: &[u8]) -> Option<TableMatch> {
        let mut name_match = None;

        let mut visit = |index: usize, n: &[u8], v: &[u8]| -> Option<TableMatch> {
            if n != name {
                return None;
            }
            if v == value {
                return Some(TableMatch::Full(index));
            }
            name_match.get_or_insert(TableMatch::Name(index));
            None
        };

        for (i, &(n, v)) in STATIC_TABLE.iter().enumerate() {
            if let Some(m) = visit(i + 1, n, v) {
                return Some(m);
            }
        }
        let offset = STATIC_TABLE.len() + 1;
        for (i, (n, v)) in self.dynamic_table.iter().enumerate() {
            if let Some(m) = visit(offset + i, n, v) {
                return Some(m);
            }
        }

        name_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_table_shape() {
        assert_eq!(STATIC_TABLE.len(), 61);
        let table = HeaderTable::default();
        assert_eq!(table.get_from_table(2), Some((&b":method"[..], &b"GET"[..])));
        assert_eq!(table.get_from_table(61).map(|e| e.0), Some(&b"www-authenticate"[..]));
        assert_eq!(table.get_from_table(0), None);
        assert_eq!(table.get_from_table(62), None);
    }

    #[test]
    fn test_dynamic_table_evicts_oldest_first() {
        // each entry is 1 + 1 + 32 = 34 octets
        let mut table = DynamicTable::with_max_size(34 * 3);
        for (n, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            table.add(n.into(), v.into());
        }
        assert_eq!(table.len(), 3);
        assert_eq!(table.size(), 34 * 3);
        assert_eq!(
            table.to_vec(),
            vec![
                (b"d".to_vec(), b"4".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ]
        );

        table.set_max_size(34);
        assert_eq!(table.len(), 1);
        assert_eq!(table.size(), 34);
        assert_eq!(table.get(0), Some((&b"d"[..], &b"4"[..])));
    }

    #[test]
    fn test_oversized_entry_empties_table() {
        let mut table = DynamicTable::with_max_size(40);
        table.add(b"a".to_vec(), b"1".to_vec());
        table.add(b"too-large".to_vec(), b"for this table".to_vec());
        assert!(table.is_empty());
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn test_find_header() {
        let mut table = HeaderTable::default();
        assert_eq!(table.find_header(b":method", b"POST"), Some(TableMatch::Full(3)));
        assert_eq!(table.find_header(b":method", b"PUT"), Some(TableMatch::Name(2)));
        assert_eq!(table.find_header(b"x-custom", b"1"), None);

        table.add_header(b"x-custom".to_vec(), b"1".to_vec());
        assert_eq!(table.find_header(b"x-custom", b"1"), Some(TableMatch::Full(62)));
        assert_eq!(table.find_header(b"x-custom", b"2"), Some(TableMatch::Name(62)));
    }
}

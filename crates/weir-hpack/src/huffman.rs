//! The canonical Huffman code from RFC 7541, Appendix B.

use std::sync::OnceLock;

/// `(code, bit length)` for every octet, followed by EOS at index 256.
static CODES: [(u32, u8); 257] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
    (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
    (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
    (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
    (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
    (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
    (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
    (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
    (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
    (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
    (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
    (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
    (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
    (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
    (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
    (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
    (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
    (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
    (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
    (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
    (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
    (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
    (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
    (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
    (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
    (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
    (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
    (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
    (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
    (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
    (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
    (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
    (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
    (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
    (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
    (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
    (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
    (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
    (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
    (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
    (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
    (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
    (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
    (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
    (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
    (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
    (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
    (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
    (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
    (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
    (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
    (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
    (0x3fffffff, 30),
];

const EOS: u16 = 256;

/// Represents the error variants that the `HuffmanDecoder` can return.
#[derive(PartialEq, Eq, Copy, Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HuffmanDecoderError {
    /// Any padding strictly larger than 7 bits MUST be interpreted as an error
    #[error("Padding too large")]
    PaddingTooLarge,
    /// Any padding that does not correspond to the most significant bits of
    /// EOS MUST be interpreted as an error.
    #[error("Invalid padding")]
    InvalidPadding,
    /// If EOS is ever found in the string, it causes an error.
    #[error("EOS in string")]
    EOSInString,
}

#[derive(Clone, Copy)]
enum Node {
    Branch([u16; 2]),
    Symbol(u16),
}

fn tree() -> &'static [Node] {
    static TREE: OnceLock<Vec<Node>> = OnceLock::new();
    TREE.get_or_init(|| {
        // index 0 is the root; a child index of 0 means "no child yet"
        let mut nodes = vec![Node::Branch([0, 0])];
        for (sym, &(code, bits)) in CODES.iter().enumerate() {
            let mut at = 0usize;
            for shift in (0..bits).rev() {
                let bit = ((code >> shift) & 1) as usize;
                let Node::Branch(children) = nodes[at] else {
                    unreachable!("huffman code is prefix-free")
                };
                if shift == 0 {
                    let leaf = nodes.len() as u16;
                    nodes.push(Node::Symbol(sym as u16));
                    let mut children = children;
                    children[bit] = leaf;
                    nodes[at] = Node::Branch(children);
                } else if children[bit] == 0 {
                    let next = nodes.len() as u16;
                    nodes.push(Node::Branch([0, 0]));
                    let mut children = children;
                    children[bit] = next;
                    nodes[at] = Node::Branch(children);
                    at = next as usize;
                } else {
                    at = children[bit] as usize;
                }
            }
        }
        nodes
    })
}

/// Decodes Huffman-coded octet strings.
#[derive(Default)]
pub struct HuffmanDecoder;

impl HuffmanDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes the whole buffer. Trailing bits must be a strict prefix of
    /// EOS (all ones, at most 7 of them).
    pub fn decode(&mut self, buf: &[u8]) -> Result<Vec<u8>, HuffmanDecoderError> {
        let tree = tree();
        let mut out = Vec::with_capacity(buf.len() + buf.len() / 2);

        let mut at = 0usize;
        let mut pending_bits = 0u32;
        let mut pending_all_ones = true;

        for &octet in buf {
            for shift in (0..8).rev() {
                let bit = ((octet >> shift) & 1) as usize;
                let Node::Branch(children) = tree[at] else {
                    unreachable!("decoder never rests on a symbol")
                };
                let next = children[bit] as usize;
                match tree[next] {
                    Node::Symbol(EOS) => return Err(HuffmanDecoderError::EOSInString),
                    Node::Symbol(sym) => {
                        out.push(sym as u8);
                        at = 0;
                        pending_bits = 0;
                        pending_all_ones = true;
                    }
                    Node::Branch(_) => {
                        at = next;
                        pending_bits += 1;
                        pending_all_ones &= bit == 1;
                    }
                }
            }
        }

        if pending_bits > 7 {
            return Err(HuffmanDecoderError::PaddingTooLarge);
        }
        if !pending_all_ones {
            return Err(HuffmanDecoderError::InvalidPadding);
        }
        Ok(out)
    }
}

/// Number of octets `buf` occupies once Huffman-coded.
pub fn encoded_len(buf: &[u8]) -> usize {
    let bits: usize = buf.iter().map(|&b| CODES[b as usize].1 as usize).sum();
    bits.div_ceil(8)
}

/// Huffman-codes `buf` onto the end of `dst`, padding with the EOS prefix.
pub fn encode_into(buf: &[u8], dst: &mut Vec<u8>) {
    let mut acc: u64 = 0;
    let mut acc_bits = 0u32;

    for &b in buf {
        let (code, bits) = CODES[b as usize];
        acc = (acc << bits) | code as u64;
        acc_bits += bits as u32;
        while acc_bits >= 8 {
            acc_bits -= 8;
            dst.push((acc >> acc_bits) as u8);
        }
    }

    if acc_bits > 0 {
        let pad = 8 - acc_bits;
        dst.push(((acc << pad) as u8) | ((1u8 << pad) - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(buf: &[u8]) -> Result<Vec<u8>, HuffmanDecoderError> {
        HuffmanDecoder::new().decode(buf)
    }

    #[test]
    fn test_decode_rfc_examples() {
        // RFC 7541, C.4.1
        let www = [
            0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff,
        ];
        assert_eq!(decode(&www).unwrap(), b"www.example.com");

        // RFC 7541, C.4.2
        assert_eq!(decode(&[0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]).unwrap(), b"no-cache");

        // RFC 7541, C.6.1
        assert_eq!(decode(&[0x64, 0x02]).unwrap(), b"302");
    }

    #[test]
    fn test_encode_matches_rfc() {
        let mut out = Vec::new();
        encode_into(b"custom-key", &mut out);
        assert_eq!(out, [0x25, 0xa8, 0x49, 0xe9, 0x5b, 0xa9, 0x7d, 0x7f]);
        assert_eq!(encoded_len(b"custom-key"), out.len());
    }

    #[test]
    fn test_every_octet_survives() {
        let all: Vec<u8> = (0..=255u8).collect();
        let mut out = Vec::new();
        encode_into(&all, &mut out);
        assert_eq!(out.len(), encoded_len(&all));
        assert_eq!(decode(&out).unwrap(), all);
    }

    #[test]
    fn test_padding_errors() {
        // 'a' is 00011 (5 bits); pad with zeroes instead of ones
        assert_eq!(decode(&[0x18]), Err(HuffmanDecoderError::InvalidPadding));
        // a full octet of ones is more than 7 bits of padding
        assert_eq!(
            decode(&[0x1f, 0xff]),
            Err(HuffmanDecoderError::PaddingTooLarge)
        );
        // 30 ones is the EOS symbol itself
        assert_eq!(
            decode(&[0xff, 0xff, 0xff, 0xfc]),
            Err(HuffmanDecoderError::EOSInString)
        );
    }
}

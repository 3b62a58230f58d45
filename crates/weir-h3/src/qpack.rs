//! QPACK (RFC 9204) with the static table only.
//!
//! We advertise a dynamic table capacity of 0, so every field section we
//! produce has a zero prefix and every section we accept must too. Any
//! reference to the dynamic table is a decompression failure.

use std::borrow::Cow;

use tracing::trace;
use weir_hpack::{
    decode_integer, decoder::decode_string, encode_integer, encoder::encode_string, DecoderError,
};

/// The QPACK static table (RFC 9204, Appendix A). Index 0 is at position 0.
pub static STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":path", b"/"),
    (b"age", b"0"),
    (b"content-disposition", b""),
    (b"content-length", b"0"),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"referer", b""),
    (b"set-cookie", b""),
    (b":method", b"CONNECT"),
    (b":method", b"DELETE"),
    (b":method", b"GET"),
    (b":method", b"HEAD"),
    (b":method", b"OPTIONS"),
    (b":method", b"POST"),
    (b":method", b"PUT"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"103"),
    (b":status", b"200"),
    (b":status", b"304"),
    (b":status", b"404"),
    (b":status", b"503"),
    (b"accept", b"*/*"),
    (b"accept", b"application/dns-message"),
    (b"accept-encoding", b"gzip, deflate, br"),
    (b"accept-ranges", b"bytes"),
    (b"access-control-allow-headers", b"cache-control"),
    (b"access-control-allow-headers", b"content-type"),
    (b"access-control-allow-origin", b"*"),
    (b"cache-control", b"max-age=0"),
    (b"cache-control", b"max-age=2592000"),
    (b"cache-control", b"max-age=604800"),
    (b"cache-control", b"no-cache"),
    (b"cache-control", b"no-store"),
    (b"cache-control", b"public, max-age=31536000"),
    (b"content-encoding", b"br"),
    (b"content-encoding", b"gzip"),
    (b"content-type", b"application/dns-message"),
    (b"content-type", b"application/javascript"),
    (b"content-type", b"application/json"),
    (b"content-type", b"application/x-www-form-urlencoded"),
    (b"content-type", b"image/gif"),
    (b"content-type", b"image/jpeg"),
    (b"content-type", b"image/png"),
    (b"content-type", b"text/css"),
    (b"content-type", b"text/html; charset=utf-8"),
    (b"content-type", b"text/plain"),
    (b"content-type", b"text/plain;charset=utf-8"),
    (b"range", b"bytes=0-"),
    (b"strict-transport-security", b"max-age=31536000"),
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains",
    ),
    (
        b"strict-transport-security",
        b"max-age=31536000; includesubdomains; preload",
    ),
    (b"vary", b"accept-encoding"),
    (b"vary", b"origin"),
    (b"x-content-type-options", b"nosniff"),
    (b"x-xss-protection", b"1; mode=block"),
    (b":status", b"100"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"302"),
    (b":status", b"400"),
    (b":status", b"403"),
    (b":status", b"421"),
    (b":status", b"425"),
    (b":status", b"500"),
    (b"accept-language", b""),
    (b"access-control-allow-credentials", b"FALSE"),
    (b"access-control-allow-credentials", b"TRUE"),
    (b"access-control-allow-headers", b"*"),
    (b"access-control-allow-methods", b"get"),
    (b"access-control-allow-methods", b"get, post, options"),
    (b"access-control-allow-methods", b"options"),
    (b"access-control-expose-headers", b"content-length"),
    (b"access-control-request-headers", b"content-type"),
    (b"access-control-request-method", b"get"),
    (b"access-control-request-method", b"post"),
    (b"alt-svc", b"clear"),
    (b"authorization", b""),
    (
        b"content-security-policy",
        b"script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    (b"early-data", b"1"),
    (b"expect-ct", b""),
    (b"forwarded", b""),
    (b"if-range", b""),
    (b"origin", b""),
    (b"purpose", b"prefetch"),
    (b"server", b""),
    (b"timing-allow-origin", b"*"),
    (b"upgrade-insecure-requests", b"1"),
    (b"user-agent", b""),
    (b"x-forwarded-for", b""),
    (b"x-frame-options", b"deny"),
    (b"x-frame-options", b"sameorigin"),
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QpackError {
    /// The field section references the dynamic table, which we never
    /// allow the peer to populate.
    #[error("dynamic table reference in a static-only field section")]
    DynamicReference,

    #[error("required insert count is {0}, expected 0")]
    NonZeroInsertCount(usize),

    #[error("static table index {0} out of bounds")]
    StaticIndexOutOfBounds(usize),

    #[error("malformed integer or string literal: {0}")]
    Literal(#[from] DecoderError),
}

#[derive(Debug)]
pub enum QpackOrCallbackError<E> {
    QpackError(QpackError),
    CallbackError(E),
}

impl<E> From<QpackError> for QpackOrCallbackError<E> {
    fn from(e: QpackError) -> Self {
        QpackOrCallbackError::QpackError(e)
    }
}

enum StaticMatch {
    Full(usize),
    Name(usize),
}

fn find_static(name: &[u8], value: &[u8]) -> Option<StaticMatch> {
    let mut name_match = None;
    for (i, &(n, v)) in STATIC_TABLE.iter().enumerate() {
        if n != name {
            continue;
        }
        if v == value {
            return Some(StaticMatch::Full(i));
        }
        name_match.get_or_insert(StaticMatch::Name(i));
    }
    name_match
}

/// Encodes field sections against the static table only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encodes one field section onto the end of `dst`.
    pub fn encode_into<'a, I>(&self, fields: I, dst: &mut Vec<u8>)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        // Required Insert Count, then Sign + Delta Base
        dst.extend_from_slice(&[0x00, 0x00]);

        for (name, value) in fields {
            match find_static(name, value) {
                Some(StaticMatch::Full(index)) => {
                    // indexed field line, T=1
                    encode_integer(index, 6, 0xc0, dst);
                }
                Some(StaticMatch::Name(index)) => {
                    // literal with name reference, N=0, T=1
                    encode_integer(index, 4, 0x50, dst);
                    encode_string(value, 7, 0x00, dst);
                }
                None => {
                    // literal with literal name, N=0
                    encode_string(name, 3, 0x20, dst);
                    encode_string(value, 7, 0x00, dst);
                }
            }
        }
    }

    pub fn encode<'a, I>(&self, fields: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let mut dst = Vec::new();
        self.encode_into(fields, &mut dst);
        dst
    }
}

/// Decodes field sections that only reference the static table.
#[derive(Debug, Default, Clone, Copy)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes a whole field section, calling `cb` for every field line in
    /// order.
    pub fn decode_with_cb<E>(
        &self,
        buf: &[u8],
        mut cb: impl FnMut(Cow<'_, [u8]>, Cow<'_, [u8]>) -> Result<(), E>,
    ) -> Result<(), QpackOrCallbackError<E>> {
        let (required_insert_count, consumed) = decode_integer(buf, 8).map_err(QpackError::from)?;
        if required_insert_count != 0 {
            return Err(QpackError::NonZeroInsertCount(required_insert_count).into());
        }
        let mut pos = consumed;

        // with no insertions the base is irrelevant, but it must be there
        let (_delta_base, consumed) = decode_integer(&buf[pos..], 7).map_err(QpackError::from)?;
        pos += consumed;

        while pos < buf.len() {
            let rest = &buf[pos..];
            let first = rest[0];

            if first & 0x80 != 0 {
                // indexed field line: 1 T index(6)
                if first & 0x40 == 0 {
                    return Err(QpackError::DynamicReference.into());
                }
                let (index, consumed) = decode_integer(rest, 6).map_err(QpackError::from)?;
                pos += consumed;
                let (name, value) = static_entry(index)?;
                cb(Cow::Borrowed(name), Cow::Borrowed(value))
                    .map_err(QpackOrCallbackError::CallbackError)?;
            } else if first & 0x40 != 0 {
                // literal with name reference: 01 N T index(4)
                if first & 0x10 == 0 {
                    return Err(QpackError::DynamicReference.into());
                }
                let (index, consumed) = decode_integer(rest, 4).map_err(QpackError::from)?;
                pos += consumed;
                let (name, _) = static_entry(index)?;
                let (value, consumed) =
                    decode_string(&buf[pos..], 7).map_err(QpackError::from)?;
                pos += consumed;
                cb(Cow::Borrowed(name), value).map_err(QpackOrCallbackError::CallbackError)?;
            } else if first & 0x20 != 0 {
                // literal with literal name: 001 N H length(3)
                let (name, consumed) = decode_string(rest, 3).map_err(QpackError::from)?;
                pos += consumed;
                let (value, consumed) =
                    decode_string(&buf[pos..], 7).map_err(QpackError::from)?;
                pos += consumed;
                cb(name, value).map_err(QpackOrCallbackError::CallbackError)?;
            } else {
                // post-base forms only ever point into the dynamic table
                trace!(first = %format!("{first:#04x}"), "post-base field line");
                return Err(QpackError::DynamicReference.into());
            }
        }

        Ok(())
    }

    /// Decodes a whole field section into a list of owned pairs.
    pub fn decode(&self, buf: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, QpackError> {
        let mut fields = Vec::new();
        self.decode_with_cb(buf, |name, value| {
            fields.push((name.into_owned(), value.into_owned()));
            Ok::<_, std::convert::Infallible>(())
        })
        .map_err(|e| match e {
            QpackOrCallbackError::QpackError(e) => e,
            QpackOrCallbackError::CallbackError(never) => match never {},
        })?;
        Ok(fields)
    }
}

fn static_entry(index: usize) -> Result<(&'static [u8], &'static [u8]), QpackError> {
    STATIC_TABLE
        .get(index)
        .copied()
        .ok_or(QpackError::StaticIndexOutOfBounds(index))
}

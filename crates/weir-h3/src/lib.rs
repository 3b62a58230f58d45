//! HTTP/3 wire types: QUIC variable-length integers, frames, settings and
//! error codes, plus a static-table QPACK codec.
//!
//! HTTP/3 <https://httpwg.org/specs/rfc9114.html>

use std::{fmt, io::Write};

use byteorder::{BigEndian, WriteBytesExt};
use nom::{number::streaming::be_u8, IResult};

pub use nom;

pub mod qpack;

/// Largest value a varint can carry.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Parses a QUIC variable-length integer (RFC 9000, section 16).
pub fn varint(i: &[u8]) -> IResult<&[u8], u64> {
    let (_, first) = be_u8(i)?;
    let len = 1usize << (first >> 6);
    let (rest, raw) = nom::bytes::streaming::take(len)(i)?;

    let mut value = (raw[0] & 0x3f) as u64;
    for &b in &raw[1..] {
        value = (value << 8) | b as u64;
    }
    Ok((rest, value))
}

/// Number of octets `value` takes as a varint.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0x3f => 1,
        0x40..=0x3fff => 2,
        0x4000..=0x3fff_ffff => 4,
        _ => 8,
    }
}

/// Writes `value` as a varint, using the shortest encoding. Values above
/// [VARINT_MAX] are an error.
pub fn write_varint(mut w: impl Write, value: u64) -> std::io::Result<()> {
    match varint_len(value) {
        1 => w.write_u8(value as u8),
        2 => w.write_u16::<BigEndian>(0x4000 | value as u16),
        4 => w.write_u32::<BigEndian>(0x8000_0000 | value as u32),
        _ => {
            if value > VARINT_MAX {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "varint value out of range",
                ));
            }
            w.write_u64::<BigEndian>(0xc000_0000_0000_0000 | value)
        }
    }
}

/// Unidirectional stream types (RFC 9114, section 6.2; RFC 9204, section 4.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    /// Reserved or unknown stream types must be ignored
    Unknown(u64),
}

impl StreamType {
    pub fn repr(self) -> u64 {
        match self {
            StreamType::Control => 0x00,
            StreamType::Push => 0x01,
            StreamType::QpackEncoder => 0x02,
            StreamType::QpackDecoder => 0x03,
            StreamType::Unknown(ty) => ty,
        }
    }

    pub fn from_repr(ty: u64) -> Self {
        match ty {
            0x00 => StreamType::Control,
            0x01 => StreamType::Push,
            0x02 => StreamType::QpackEncoder,
            0x03 => StreamType::QpackDecoder,
            other => StreamType::Unknown(other),
        }
    }
}

/// See https://httpwg.org/specs/rfc9114.html#frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H3FrameType {
    Data,
    Headers,
    CancelPush,
    Settings,
    PushPromise,
    GoAway,
    MaxPushId,
    /// Frame types HTTP/2 had but HTTP/3 forbids (PRIORITY, PING,
    /// WINDOW_UPDATE, CONTINUATION, and the reserved 0x06)
    ReservedH2(u64),
    /// Unknown frame types must be ignored
    Unknown(u64),
}

impl H3FrameType {
    pub fn repr(self) -> u64 {
        match self {
            H3FrameType::Data => 0x00,
            H3FrameType::Headers => 0x01,
            H3FrameType::CancelPush => 0x03,
            H3FrameType::Settings => 0x04,
            H3FrameType::PushPromise => 0x05,
            H3FrameType::GoAway => 0x07,
            H3FrameType::MaxPushId => 0x0d,
            H3FrameType::ReservedH2(ty) | H3FrameType::Unknown(ty) => ty,
        }
    }

    pub fn from_repr(ty: u64) -> Self {
        match ty {
            0x00 => H3FrameType::Data,
            0x01 => H3FrameType::Headers,
            0x03 => H3FrameType::CancelPush,
            0x04 => H3FrameType::Settings,
            0x05 => H3FrameType::PushPromise,
            0x07 => H3FrameType::GoAway,
            0x0d => H3FrameType::MaxPushId,
            0x02 | 0x06 | 0x08 | 0x09 => H3FrameType::ReservedH2(ty),
            other => H3FrameType::Unknown(other),
        }
    }
}

/// The type and length that precede every HTTP/3 frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H3FrameHeader {
    pub frame_type: H3FrameType,
    pub len: u64,
}

impl H3FrameHeader {
    pub fn new(frame_type: H3FrameType, len: u64) -> Self {
        Self { frame_type, len }
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, ty) = varint(i)?;
        let (i, len) = varint(i)?;
        Ok((
            i,
            Self {
                frame_type: H3FrameType::from_repr(ty),
                len,
            },
        ))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        write_varint(&mut w, self.frame_type.repr())?;
        write_varint(&mut w, self.len)
    }
}

/// Setting identifiers (RFC 9114, section 7.2.4.1; RFC 9204, section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H3Setting {
    QpackMaxTableCapacity,
    MaxFieldSectionSize,
    QpackBlockedStreams,
    /// Extended CONNECT (RFC 9220)
    EnableConnectProtocol,
}

impl H3Setting {
    pub fn repr(self) -> u64 {
        match self {
            H3Setting::QpackMaxTableCapacity => 0x01,
            H3Setting::MaxFieldSectionSize => 0x06,
            H3Setting::QpackBlockedStreams => 0x07,
            H3Setting::EnableConnectProtocol => 0x08,
        }
    }

    pub fn from_repr(id: u64) -> Option<Self> {
        Some(match id {
            0x01 => H3Setting::QpackMaxTableCapacity,
            0x06 => H3Setting::MaxFieldSectionSize,
            0x07 => H3Setting::QpackBlockedStreams,
            0x08 => H3Setting::EnableConnectProtocol,
            _ => return None,
        })
    }
}

/// HTTP/3 SETTINGS values. Only the static QPACK table is used, so the
/// dynamic table capacity stays at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H3Settings {
    pub qpack_max_table_capacity: u64,
    /// `None` means unlimited
    pub max_field_section_size: Option<u64>,
    pub qpack_blocked_streams: u64,
    pub enable_connect_protocol: bool,
}

impl Default for H3Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 0,
            max_field_section_size: None,
            qpack_blocked_streams: 0,
            enable_connect_protocol: false,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum H3SettingsError {
    #[error("setting 0x{id:x} appears twice")]
    Duplicate { id: u64 },

    /// HTTP/2 setting identifiers are reserved in HTTP/3
    #[error("reserved HTTP/2 setting 0x{id:x}")]
    ReservedH2Setting { id: u64 },

    #[error("ENABLE_CONNECT_PROTOCOL must be 0 or 1, got {actual}")]
    InvalidConnectProtocolValue { actual: u64 },

    #[error("truncated SETTINGS payload")]
    Truncated,
}

impl H3Settings {
    /// Parses a whole SETTINGS payload. Unknown identifiers are ignored.
    pub fn parse(mut buf: &[u8]) -> Result<Self, H3SettingsError> {
        let mut settings = Self::default();
        let mut seen: Vec<u64> = Vec::new();

        while !buf.is_empty() {
            let (rest, id) = varint(buf).map_err(|_| H3SettingsError::Truncated)?;
            let (rest, value) = varint(rest).map_err(|_| H3SettingsError::Truncated)?;
            buf = rest;

            if seen.contains(&id) {
                return Err(H3SettingsError::Duplicate { id });
            }
            seen.push(id);

            match H3Setting::from_repr(id) {
                Some(H3Setting::QpackMaxTableCapacity) => settings.qpack_max_table_capacity = value,
                Some(H3Setting::MaxFieldSectionSize) => {
                    settings.max_field_section_size = Some(value)
                }
                Some(H3Setting::QpackBlockedStreams) => settings.qpack_blocked_streams = value,
                Some(H3Setting::EnableConnectProtocol) => match value {
                    0 => settings.enable_connect_protocol = false,
                    1 => settings.enable_connect_protocol = true,
                    actual => {
                        return Err(H3SettingsError::InvalidConnectProtocolValue { actual })
                    }
                },
                None if matches!(id, 0x02..=0x05) => {
                    return Err(H3SettingsError::ReservedH2Setting { id })
                }
                None => {}
            }
        }

        Ok(settings)
    }

    fn pairs(&self) -> Vec<(H3Setting, u64)> {
        let mut pairs = Vec::new();
        if self.qpack_max_table_capacity != 0 {
            pairs.push((H3Setting::QpackMaxTableCapacity, self.qpack_max_table_capacity));
        }
        if let Some(max) = self.max_field_section_size {
            pairs.push((H3Setting::MaxFieldSectionSize, max));
        }
        if self.qpack_blocked_streams != 0 {
            pairs.push((H3Setting::QpackBlockedStreams, self.qpack_blocked_streams));
        }
        if self.enable_connect_protocol {
            pairs.push((H3Setting::EnableConnectProtocol, 1));
        }
        pairs
    }

    pub fn encoded_len(&self) -> usize {
        self.pairs()
            .iter()
            .map(|(id, v)| varint_len(id.repr()) + varint_len(*v))
            .sum()
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        for (id, value) in self.pairs() {
            write_varint(&mut w, id.repr())?;
            write_varint(&mut w, value)?;
        }
        Ok(())
    }
}

/// See https://httpwg.org/specs/rfc9114.html#error-codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H3ErrorCode {
    NoError,
    GeneralProtocolError,
    InternalError,
    StreamCreationError,
    ClosedCriticalStream,
    FrameUnexpected,
    FrameError,
    ExcessiveLoad,
    IdError,
    SettingsError,
    MissingSettings,
    RequestRejected,
    RequestCancelled,
    RequestIncomplete,
    MessageError,
    ConnectError,
    VersionFallback,
    QpackDecompressionFailed,
    QpackEncoderStreamError,
    QpackDecoderStreamError,
}

impl H3ErrorCode {
    pub fn repr(self) -> u64 {
        match self {
            H3ErrorCode::NoError => 0x100,
            H3ErrorCode::GeneralProtocolError => 0x101,
            H3ErrorCode::InternalError => 0x102,
            H3ErrorCode::StreamCreationError => 0x103,
            H3ErrorCode::ClosedCriticalStream => 0x104,
            H3ErrorCode::FrameUnexpected => 0x105,
            H3ErrorCode::FrameError => 0x106,
            H3ErrorCode::ExcessiveLoad => 0x107,
            H3ErrorCode::IdError => 0x108,
            H3ErrorCode::SettingsError => 0x109,
            H3ErrorCode::MissingSettings => 0x10a,
            H3ErrorCode::RequestRejected => 0x10b,
            H3ErrorCode::RequestCancelled => 0x10c,
            H3ErrorCode::RequestIncomplete => 0x10d,
            H3ErrorCode::MessageError => 0x10e,
            H3ErrorCode::ConnectError => 0x10f,
            H3ErrorCode::VersionFallback => 0x110,
            H3ErrorCode::QpackDecompressionFailed => 0x200,
            H3ErrorCode::QpackEncoderStreamError => 0x201,
            H3ErrorCode::QpackDecoderStreamError => 0x202,
        }
    }

    pub fn from_repr(code: u64) -> Option<Self> {
        Some(match code {
            0x100 => H3ErrorCode::NoError,
            0x101 => H3ErrorCode::GeneralProtocolError,
            0x102 => H3ErrorCode::InternalError,
            0x103 => H3ErrorCode::StreamCreationError,
            0x104 => H3ErrorCode::ClosedCriticalStream,
            0x105 => H3ErrorCode::FrameUnexpected,
            0x106 => H3ErrorCode::FrameError,
            0x107 => H3ErrorCode::ExcessiveLoad,
            0x108 => H3ErrorCode::IdError,
            0x109 => H3ErrorCode::SettingsError,
            0x10a => H3ErrorCode::MissingSettings,
            0x10b => H3ErrorCode::RequestRejected,
            0x10c => H3ErrorCode::RequestCancelled,
            0x10d => H3ErrorCode::RequestIncomplete,
            0x10e => H3ErrorCode::MessageError,
            0x10f => H3ErrorCode::ConnectError,
            0x110 => H3ErrorCode::VersionFallback,
            0x200 => H3ErrorCode::QpackDecompressionFailed,
            0x201 => H3ErrorCode::QpackEncoderStreamError,
            0x202 => H3ErrorCode::QpackDecoderStreamError,
            _ => return None,
        })
    }
}

/// A QUIC stream id, as used by HTTP/3. The two low bits say who opened the
/// stream and whether it is bidirectional.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuicStreamId(pub u64);

impl QuicStreamId {
    pub fn is_client_initiated(self) -> bool {
        self.0 & 0x1 == 0
    }

    pub fn is_bidi(self) -> bool {
        self.0 & 0x2 == 0
    }
}

impl fmt::Debug for QuicStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for QuicStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

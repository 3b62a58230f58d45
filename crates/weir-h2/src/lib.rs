//! HTTP/2 wire types: frame headers, flags, settings, error codes and the
//! small fixed-layout payloads.
//!
//! HTTP/2 <https://httpwg.org/specs/rfc9113.html>

use std::{fmt, io::Write, ops::RangeInclusive};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

pub use enumflags2;
use enumflags2::{bitflags, BitFlags};

pub use nom;

use nom::{
    combinator::map,
    number::streaming::{be_u24, be_u32, be_u8},
    sequence::tuple,
    IResult,
};

/// Sent by clients before anything else, once h2 has been negotiated.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of every frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 9;

pub fn preface(i: &[u8]) -> IResult<&[u8], ()> {
    let (i, _) = nom::bytes::streaming::tag(PREFACE)(i)?;
    Ok((i, ()))
}

/// See https://httpwg.org/specs/rfc9113.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawFrameType {
    Data = 0x00,
    Headers = 0x01,
    Priority = 0x02,
    RstStream = 0x03,
    Settings = 0x04,
    PushPromise = 0x05,
    Ping = 0x06,
    GoAway = 0x07,
    WindowUpdate = 0x08,
    Continuation = 0x09,
}

impl RawFrameType {
    pub fn repr(self) -> u8 {
        self as u8
    }

    pub fn from_repr(ty: u8) -> Option<Self> {
        Some(match ty {
            0x00 => Self::Data,
            0x01 => Self::Headers,
            0x02 => Self::Priority,
            0x03 => Self::RstStream,
            0x04 => Self::Settings,
            0x05 => Self::PushPromise,
            0x06 => Self::Ping,
            0x07 => Self::GoAway,
            0x08 => Self::WindowUpdate,
            0x09 => Self::Continuation,
            _ => return None,
        })
    }
}

/// Registry of every frame kind the engine handles, including kinds that
/// only exist inside the engine and never reach the wire. Those carry
/// negative codes so they can't collide with any current or future frame
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// The client connection preface
    Preface,
    /// The transport went away
    Disconnect,
    /// The session failed and is tearing itself down
    Failure,
}

impl FrameKind {
    pub const ALL: [FrameKind; 13] = [
        FrameKind::Data,
        FrameKind::Headers,
        FrameKind::Priority,
        FrameKind::RstStream,
        FrameKind::Settings,
        FrameKind::PushPromise,
        FrameKind::Ping,
        FrameKind::GoAway,
        FrameKind::WindowUpdate,
        FrameKind::Continuation,
        FrameKind::Preface,
        FrameKind::Disconnect,
        FrameKind::Failure,
    ];

    pub fn code(self) -> i16 {
        match self.raw() {
            Some(raw) => raw.repr() as i16,
            None => match self {
                FrameKind::Preface => -1,
                FrameKind::Disconnect => -2,
                _ => -3,
            },
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            -1 => Some(FrameKind::Preface),
            -2 => Some(FrameKind::Disconnect),
            -3 => Some(FrameKind::Failure),
            0..=0xff => RawFrameType::from_repr(code as u8).map(Self::from),
            _ => None,
        }
    }

    pub fn is_synthetic(self) -> bool {
        self.raw().is_none()
    }

    /// The wire type, for kinds that have one.
    pub fn raw(self) -> Option<RawFrameType> {
        Some(match self {
            FrameKind::Data => RawFrameType::Data,
            FrameKind::Headers => RawFrameType::Headers,
            FrameKind::Priority => RawFrameType::Priority,
            FrameKind::RstStream => RawFrameType::RstStream,
            FrameKind::Settings => RawFrameType::Settings,
            FrameKind::PushPromise => RawFrameType::PushPromise,
            FrameKind::Ping => RawFrameType::Ping,
            FrameKind::GoAway => RawFrameType::GoAway,
            FrameKind::WindowUpdate => RawFrameType::WindowUpdate,
            FrameKind::Continuation => RawFrameType::Continuation,
            FrameKind::Preface | FrameKind::Disconnect | FrameKind::Failure => return None,
        })
    }
}

impl From<RawFrameType> for FrameKind {
    fn from(raw: RawFrameType) -> Self {
        match raw {
            RawFrameType::Data => FrameKind::Data,
            RawFrameType::Headers => FrameKind::Headers,
            RawFrameType::Priority => FrameKind::Priority,
            RawFrameType::RstStream => FrameKind::RstStream,
            RawFrameType::Settings => FrameKind::Settings,
            RawFrameType::PushPromise => FrameKind::PushPromise,
            RawFrameType::Ping => FrameKind::Ping,
            RawFrameType::GoAway => FrameKind::GoAway,
            RawFrameType::WindowUpdate => FrameKind::WindowUpdate,
            RawFrameType::Continuation => FrameKind::Continuation,
        }
    }
}

/// Typed flags for various frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data(BitFlags<DataFlags>),
    Headers(BitFlags<HeadersFlags>),
    Priority,
    RstStream,
    Settings(BitFlags<SettingsFlags>),
    PushPromise(BitFlags<PushPromiseFlags>),
    Ping(BitFlags<PingFlags>),
    GoAway,
    WindowUpdate,
    Continuation(BitFlags<ContinuationFlags>),
    Unknown(EncodedFrameType),
}

/// See https://httpwg.org/specs/rfc9113.html#DATA
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataFlags {
    Padded = 0x08,
    EndStream = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#HEADERS
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeadersFlags {
    Priority = 0x20,
    Padded = 0x08,
    EndHeaders = 0x04,
    EndStream = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#PUSH_PROMISE
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushPromiseFlags {
    Padded = 0x08,
    EndHeaders = 0x04,
}

/// See https://httpwg.org/specs/rfc9113.html#SETTINGS
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SettingsFlags {
    Ack = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#PING
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingFlags {
    Ack = 0x01,
}

/// See https://httpwg.org/specs/rfc9113.html#CONTINUATION
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinuationFlags {
    EndHeaders = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameType {
    pub ty: u8,
    pub flags: u8,
}

impl EncodedFrameType {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (ty, flags)) = tuple((be_u8, be_u8))(i)?;
        Ok((i, Self { ty, flags }))
    }
}

impl From<(RawFrameType, u8)> for EncodedFrameType {
    fn from((ty, flags): (RawFrameType, u8)) -> Self {
        Self {
            ty: ty.repr(),
            flags,
        }
    }
}

impl FrameType {
    pub fn encode(self) -> EncodedFrameType {
        match self {
            FrameType::Data(f) => (RawFrameType::Data, f.bits()).into(),
            FrameType::Headers(f) => (RawFrameType::Headers, f.bits()).into(),
            FrameType::Priority => (RawFrameType::Priority, 0).into(),
            FrameType::RstStream => (RawFrameType::RstStream, 0).into(),
            FrameType::Settings(f) => (RawFrameType::Settings, f.bits()).into(),
            FrameType::PushPromise(f) => (RawFrameType::PushPromise, f.bits()).into(),
            FrameType::Ping(f) => (RawFrameType::Ping, f.bits()).into(),
            FrameType::GoAway => (RawFrameType::GoAway, 0).into(),
            FrameType::WindowUpdate => (RawFrameType::WindowUpdate, 0).into(),
            FrameType::Continuation(f) => (RawFrameType::Continuation, f.bits()).into(),
            FrameType::Unknown(ft) => ft,
        }
    }

    /// Unknown flags are dropped, as RFC 9113 section 4.1 requires.
    pub fn decode(ft: EncodedFrameType) -> Self {
        let Some(ty) = RawFrameType::from_repr(ft.ty) else {
            return FrameType::Unknown(ft);
        };
        match ty {
            RawFrameType::Data => FrameType::Data(BitFlags::from_bits_truncate(ft.flags)),
            RawFrameType::Headers => FrameType::Headers(BitFlags::from_bits_truncate(ft.flags)),
            RawFrameType::Priority => FrameType::Priority,
            RawFrameType::RstStream => FrameType::RstStream,
            RawFrameType::Settings => FrameType::Settings(BitFlags::from_bits_truncate(ft.flags)),
            RawFrameType::PushPromise => {
                FrameType::PushPromise(BitFlags::from_bits_truncate(ft.flags))
            }
            RawFrameType::Ping => FrameType::Ping(BitFlags::from_bits_truncate(ft.flags)),
            RawFrameType::GoAway => FrameType::GoAway,
            RawFrameType::WindowUpdate => FrameType::WindowUpdate,
            RawFrameType::Continuation => {
                FrameType::Continuation(BitFlags::from_bits_truncate(ft.flags))
            }
        }
    }

    /// The registry kind, `None` for unknown frame types.
    pub fn kind(self) -> Option<FrameKind> {
        RawFrameType::from_repr(self.encode().ty).map(FrameKind::from)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream ID used for connection control frames
    pub const CONNECTION: Self = Self(0);

    /// Largest stream ID that fits in 31 bits
    pub const MAX: Self = Self(0x7fff_ffff);

    /// Server-initiated streams have even IDs
    pub fn is_server_initiated(&self) -> bool {
        self.0 != 0 && self.0 % 2 == 0
    }

    /// Client-initiated streams have odd IDs
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct StreamIdOutOfRange(u32);

impl TryFrom<u32> for StreamId {
    type Error = StreamIdOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value & 0x8000_0000 != 0 {
            Err(StreamIdOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The 9-octet header every frame starts with.
/// See https://httpwg.org/specs/rfc9113.html#FrameHeader
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub reserved: u8,
    pub stream_id: StreamId,
    pub len: u32,
}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream_id.0 == 0 {
            write!(f, "Conn:")?;
        } else {
            write!(f, "#{}:", self.stream_id.0)?;
        }

        let (name, flags) = match self.frame_type {
            FrameType::Data(flags) => ("Data", flags.bits()),
            FrameType::Headers(flags) => ("Headers", flags.bits()),
            FrameType::Priority => ("Priority", 0),
            FrameType::RstStream => ("RstStream", 0),
            FrameType::Settings(flags) => ("Settings", flags.bits()),
            FrameType::PushPromise(flags) => ("PushPromise", flags.bits()),
            FrameType::Ping(flags) => ("Ping", flags.bits()),
            FrameType::GoAway => ("GoAway", 0),
            FrameType::WindowUpdate => ("WindowUpdate", 0),
            FrameType::Continuation(flags) => ("Continuation", flags.bits()),
            FrameType::Unknown(EncodedFrameType { ty, flags }) => {
                return write!(f, "UnknownFrame({:#x}, {:#x}, len={})", ty, flags, self.len)
            }
        };
        let mut s = f.debug_struct(name);

        if self.reserved != 0 {
            s.field("reserved", &self.reserved);
        }
        if self.len > 0 {
            s.field("len", &self.len);
        }
        if flags != 0 {
            s.field("flags", &format_args!("{flags:#04x}"));
        }

        s.finish()
    }
}

impl FrameHeader {
    /// Create a new frame header with the given type and stream ID.
    pub fn new(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            reserved: 0,
            stream_id,
            len: 0,
        }
    }

    /// Set the frame's length.
    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (len, frame_type, (reserved, stream_id))) = tuple((
            be_u24,
            EncodedFrameType::parse,
            parse_reserved_and_stream_id,
        ))(i)?;

        let header = FrameHeader {
            frame_type: FrameType::decode(frame_type),
            reserved,
            stream_id,
            len,
        };
        Ok((i, header))
    }

    pub fn write_into(self, mut w: impl Write) -> std::io::Result<()> {
        w.write_u24::<BigEndian>(self.len)?;
        let ft = self.frame_type.encode();
        w.write_u8(ft.ty)?;
        w.write_u8(ft.flags)?;
        w.write_all(&pack_reserved_and_stream_id(self.reserved, self.stream_id))?;

        Ok(())
    }

    /// Returns true if this frame is an ack
    pub fn is_ack(&self) -> bool {
        match self.frame_type {
            FrameType::Settings(flags) => flags.contains(SettingsFlags::Ack),
            FrameType::Ping(flags) => flags.contains(PingFlags::Ack),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndHeaders` set
    pub fn is_end_headers(&self) -> bool {
        match self.frame_type {
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndHeaders),
            FrameType::PushPromise(flags) => flags.contains(PushPromiseFlags::EndHeaders),
            FrameType::Continuation(flags) => flags.contains(ContinuationFlags::EndHeaders),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndStream` set
    pub fn is_end_stream(&self) -> bool {
        match self.frame_type {
            FrameType::Data(flags) => flags.contains(DataFlags::EndStream),
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndStream),
            _ => false,
        }
    }

    /// Returns true if the payload starts with a pad length octet
    pub fn is_padded(&self) -> bool {
        match self.frame_type {
            FrameType::Data(flags) => flags.contains(DataFlags::Padded),
            FrameType::Headers(flags) => flags.contains(HeadersFlags::Padded),
            FrameType::PushPromise(flags) => flags.contains(PushPromiseFlags::Padded),
            _ => false,
        }
    }
}

/// The first bit is reserved, the rest is a 31-bit integer
pub fn parse_bit_and_u31(i: &[u8]) -> IResult<&[u8], (u8, u32)> {
    let (i, x) = be_u32(i)?;

    let bit = (x >> 31) as u8;
    let val = x & 0x7FFF_FFFF;

    Ok((i, (bit, val)))
}

fn parse_reserved_and_stream_id(i: &[u8]) -> IResult<&[u8], (u8, StreamId)> {
    parse_bit_and_u31(i).map(|(i, (reserved, stream_id))| (i, (reserved, StreamId(stream_id))))
}

/// Pack a bit and a u31 into a 4-byte array (big-endian). Anything above 31
/// bits is masked off.
pub fn pack_bit_and_u31(bit: u8, val: u32) -> [u8; 4] {
    debug_assert_eq!(val & 0x7FFF_FFFF, val, "val is too large: {val:x}");

    let mut bytes = (val & 0x7FFF_FFFF).to_be_bytes();
    if bit & 1 != 0 {
        bytes[0] |= 0x80;
    }

    bytes
}

pub fn pack_reserved_and_stream_id(reserved: u8, stream_id: StreamId) -> [u8; 4] {
    pack_bit_and_u31(reserved, stream_id.0)
}

// cf. https://httpwg.org/specs/rfc9113.html#PRIORITY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    // 0-255 => 1-256
    pub weight: u8,
}

impl PrioritySpec {
    pub const LEN: usize = 5;

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((parse_reserved_and_stream_id, be_u8)),
            |((exclusive, stream_dependency), weight)| Self {
                exclusive: exclusive != 0,
                stream_dependency,
                weight,
            },
        )(i)
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_reserved_and_stream_id(
            self.exclusive as u8,
            self.stream_dependency,
        ))?;
        w.write_u8(self.weight)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Returns the underlying u32
    pub fn as_repr(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match KnownErrorCode::from_repr(self.0) {
            Some(e) => fmt::Debug::fmt(&e, f),
            None => write!(f, "ErrorCode(0x{:02x})", self.0),
        }
    }
}

impl From<KnownErrorCode> for ErrorCode {
    fn from(e: KnownErrorCode) -> Self {
        Self(e as u32)
    }
}

/// See https://httpwg.org/specs/rfc9113.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KnownErrorCode {
    /// Not an error, e.g. a graceful GOAWAY.
    NoError = 0x00,

    /// Unspecific protocol error, when nothing more specific applies.
    ProtocolError = 0x01,

    InternalError = 0x02,

    /// The peer violated flow control.
    FlowControlError = 0x03,

    /// A SETTINGS frame went unacknowledged for too long.
    SettingsTimeout = 0x04,

    /// A frame arrived after the stream was half-closed.
    StreamClosed = 0x05,

    FrameSizeError = 0x06,

    /// The stream was refused before any application processing, so it is
    /// safe to retry.
    RefusedStream = 0x07,

    /// The stream is no longer needed.
    Cancel = 0x08,

    /// The field section compression context can't be maintained.
    CompressionError = 0x09,

    /// A CONNECT tunnel was reset or abnormally closed.
    ConnectError = 0x0a,

    EnhanceYourCalm = 0x0b,

    InadequateSecurity = 0x0c,

    Http1_1Required = 0x0d,
}

impl KnownErrorCode {
    pub fn repr(self) -> u32 {
        self as u32
    }

    pub fn from_repr(code: u32) -> Option<Self> {
        Some(match code {
            0x00 => Self::NoError,
            0x01 => Self::ProtocolError,
            0x02 => Self::InternalError,
            0x03 => Self::FlowControlError,
            0x04 => Self::SettingsTimeout,
            0x05 => Self::StreamClosed,
            0x06 => Self::FrameSizeError,
            0x07 => Self::RefusedStream,
            0x08 => Self::Cancel,
            0x09 => Self::CompressionError,
            0x0a => Self::ConnectError,
            0x0b => Self::EnhanceYourCalm,
            0x0c => Self::InadequateSecurity,
            0x0d => Self::Http1_1Required,
            _ => return None,
        })
    }
}

impl TryFrom<ErrorCode> for KnownErrorCode {
    type Error = ();

    fn try_from(e: ErrorCode) -> Result<Self, Self::Error> {
        KnownErrorCode::from_repr(e.0).ok_or(())
    }
}

/// cf. https://httpwg.org/specs/rfc9113.html#SettingValues
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Maximum size of the HPACK dynamic table the sender's decoder uses.
    pub header_table_size: u32,

    /// Whether the sender accepts PUSH_PROMISE frames. Servers must never
    /// send 1.
    pub enable_push: bool,

    /// How many concurrent streams the sender lets its peer open. `None`
    /// means no limit was announced.
    pub max_concurrent_streams: Option<u32>,

    /// Initial stream-level flow-control window, at most 2^31-1.
    pub initial_window_size: u32,

    /// Largest frame payload the sender accepts, between 2^14 and 2^24-1.
    pub max_frame_size: u32,

    /// Largest field section the sender accepts, counted as the length of
    /// every name and value plus 32 octets per field.
    pub max_header_list_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: (1 << 16) - 1,
            max_frame_size: (1 << 14),
            max_header_list_size: u32::MAX,
        }
    }
}

impl Settings {
    pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;
    pub const MAX_FRAME_SIZE_ALLOWED_RANGE: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    /// Apply a setting to the current settings, returning an error if the
    /// setting is invalid.
    pub fn apply(&mut self, code: Setting, value: u32) -> Result<(), SettingsError> {
        match code {
            Setting::HeaderTableSize => {
                self.header_table_size = value;
            }
            Setting::EnablePush => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(SettingsError::InvalidEnablePushValue { actual: value }),
            },
            Setting::MaxConcurrentStreams => {
                self.max_concurrent_streams = Some(value);
            }
            Setting::InitialWindowSize => {
                if value > Self::MAX_INITIAL_WINDOW_SIZE {
                    return Err(SettingsError::InitialWindowSizeTooLarge { actual: value });
                }
                self.initial_window_size = value;
            }
            Setting::MaxFrameSize => {
                if !Self::MAX_FRAME_SIZE_ALLOWED_RANGE.contains(&value) {
                    return Err(SettingsError::SettingsMaxFrameSizeInvalid { actual: value });
                }
                self.max_frame_size = value;
            }
            Setting::MaxHeaderListSize => {
                self.max_header_list_size = value;
            }
        }

        Ok(())
    }

    /// Parses a SETTINGS payload, calling `callback` for each known setting.
    /// Unknown settings are ignored. The caller checks that the length is a
    /// multiple of 6; a trailing partial entry is ignored.
    pub fn parse<E>(
        buf: &[u8],
        mut callback: impl FnMut(Setting, u32) -> Result<(), E>,
    ) -> Result<(), E> {
        for chunk in buf.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            if let Some(id) = Setting::from_repr(id) {
                callback(id, value)?;
            }
        }

        Ok(())
    }

    /// Every setting that differs from the protocol defaults, which is what
    /// an endpoint needs to announce.
    pub fn non_default_pairs(&self) -> Vec<(Setting, u32)> {
        let defaults = Settings::default();
        let mut pairs = Vec::new();
        if self.header_table_size != defaults.header_table_size {
            pairs.push((Setting::HeaderTableSize, self.header_table_size));
        }
        if self.enable_push != defaults.enable_push {
            pairs.push((Setting::EnablePush, self.enable_push as u32));
        }
        if let Some(max) = self.max_concurrent_streams {
            pairs.push((Setting::MaxConcurrentStreams, max));
        }
        if self.initial_window_size != defaults.initial_window_size {
            pairs.push((Setting::InitialWindowSize, self.initial_window_size));
        }
        if self.max_frame_size != defaults.max_frame_size {
            pairs.push((Setting::MaxFrameSize, self.max_frame_size));
        }
        if self.max_header_list_size != defaults.max_header_list_size {
            pairs.push((Setting::MaxHeaderListSize, self.max_header_list_size));
        }
        pairs
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettingsError {
    #[error("ENABLE_PUSH setting is supposed to be either 0 or 1, got {actual}")]
    InvalidEnablePushValue { actual: u32 },

    #[error("bad INITIAL_WINDOW_SIZE value {actual}, should be less than or equal to 2^31-1")]
    InitialWindowSizeTooLarge { actual: u32 },

    #[error(
        "bad SETTINGS_MAX_FRAME_SIZE value {actual}, should be between 2^14 and 2^24-1 inclusive"
    )]
    SettingsMaxFrameSizeInvalid { actual: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Setting {
    HeaderTableSize = 0x01,
    EnablePush = 0x02,
    MaxConcurrentStreams = 0x03,
    InitialWindowSize = 0x04,
    MaxFrameSize = 0x05,
    MaxHeaderListSize = 0x06,
}

impl Setting {
    pub fn from_repr(id: u16) -> Option<Self> {
        Some(match id {
            0x01 => Self::HeaderTableSize,
            0x02 => Self::EnablePush,
            0x03 => Self::MaxConcurrentStreams,
            0x04 => Self::InitialWindowSize,
            0x05 => Self::MaxFrameSize,
            0x06 => Self::MaxHeaderListSize,
            _ => return None,
        })
    }
}

/// A SETTINGS payload, as (identifier, value) pairs
pub struct SettingPairs<'a>(pub &'a [(Setting, u32)]);

impl<'a> From<&'a [(Setting, u32)]> for SettingPairs<'a> {
    fn from(value: &'a [(Setting, u32)]) -> Self {
        Self(value)
    }
}

impl SettingPairs<'_> {
    pub fn encoded_len(&self) -> usize {
        self.0.len() * 6
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        for (id, value) in self.0.iter() {
            w.write_u16::<BigEndian>(*id as u16)?;
            w.write_u32::<BigEndian>(*value)?;
        }
        Ok(())
    }
}

/// Payload for a GOAWAY frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub additional_debug_data: Bytes,
}

impl GoAway {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, ((_, last_stream_id), error_code)) = tuple((parse_bit_and_u31, be_u32))(i)?;

        Ok((
            &rest[rest.len()..],
            Self {
                last_stream_id: StreamId(last_stream_id),
                error_code: ErrorCode(error_code),
                additional_debug_data: Bytes::copy_from_slice(rest),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(0, self.last_stream_id.0))?;
        w.write_u32::<BigEndian>(self.error_code.0)?;
        w.write_all(&self.additional_debug_data[..])
    }
}

/// Payload for a RST_STREAM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub error_code: ErrorCode,
}

impl RstStream {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, error_code) = be_u32(i)?;
        Ok((
            rest,
            Self {
                error_code: ErrorCode(error_code),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.error_code.0)
    }
}

/// Payload for a WINDOW_UPDATE frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub reserved: u8,
    pub increment: u32,
}

impl WindowUpdate {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (reserved, increment)) = parse_bit_and_u31(i)?;
        Ok((
            rest,
            Self {
                reserved,
                increment,
            },
        ))
    }

    pub fn write_into(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(self.reserved, self.increment))
    }
}

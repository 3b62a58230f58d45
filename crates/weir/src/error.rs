//! The two-tier error taxonomy: a [StreamError] resets one stream and the
//! connection carries on, a [SessionError] tears the whole connection down.

use weir_h2::{ErrorCode, FrameKind, KnownErrorCode, SettingsError, StreamId};
use weir_h3::{H3ErrorCode, H3SettingsError};

/// Which message a stream-level problem was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// The field section compression context is gone: nothing decoded after
/// this point can be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CompressionError {
    #[error("hpack decoding error: {0}")]
    Hpack(#[from] weir_hpack::DecoderError),

    #[error("qpack decoding error: {0}")]
    Qpack(#[from] weir_h3::qpack::QpackError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StreamError {
    #[error("malformed {direction:?}: {reason}")]
    Malformed {
        direction: Direction,
        reason: &'static str,
    },

    #[error("received {data_length} bytes in data frames but content-length announced {content_length} bytes")]
    DataLengthDoesNotMatchContentLength {
        data_length: u64,
        content_length: u64,
    },

    #[error("refused stream")]
    RefusedStream,

    #[error("trailers must have EndStream flag set")]
    TrailersNotEndStream,

    #[error("received headers after the final headers, and they are not trailers")]
    UnexpectedHeaders,

    #[error("received data before the final headers")]
    DataBeforeHeaders,

    #[error("stream closed")]
    StreamClosed,

    #[error("received PRIORITY frame with invalid size {frame_size}")]
    InvalidPriorityFrameSize { frame_size: u32 },

    #[error("stream {stream_id} depends on itself")]
    SelfDependency { stream_id: StreamId },

    #[error("zero increment in window update frame for stream")]
    WindowUpdateZeroIncrement,

    #[error("received WINDOW_UPDATE that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("peer sent more data than the stream window allows")]
    FlowControlViolation,

    #[error("header list of {size} bytes exceeds the peer's limit of {max}")]
    HeaderListTooLarge { size: usize, max: usize },

    #[error("stream idle timeout")]
    IdleTimeout,

    #[error("stream reset by peer with {0:?}")]
    Reset(ErrorCode),

    #[error("stream reset by peer with HTTP/3 error 0x{0:x}")]
    ResetH3(u64),

    #[error("stream cancelled")]
    Cancel,

    #[error("session closed")]
    SessionClosed,

    #[error("stream cannot send {what} in its current state")]
    InvalidState { what: &'static str },
}

impl StreamError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use KnownErrorCode as Code;
        use StreamError::*;

        match self {
            Cancel | IdleTimeout | SessionClosed => Code::Cancel,
            // stream closed error
            StreamClosed => Code::StreamClosed,
            // stream refused error
            RefusedStream => Code::RefusedStream,
            // frame size errors
            InvalidPriorityFrameSize { .. } => Code::FrameSizeError,
            // flow control errors
            WindowUpdateOverflow | FlowControlViolation => Code::FlowControlError,
            HeaderListTooLarge { .. } => Code::InternalError,
            Reset(code) => KnownErrorCode::try_from(*code).unwrap_or(Code::InternalError),
            _ => Code::ProtocolError,
        }
    }

    pub fn as_h3_error_code(&self) -> H3ErrorCode {
        use H3ErrorCode as Code;
        use StreamError::*;

        match self {
            Cancel | IdleTimeout | SessionClosed => Code::RequestCancelled,
            RefusedStream => Code::RequestRejected,
            UnexpectedHeaders | DataBeforeHeaders => Code::FrameUnexpected,
            HeaderListTooLarge { .. } => Code::ExcessiveLoad,
            ResetH3(code) => H3ErrorCode::from_repr(*code).unwrap_or(Code::InternalError),
            _ => Code::MessageError,
        }
    }

    /// Whether the request never reached the application, and can be
    /// retried on another connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::RefusedStream)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("client preface mismatch")]
    BadPreface,

    #[error("frame too large: {frame_kind:?} frame of size {frame_size} exceeds max frame size of {max_frame_size}")]
    FrameTooLarge {
        frame_kind: Option<FrameKind>,
        frame_size: u32,
        max_frame_size: u32,
    },

    #[error("received {frame_kind:?} frame with invalid length {len}")]
    InvalidFrameLength { frame_kind: FrameKind, len: u32 },

    #[error("stream-specific frame {frame_kind:?} sent to stream ID 0 (connection-wide)")]
    StreamSpecificFrameToConnection { frame_kind: FrameKind },

    #[error("connection-wide frame {frame_kind:?} sent to stream {stream_id}")]
    ConnectionFrameToStream {
        frame_kind: FrameKind,
        stream_id: StreamId,
    },

    #[error("received {frame_kind:?} frame with Padded flag but empty payload")]
    PaddedFrameEmpty { frame_kind: FrameKind },

    #[error("received {frame_kind:?} with Padded flag but payload was shorter than padding")]
    PaddedFrameTooShort {
        frame_kind: FrameKind,
        padding_length: usize,
        frame_size: u32,
    },

    #[error("on stream {stream_id}, expected continuation frame, but got {frame_kind:?}")]
    ExpectedContinuationFrame {
        stream_id: StreamId,
        frame_kind: Option<FrameKind>,
    },

    #[error("expected continuation for stream {stream_id}, but got continuation for stream {continuation_stream_id}")]
    ExpectedContinuationForStream {
        stream_id: StreamId,
        continuation_stream_id: StreamId,
    },

    #[error("on stream {stream_id}, received unexpected continuation frame")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("{0}")]
    Compression(#[from] CompressionError),

    #[error("header list of at least {size} bytes exceeds the limit of {max}")]
    HeaderListTooLarge { size: usize, max: usize },

    #[error("bad setting value: {0}")]
    BadSettingValue(#[from] SettingsError),

    #[error("received PUSH_PROMISE, which is not allowed here")]
    PushPromiseNotAllowed,

    #[error("peer initiated stream {stream_id} with the wrong parity")]
    StreamIdWrongParity { stream_id: StreamId },

    #[error("peer stream IDs should be numerically increasing, got {stream_id} after {last_stream_id}")]
    StreamIdShouldIncrease {
        stream_id: StreamId,
        last_stream_id: StreamId,
    },

    #[error("received {frame_kind:?} frame for idle stream {stream_id}")]
    FrameOnIdleStream {
        frame_kind: FrameKind,
        stream_id: StreamId,
    },

    #[error("received frame for closed stream {stream_id}")]
    StreamClosed { stream_id: StreamId },

    #[error("zero increment in window update frame for the connection")]
    WindowUpdateZeroIncrement,

    #[error("received window update that made the connection window overflow")]
    WindowUpdateOverflow,

    #[error("peer sent more data than the connection window allows")]
    WindowUnderflow,

    #[error("initial window size change made the window of stream {stream_id} overflow")]
    StreamWindowSizeOverflowDueToSettings { stream_id: StreamId },

    #[error("stream id space exhausted")]
    StreamIdsExhausted,

    #[error("peer went away with {error_code:?}")]
    GoAway { error_code: ErrorCode },

    #[error("connection closed")]
    Closed,

    #[error("HTTP/3 frame type 0x{frame_type:x} is not allowed here")]
    H3FrameUnexpected { frame_type: u64 },

    #[error("HTTP/3 frame is malformed: {reason}")]
    H3FrameError { reason: &'static str },

    #[error("HTTP/3 control stream must start with SETTINGS")]
    H3MissingSettings,

    #[error("HTTP/3 critical stream closed")]
    H3ClosedCriticalStream,

    #[error("duplicate HTTP/3 critical stream of type 0x{stream_type:x}")]
    H3StreamCreation { stream_type: u64 },

    #[error("HTTP/3 settings error: {0}")]
    H3Settings(#[from] H3SettingsError),

    #[error("invalid HTTP/3 stream id {stream_id}")]
    H3IdError { stream_id: u64 },

    #[error("HTTP/3 frame of {len} bytes exceeds the limit of {max}")]
    H3ExcessiveLoad { len: u64, max: u64 },
}

impl SessionError {
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use KnownErrorCode as Code;
        use SessionError::*;

        match self {
            // frame size errors
            FrameTooLarge { .. } | InvalidFrameLength { .. } | PaddedFrameEmpty { .. } => {
                Code::FrameSizeError
            }
            // flow control errors
            WindowUpdateOverflow | WindowUnderflow | StreamWindowSizeOverflowDueToSettings { .. } => {
                Code::FlowControlError
            }
            BadSettingValue(SettingsError::InitialWindowSizeTooLarge { .. }) => {
                Code::FlowControlError
            }
            // compression errors
            Compression(_) => Code::CompressionError,
            // stream closed error
            StreamClosed { .. } => Code::StreamClosed,
            GoAway { .. } | Closed => Code::NoError,
            _ => Code::ProtocolError,
        }
    }

    pub fn as_h3_error_code(&self) -> H3ErrorCode {
        use H3ErrorCode as Code;
        use SessionError::*;

        match self {
            Compression(_) => Code::QpackDecompressionFailed,
            H3FrameUnexpected { .. } => Code::FrameUnexpected,
            H3FrameError { .. } => Code::FrameError,
            H3MissingSettings => Code::MissingSettings,
            H3ClosedCriticalStream => Code::ClosedCriticalStream,
            H3StreamCreation { .. } => Code::StreamCreationError,
            H3Settings(_) => Code::SettingsError,
            H3IdError { .. } => Code::IdError,
            H3ExcessiveLoad { .. } | HeaderListTooLarge { .. } => Code::ExcessiveLoad,
            GoAway { .. } | Closed => Code::NoError,
            _ => Code::GeneralProtocolError,
        }
    }
}

/// An error found while processing inbound frames, at the severity it must
/// be handled with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorLevel {
    #[error("stream {0} error: {1}")]
    Stream(StreamId, StreamError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl From<CompressionError> for ErrorLevel {
    fn from(e: CompressionError) -> Self {
        ErrorLevel::Session(e.into())
    }
}

/// Errors surfaced by the client and server adapters.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// An error occurred while reading from or writing to the transport
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session failed and the connection is gone
    #[error("HTTP session error: {0}")]
    Session(#[from] SessionError),

    /// One stream failed, the connection is fine
    #[error("HTTP stream error: {0}")]
    Stream(#[from] StreamError),

    /// The QUIC transport reported an error
    #[error("QUIC transport error: {0}")]
    Transport(String),

    /// The connection task is gone
    #[error("connection closed")]
    ConnectionClosed,
}

b_x::make_bxable!(ServeError);
b_x::make_bxable!(StreamError);
b_x::make_bxable!(SessionError);

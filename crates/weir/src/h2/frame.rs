use std::fmt;

use bytes::Bytes;
use weir_h2::{ErrorCode, FrameKind, PrioritySpec, Setting, StreamId};

use crate::{error::SessionError, meta::MetaData};

/// A typed HTTP/2 frame, as produced by the parser and consumed by the
/// generator. Header blocks are carried decoded: CONTINUATION fragments are
/// reassembled by the parser and produced by the generator as needed.
#[derive(Clone, PartialEq)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
        /// Octets of padding, including the pad length octet. Padding
        /// counts against flow control.
        padding: u16,
    },
    Headers {
        stream_id: StreamId,
        meta: MetaData,
        priority: Option<PrioritySpec>,
        end_stream: bool,
    },
    Priority {
        stream_id: StreamId,
        spec: PrioritySpec,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        values: Vec<(Setting, u32)>,
    },
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        meta: MetaData,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    /// A raw header block fragment. The parser never yields these.
    Continuation {
        stream_id: StreamId,
        fragment: Bytes,
        end_headers: bool,
    },
    /// The client connection preface was received
    Preface,
    /// The transport reached EOF
    Disconnect,
    /// The session failed
    Failure { error: SessionError },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Headers { .. } => FrameKind::Headers,
            Frame::Priority { .. } => FrameKind::Priority,
            Frame::RstStream { .. } => FrameKind::RstStream,
            Frame::Settings { .. } => FrameKind::Settings,
            Frame::PushPromise { .. } => FrameKind::PushPromise,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::GoAway { .. } => FrameKind::GoAway,
            Frame::WindowUpdate { .. } => FrameKind::WindowUpdate,
            Frame::Continuation { .. } => FrameKind::Continuation,
            Frame::Preface => FrameKind::Preface,
            Frame::Disconnect => FrameKind::Disconnect,
            Frame::Failure { .. } => FrameKind::Failure,
        }
    }

    /// The stream this frame concerns, [StreamId::CONNECTION] for
    /// connection-level and synthetic frames.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. } => *stream_id,
            _ => StreamId::CONNECTION,
        }
    }

    /// Length of a DATA frame as far as flow control is concerned.
    pub fn flow_controlled_len(&self) -> u32 {
        match self {
            Frame::Data { data, padding, .. } => data.len() as u32 + *padding as u32,
            _ => 0,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                padding,
            } => f
                .debug_struct("Data")
                .field("stream_id", stream_id)
                .field("len", &data.len())
                .field("end_stream", end_stream)
                .field("padding", padding)
                .finish(),
            Frame::Headers {
                stream_id,
                meta,
                priority,
                end_stream,
            } => {
                let mut s = f.debug_struct("Headers");
                s.field("stream_id", stream_id);
                match meta {
                    MetaData::Request(req) | MetaData::ConnectRequest(req) => {
                        s.field("method", &req.method);
                        if let Some(path) = &req.path {
                            s.field("path", path);
                        }
                    }
                    MetaData::Response(res) => {
                        s.field("status", &res.status);
                    }
                    MetaData::Fields(fields) => {
                        s.field("trailers", &fields.len());
                    }
                }
                if let Some(priority) = priority {
                    s.field("priority", priority);
                }
                s.field("end_stream", end_stream).finish()
            }
            Frame::Priority { stream_id, spec } => f
                .debug_struct("Priority")
                .field("stream_id", stream_id)
                .field("spec", spec)
                .finish(),
            Frame::RstStream {
                stream_id,
                error_code,
            } => f
                .debug_struct("RstStream")
                .field("stream_id", stream_id)
                .field("error_code", error_code)
                .finish(),
            Frame::Settings { ack, values } => f
                .debug_struct("Settings")
                .field("ack", ack)
                .field("values", values)
                .finish(),
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                ..
            } => f
                .debug_struct("PushPromise")
                .field("stream_id", stream_id)
                .field("promised_stream_id", promised_stream_id)
                .finish(),
            Frame::Ping { ack, payload } => f
                .debug_struct("Ping")
                .field("ack", ack)
                .field("payload", &pretty_hex::simple_hex(payload))
                .finish(),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => f
                .debug_struct("GoAway")
                .field("last_stream_id", last_stream_id)
                .field("error_code", error_code)
                .field("debug_data", &String::from_utf8_lossy(debug_data))
                .finish(),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => f
                .debug_struct("WindowUpdate")
                .field("stream_id", stream_id)
                .field("increment", increment)
                .finish(),
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => f
                .debug_struct("Continuation")
                .field("stream_id", stream_id)
                .field("len", &fragment.len())
                .field("end_headers", end_headers)
                .finish(),
            Frame::Preface => f.write_str("Preface"),
            Frame::Disconnect => f.write_str("Disconnect"),
            Frame::Failure { error } => f.debug_struct("Failure").field("error", error).finish(),
        }
    }
}

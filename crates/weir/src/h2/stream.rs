use std::collections::VecDeque;

use bytes::Bytes;
use tokio::time::Instant;
use weir_h2::StreamId;

use super::flow::{RecvFlow, Window};
use crate::{
    error::{Direction, StreamError},
    listener::StreamListener,
    meta::MetaData,
};

/// See https://httpwg.org/specs/rfc9113.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Whether we may still send frames that carry content
    pub fn can_send(self) -> bool {
        matches!(
            self,
            StreamState::Idle
                | StreamState::ReservedLocal
                | StreamState::Open
                | StreamState::HalfClosedRemote
        )
    }

    /// Whether the peer may still send frames that carry content
    pub fn can_recv(self) -> bool {
        matches!(
            self,
            StreamState::Idle
                | StreamState::ReservedRemote
                | StreamState::Open
                | StreamState::HalfClosedLocal
        )
    }
}

/// One request/response exchange, from the session's point of view.
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    state: StreamState,

    /// What kind of message the peer sends on this stream
    inbound: Direction,
    remote_final: bool,
    local_final: bool,
    content_length: Option<u64>,
    received: u64,

    /// Responses to HEAD announce a content-length but carry no body
    head_request: bool,

    pub(crate) send_window: Window,
    pub(crate) recv: RecvFlow,

    /// Bytes handed to the listener that the application hasn't consumed.
    /// They still hold connection credit.
    pub(crate) unconsumed: u32,

    /// Data waiting for flow-control credit
    pub(crate) pending: VecDeque<Bytes>,
    pub(crate) end_queued: bool,
    pub(crate) trailers: Option<MetaData>,

    pub(crate) last_activity: Instant,
    pub(crate) listener: Box<dyn StreamListener>,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        state: StreamState,
        inbound: Direction,
        send_window: u32,
        recv_window: u32,
        listener: Box<dyn StreamListener>,
    ) -> Self {
        Self {
            id,
            state,
            inbound,
            remote_final: false,
            local_final: false,
            content_length: None,
            received: 0,
            head_request: false,
            send_window: Window::new(send_window),
            recv: RecvFlow::new(recv_window),
            unconsumed: 0,
            pending: Default::default(),
            end_queued: false,
            trailers: None,
            last_activity: Instant::now(),
            listener,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether anything is still queued for sending
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.trailers.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(|b| b.len()).sum()
    }

    /// Validates an inbound header block against the stream state.
    pub fn recv_headers(&mut self, meta: &MetaData, end_stream: bool) -> Result<(), StreamError> {
        if !self.state.can_recv() {
            return Err(StreamError::StreamClosed);
        }

        if self.remote_final {
            // anything after the final headers must be trailers
            if !matches!(meta, MetaData::Fields(_)) {
                return Err(StreamError::UnexpectedHeaders);
            }
            if !end_stream {
                return Err(StreamError::TrailersNotEndStream);
            }
        } else {
            match (self.inbound, meta) {
                (Direction::Request, MetaData::Request(_) | MetaData::ConnectRequest(_)) => {}
                (Direction::Response, MetaData::Response(res)) => {
                    if res.status.is_informational() {
                        if end_stream {
                            return Err(self.malformed("informational response ends the stream"));
                        }
                        self.open_remote();
                        self.touch();
                        return Ok(());
                    }
                }
                (Direction::Request, _) => return Err(self.malformed("No Method")),
                (Direction::Response, _) => return Err(self.malformed("No Status")),
            }
            self.remote_final = true;
            self.content_length = match meta {
                MetaData::Response(res)
                    if self.head_request || res.status == http::StatusCode::NOT_MODIFIED =>
                {
                    None
                }
                _ => meta.content_length(),
            };
        }

        self.open_remote();
        if end_stream {
            self.check_content_length()?;
            self.close_remote();
        }
        self.touch();
        Ok(())
    }

    /// Accounts for `len` bytes of DATA payload (padding excluded).
    pub fn recv_data(&mut self, len: usize, end_stream: bool) -> Result<(), StreamError> {
        if !self.state.can_recv() {
            return Err(StreamError::StreamClosed);
        }
        if !self.remote_final {
            return Err(StreamError::DataBeforeHeaders);
        }

        self.received += len as u64;
        if let Some(content_length) = self.content_length {
            if self.received > content_length {
                return Err(StreamError::DataLengthDoesNotMatchContentLength {
                    data_length: self.received,
                    content_length,
                });
            }
        }
        if end_stream {
            self.check_content_length()?;
            self.close_remote();
        }
        self.touch();
        Ok(())
    }

    fn check_content_length(&self) -> Result<(), StreamError> {
        match self.content_length {
            Some(content_length) if content_length != self.received => {
                Err(StreamError::DataLengthDoesNotMatchContentLength {
                    data_length: self.received,
                    content_length,
                })
            }
            _ => Ok(()),
        }
    }

    /// Checks and records that we're sending a header block. Informational
    /// responses may repeat, anything after the final headers must end the
    /// stream.
    pub fn send_headers(&mut self, meta: &MetaData, end_stream: bool) -> Result<(), StreamError> {
        if !self.state.can_send() || self.end_queued {
            return Err(StreamError::InvalidState { what: "headers" });
        }
        if self.local_final {
            return Err(StreamError::InvalidState {
                what: "headers after the final headers",
            });
        }
        if meta.is_informational() && end_stream {
            return Err(StreamError::InvalidState {
                what: "an informational response with END_STREAM",
            });
        }
        if !meta.is_informational() {
            self.local_final = true;
        }
        if let MetaData::Request(req) = meta {
            self.head_request = req.method == http::Method::HEAD;
        }

        self.open_local();
        if end_stream {
            self.close_local();
        }
        self.touch();
        Ok(())
    }

    pub fn can_send_data(&self) -> bool {
        self.local_final && self.state.can_send() && !self.end_queued
    }

    pub fn queue_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        if !self.can_send_data() {
            return Err(StreamError::InvalidState { what: "data" });
        }
        if !data.is_empty() || end_stream {
            self.pending.push_back(data);
        }
        self.end_queued = end_stream;
        Ok(())
    }

    pub fn queue_trailers(&mut self, trailers: MetaData) -> Result<(), StreamError> {
        if !self.can_send_data() || !matches!(trailers, MetaData::Fields(_)) {
            return Err(StreamError::InvalidState { what: "trailers" });
        }
        self.trailers = Some(trailers);
        self.end_queued = true;
        Ok(())
    }

    fn open_local(&mut self) {
        self.state = match self.state {
            StreamState::Idle => StreamState::Open,
            StreamState::ReservedLocal => StreamState::HalfClosedRemote,
            other => other,
        };
    }

    fn open_remote(&mut self) {
        self.state = match self.state {
            StreamState::Idle => StreamState::Open,
            StreamState::ReservedRemote => StreamState::HalfClosedLocal,
            other => other,
        };
    }

    /// We sent END_STREAM
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open | StreamState::Idle => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::ReservedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// The peer sent END_STREAM
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open | StreamState::Idle => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::ReservedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// RST_STREAM, in either direction
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
        self.pending.clear();
        self.trailers = None;
    }

    fn malformed(&self, reason: &'static str) -> StreamError {
        StreamError::Malformed {
            direction: self.inbound,
            reason,
        }
    }
}

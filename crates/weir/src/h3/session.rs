//! A sans-I/O HTTP/3 session. QUIC stream events go in through
//! [H3Session::handle], HTTP events come out of [H3Session::poll_event], and
//! what needs sending comes out of [H3Session::poll_transmit].

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::HeaderMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use weir_h3::{
    qpack::{self, QpackOrCallbackError},
    varint, H3ErrorCode, H3FrameHeader, H3FrameType, H3Settings, QuicStreamId, StreamType,
};

use crate::{
    error::{CompressionError, Direction, SessionError, StreamError},
    meta::{MetaData, MetaDataBuilder},
    Role,
};

/// Control frames are small, anything bigger is the peer misbehaving.
const MAX_CONTROL_FRAME_SIZE: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct H3Conf {
    /// Largest field section we accept, announced as
    /// SETTINGS_MAX_FIELD_SECTION_SIZE.
    pub max_field_section_size: u64,

    /// Streams with no activity for this long are cancelled.
    pub stream_idle_timeout: Option<Duration>,

    /// Whether we accept extended CONNECT (`:protocol`).
    pub enable_connect_protocol: bool,
}

impl Default for H3Conf {
    fn default() -> Self {
        Self {
            max_field_section_size: 16 * 1024,
            stream_idle_timeout: Some(Duration::from_secs(30)),
            enable_connect_protocol: false,
        }
    }
}

/// What the QUIC transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicEvent {
    /// Bytes arrived on a stream. The first bytes of a stream open it.
    StreamData {
        stream_id: QuicStreamId,
        data: Bytes,
        fin: bool,
    },
    /// The peer reset its sending side of a stream.
    StreamReset {
        stream_id: QuicStreamId,
        error_code: u64,
    },
    ConnectionClosed,
}

/// What the session wants the QUIC transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
    StreamData {
        stream_id: QuicStreamId,
        data: Bytes,
        fin: bool,
    },
    /// Reset our side of the stream and stop reading theirs
    ResetStream {
        stream_id: QuicStreamId,
        error_code: u64,
    },
    CloseConnection {
        error_code: u64,
        reason: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum H3Event {
    /// A request, response (1xx included) or trailers. Server sessions see
    /// new request streams for the first time here.
    Headers {
        stream_id: QuicStreamId,
        meta: MetaData,
        end_stream: bool,
    },
    Data {
        stream_id: QuicStreamId,
        data: Bytes,
        end_stream: bool,
    },
    StreamFailed {
        stream_id: QuicStreamId,
        error: StreamError,
    },
    /// The peer's SETTINGS arrived
    Settings(H3Settings),
    /// The peer is going away. Client sessions get the first request stream
    /// the server won't process.
    GoAway { id: u64 },
    Failed(SessionError),
    Closed,
}

/// Where the frame reader of a request stream is at
#[derive(Debug, Clone, Copy)]
enum Payload {
    Data(u64),
    Skip(u64),
}

#[derive(Debug)]
struct RequestStream {
    buf: BytesMut,
    payload: Option<Payload>,

    remote_final: bool,
    remote_trailers: bool,
    remote_done: bool,
    local_final: bool,
    local_done: bool,

    content_length: Option<u64>,
    received: u64,
    /// Responses to HEAD carry a content-length but no body
    head_request: bool,

    last_activity: Instant,
}

impl RequestStream {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            payload: None,
            remote_final: false,
            remote_trailers: false,
            remote_done: false,
            local_final: false,
            local_done: false,
            content_length: None,
            received: 0,
            head_request: false,
            last_activity: Instant::now(),
        }
    }

    fn is_closed(&self) -> bool {
        self.remote_done && self.local_done
    }

    fn recv_headers(
        &mut self,
        inbound: Direction,
        meta: &MetaData,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        if self.remote_trailers {
            return Err(StreamError::UnexpectedHeaders);
        }
        match meta {
            MetaData::Fields(_) if !self.remote_final => {
                return Err(StreamError::Malformed {
                    direction: inbound,
                    reason: "trailers before the final headers",
                })
            }
            MetaData::Fields(_) => {
                if !end_stream {
                    return Err(StreamError::TrailersNotEndStream);
                }
                self.remote_trailers = true;
            }
            _ if self.remote_final => return Err(StreamError::UnexpectedHeaders),
            MetaData::Response(res) if res.status.is_informational() => {
                if end_stream {
                    return Err(StreamError::Malformed {
                        direction: inbound,
                        reason: "informational response ends the stream",
                    });
                }
            }
            MetaData::Response(res) => {
                self.remote_final = true;
                let no_body = self.head_request || res.status == http::StatusCode::NOT_MODIFIED;
                self.content_length = if no_body { None } else { res.content_length };
            }
            MetaData::Request(req) | MetaData::ConnectRequest(req) => {
                self.remote_final = true;
                self.content_length = req.content_length;
            }
        }
        if end_stream {
            self.finish_remote(inbound)?;
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    fn recv_data(&mut self, len: usize) -> Result<(), StreamError> {
        if !self.remote_final {
            return Err(StreamError::DataBeforeHeaders);
        }
        if self.remote_trailers {
            return Err(StreamError::UnexpectedHeaders);
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
        self.last_activity = Instant::now();
        Ok(())
    }

    fn finish_remote(&mut self, inbound: Direction) -> Result<(), StreamError> {
        if !self.remote_final {
            return Err(StreamError::Malformed {
                direction: inbound,
                reason: "stream ended before the final headers",
            });
        }
        if let Some(content_length) = self.content_length {
            if content_length != self.received {
                return Err(StreamError::DataLengthDoesNotMatchContentLength {
                    data_length: self.received,
                    content_length,
                });
            }
        }
        self.remote_done = true;
        Ok(())
    }
}

/// Peer unidirectional streams, by what they turned out to be
#[derive(Debug)]
enum UniStream {
    /// Type not read yet
    Pending(BytesMut),
    Control(BytesMut),
    /// QPACK encoder or decoder: nothing to do with them, but they must stay
    /// open
    Qpack,
    Ignored,
}

/// What to do with a uni stream once its type is known
enum UniNext {
    Wait,
    Typed(u64, BytesMut),
    Control,
    Qpack,
    Ignored,
}

pub struct H3Session {
    role: Role,
    conf: H3Conf,

    local_settings: H3Settings,
    remote_settings: Option<H3Settings>,

    encoder: qpack::Encoder,
    decoder: qpack::Decoder,
    builder: MetaDataBuilder,

    streams: BTreeMap<QuicStreamId, RequestStream>,
    uni: BTreeMap<QuicStreamId, UniStream>,
    control: QuicStreamId,
    peer_control: Option<QuicStreamId>,
    peer_qpack: Vec<StreamType>,

    next_bidi: u64,
    /// Highest request stream the peer opened
    last_remote: Option<QuicStreamId>,
    /// Every peer request stream below this id has been opened
    remote_floor: u64,
    /// Peer request streams opened at or above `remote_floor`
    remote_opened: BTreeSet<QuicStreamId>,
    go_away_sent: Option<u64>,
    go_away_received: Option<u64>,

    events: VecDeque<H3Event>,
    transmits: VecDeque<Transmit>,
    closed: bool,
}

impl H3Session {
    /// Opens our control stream and queues our SETTINGS on it.
    pub fn new(role: Role, conf: H3Conf) -> Self {
        let local_settings = H3Settings {
            max_field_section_size: Some(conf.max_field_section_size),
            enable_connect_protocol: conf.enable_connect_protocol,
            ..Default::default()
        };
        let inbound = match role {
            Role::Server => Direction::Request,
            Role::Client => Direction::Response,
        };
        let control = QuicStreamId(match role {
            Role::Client => 0x2,
            Role::Server => 0x3,
        });

        let mut this = Self {
            role,
            local_settings,
            remote_settings: None,
            encoder: qpack::Encoder::new(),
            decoder: qpack::Decoder::new(),
            builder: MetaDataBuilder::new(conf.max_field_section_size as usize, inbound),
            streams: Default::default(),
            uni: Default::default(),
            control,
            peer_control: None,
            peer_qpack: Vec::new(),
            next_bidi: 0,
            last_remote: None,
            remote_floor: 0,
            remote_opened: BTreeSet::new(),
            go_away_sent: None,
            go_away_received: None,
            events: Default::default(),
            transmits: Default::default(),
            closed: false,
            conf,
        };

        let mut payload = BytesMut::new();
        let _ = local_settings.write_into((&mut payload).writer());
        let mut data = BytesMut::new();
        let _ = weir_h3::write_varint((&mut data).writer(), StreamType::Control.repr());
        data.put(encode_frame(H3FrameType::Settings, &payload));
        debug!(?role, settings = ?local_settings, "Opening control stream");
        this.transmits.push_back(Transmit::StreamData {
            stream_id: control,
            data: data.freeze(),
            fin: false,
        });
        this
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn remote_settings(&self) -> Option<&H3Settings> {
        self.remote_settings.as_ref()
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, stream_id: QuicStreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn poll_event(&mut self) -> Option<H3Event> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn handle(&mut self, event: QuicEvent) {
        if self.closed {
            return;
        }
        let res = match event {
            QuicEvent::StreamData {
                stream_id,
                data,
                fin,
            } => {
                trace!(%stream_id, len = %data.len(), %fin, "<");
                self.on_stream_data(stream_id, data, fin)
            }
            QuicEvent::StreamReset {
                stream_id,
                error_code,
            } => self.on_stream_reset(stream_id, error_code),
            QuicEvent::ConnectionClosed => {
                debug!("QUIC connection closed");
                self.fail_all_streams(StreamError::SessionClosed);
                self.close_now();
                Ok(())
            }
        };
        if let Err(e) = res {
            self.fail(e);
        }
        self.maybe_close_drained();
    }

    /// Opens a request stream. Clients only.
    pub fn new_stream(&mut self, meta: MetaData, end_stream: bool) -> Result<QuicStreamId, StreamError> {
        if self.role != Role::Client || !meta.is_request() {
            return Err(StreamError::InvalidState {
                what: "requests from a server",
            });
        }
        if self.closed {
            return Err(StreamError::SessionClosed);
        }
        if self.go_away_sent.is_some() || self.go_away_received.is_some() {
            return Err(StreamError::RefusedStream);
        }

        let stream_id = QuicStreamId(self.next_bidi);
        let mut stream = RequestStream::new();
        stream.local_final = true;
        stream.local_done = end_stream;
        if let MetaData::Request(req) = &meta {
            stream.head_request = req.method == http::Method::HEAD;
        }
        self.write_headers(stream_id, &meta, end_stream)?;
        self.next_bidi += 4;
        self.streams.insert(stream_id, stream);
        Ok(stream_id)
    }

    /// Sends response headers (1xx included) on a request stream.
    pub fn send_headers(
        &mut self,
        stream_id: QuicStreamId,
        meta: MetaData,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamClosed)?;
        if stream.local_done || stream.local_final || matches!(meta, MetaData::Fields(_)) {
            return Err(StreamError::InvalidState { what: "headers" });
        }
        if meta.is_informational() {
            if end_stream {
                return Err(StreamError::InvalidState {
                    what: "an informational response with END_STREAM",
                });
            }
        } else {
            stream.local_final = true;
        }
        stream.local_done = end_stream;
        stream.last_activity = Instant::now();

        if let Err(e) = self.write_headers(stream_id, &meta, end_stream) {
            self.stream_error(stream_id, e.clone());
            return Err(e);
        }
        self.finish_if_closed(stream_id);
        self.maybe_close_drained();
        Ok(())
    }

    pub fn send_data(
        &mut self,
        stream_id: QuicStreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamClosed)?;
        if !stream.local_final || stream.local_done {
            return Err(StreamError::InvalidState { what: "data" });
        }
        stream.local_done = end_stream;
        stream.last_activity = Instant::now();

        let data = if data.is_empty() {
            // a bare FIN
            data
        } else {
            encode_frame(H3FrameType::Data, &data)
        };
        self.transmits.push_back(Transmit::StreamData {
            stream_id,
            data,
            fin: end_stream,
        });
        self.finish_if_closed(stream_id);
        self.maybe_close_drained();
        Ok(())
    }

    pub fn send_trailers(
        &mut self,
        stream_id: QuicStreamId,
        trailers: HeaderMap,
    ) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamClosed)?;
        if !stream.local_final || stream.local_done {
            return Err(StreamError::InvalidState { what: "trailers" });
        }
        stream.local_done = true;

        let meta = MetaData::Fields(trailers);
        if let Err(e) = self.write_headers(stream_id, &meta, true) {
            self.stream_error(stream_id, e.clone());
            return Err(e);
        }
        self.finish_if_closed(stream_id);
        self.maybe_close_drained();
        Ok(())
    }

    /// Resets a request stream in both directions.
    pub fn reset(&mut self, stream_id: QuicStreamId, error_code: H3ErrorCode) {
        if self.streams.remove(&stream_id).is_none() {
            return;
        }
        debug!(%stream_id, ?error_code, "Resetting stream");
        self.transmits.push_back(Transmit::ResetStream {
            stream_id,
            error_code: error_code.repr(),
        });
        self.maybe_close_drained();
    }

    /// Sends GOAWAY: streams we already have run to completion, newer ones
    /// are rejected.
    pub fn go_away(&mut self) {
        if self.closed || self.go_away_sent.is_some() {
            return;
        }
        let id = match self.role {
            // the first request stream we won't process
            Role::Server => self.last_remote.map(|id| id.0 + 4).unwrap_or(0),
            // we never allow pushes, push id 0 is fine
            Role::Client => 0,
        };
        debug!(%id, "Sending GoAway");
        self.go_away_sent = Some(id);

        let mut payload = BytesMut::new();
        let _ = weir_h3::write_varint((&mut payload).writer(), id);
        self.transmits.push_back(Transmit::StreamData {
            stream_id: self.control,
            data: encode_frame(H3FrameType::GoAway, &payload),
            fin: false,
        });
        self.maybe_close_drained();
    }

    /// Fails every stream and closes the connection with `error_code`.
    pub fn abort(&mut self, error_code: H3ErrorCode) {
        if self.closed {
            return;
        }
        debug!(?error_code, "Aborting connection");
        self.transmits.push_back(Transmit::CloseConnection {
            error_code: error_code.repr(),
            reason: Bytes::new(),
        });
        self.fail_all_streams(StreamError::SessionClosed);
        self.close_now();
    }

    /// Cancels streams idle for longer than the configured timeout.
    pub fn check_idle(&mut self, now: Instant) {
        let Some(timeout) = self.conf.stream_idle_timeout else {
            return;
        };
        let expired: Vec<QuicStreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in expired {
            debug!(%stream_id, ?timeout, "stream idle timeout");
            self.stream_error(stream_id, StreamError::IdleTimeout);
        }
        self.maybe_close_drained();
    }

    pub fn next_idle_deadline(&self) -> Option<Instant> {
        let timeout = self.conf.stream_idle_timeout?;
        self.streams
            .values()
            .map(|s| s.last_activity + timeout)
            .min()
    }

    fn inbound(&self) -> Direction {
        match self.role {
            Role::Server => Direction::Request,
            Role::Client => Direction::Response,
        }
    }

    fn on_stream_data(
        &mut self,
        stream_id: QuicStreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<(), SessionError> {
        if !stream_id.is_bidi() {
            let theirs = stream_id.is_client_initiated() == (self.role == Role::Server);
            if !theirs {
                return Err(SessionError::H3IdError {
                    stream_id: stream_id.0,
                });
            }
            return self.on_uni_data(stream_id, data, fin);
        }

        if !self.streams.contains_key(&stream_id) {
            match self.role {
                Role::Client if !stream_id.is_client_initiated() => {
                    // servers never open request streams
                    return Err(SessionError::H3StreamCreation { stream_type: 0 });
                }
                Role::Client => {
                    trace!(%stream_id, "data for a stream we no longer track");
                    return Ok(());
                }
                Role::Server if !stream_id.is_client_initiated() => {
                    return Err(SessionError::H3StreamCreation { stream_type: 0 });
                }
                Role::Server => {
                    if !self.mark_remote_opened(stream_id) {
                        trace!(%stream_id, "data for a stream we no longer track");
                        return Ok(());
                    }
                    if self.go_away_sent.is_some_and(|first| stream_id.0 >= first) {
                        debug!(%stream_id, "rejecting request opened after GoAway");
                        self.transmits.push_back(Transmit::ResetStream {
                            stream_id,
                            error_code: H3ErrorCode::RequestRejected.repr(),
                        });
                        return Ok(());
                    }
                    trace!(%stream_id, "new request stream");
                    self.streams.insert(stream_id, RequestStream::new());
                }
            }
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.buf.extend_from_slice(&data);
        }
        self.read_request(stream_id, fin)
    }

    /// Records a peer request stream, false if it was opened before. The
    /// first bytes of different streams can arrive in any order.
    fn mark_remote_opened(&mut self, stream_id: QuicStreamId) -> bool {
        if stream_id.0 < self.remote_floor || !self.remote_opened.insert(stream_id) {
            return false;
        }
        while self.remote_opened.remove(&QuicStreamId(self.remote_floor)) {
            self.remote_floor += 4;
        }
        self.last_remote = self.last_remote.max(Some(stream_id));
        true
    }

    fn read_request(&mut self, stream_id: QuicStreamId, fin: bool) -> Result<(), SessionError> {
        let inbound = self.inbound();

        loop {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };

            match stream.payload {
                Some(Payload::Data(remaining)) => {
                    let n = (remaining as usize).min(stream.buf.len());
                    if n == 0 {
                        break;
                    }
                    let data = stream.buf.split_to(n).freeze();
                    let remaining = remaining - n as u64;
                    stream.payload = (remaining > 0).then_some(Payload::Data(remaining));
                    let end_stream = fin && stream.payload.is_none() && stream.buf.is_empty();

                    let res = stream.recv_data(n).and_then(|()| {
                        if end_stream {
                            stream.finish_remote(inbound)
                        } else {
                            Ok(())
                        }
                    });
                    if let Err(e) = res {
                        self.stream_error(stream_id, e);
                        return Ok(());
                    }
                    self.events.push_back(H3Event::Data {
                        stream_id,
                        data,
                        end_stream,
                    });
                    continue;
                }
                Some(Payload::Skip(remaining)) => {
                    let n = (remaining as usize).min(stream.buf.len());
                    if n == 0 {
                        break;
                    }
                    stream.buf.advance(n);
                    let remaining = remaining - n as u64;
                    stream.payload = (remaining > 0).then_some(Payload::Skip(remaining));
                    continue;
                }
                None => {}
            }

            if stream.buf.is_empty() {
                break;
            }
            let (header, header_len) = match H3FrameHeader::parse(&stream.buf[..]) {
                Ok((rest, header)) => (header, stream.buf.len() - rest.len()),
                Err(_) => break,
            };

            match header.frame_type {
                H3FrameType::Data => {
                    stream.buf.advance(header_len);
                    stream.payload = (header.len > 0).then_some(Payload::Data(header.len));
                    if header.len == 0 {
                        if let Err(e) = stream.recv_data(0) {
                            self.stream_error(stream_id, e);
                            return Ok(());
                        }
                    }
                }
                H3FrameType::Headers => {
                    if header.len > self.conf.max_field_section_size {
                        let e = StreamError::HeaderListTooLarge {
                            size: header.len as usize,
                            max: self.conf.max_field_section_size as usize,
                        };
                        self.stream_error(stream_id, e);
                        return Ok(());
                    }
                    let total = header_len + header.len as usize;
                    if stream.buf.len() < total {
                        break;
                    }
                    stream.buf.advance(header_len);
                    let block = stream.buf.split_to(header.len as usize).freeze();
                    let end_stream = fin && stream.buf.is_empty();

                    let meta = match self.decode_block(&block)? {
                        Ok(meta) => meta,
                        Err(e) => {
                            self.stream_error(stream_id, e);
                            return Ok(());
                        }
                    };
                    let Some(stream) = self.streams.get_mut(&stream_id) else {
                        return Ok(());
                    };
                    if let Err(e) = stream.recv_headers(inbound, &meta, end_stream) {
                        self.stream_error(stream_id, e);
                        return Ok(());
                    }
                    self.events.push_back(H3Event::Headers {
                        stream_id,
                        meta,
                        end_stream,
                    });
                }
                H3FrameType::Unknown(ty) => {
                    trace!(%stream_id, ty = %format!("{ty:#x}"), len = %header.len, "skipping unknown frame");
                    stream.buf.advance(header_len);
                    stream.payload = (header.len > 0).then_some(Payload::Skip(header.len));
                }
                H3FrameType::PushPromise if self.role == Role::Client => {
                    // we never sent MAX_PUSH_ID
                    return Err(SessionError::H3IdError {
                        stream_id: stream_id.0,
                    });
                }
                other => {
                    return Err(SessionError::H3FrameUnexpected {
                        frame_type: other.repr(),
                    })
                }
            }
        }

        if !fin {
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !stream.buf.is_empty() || stream.payload.is_some() {
            return Err(SessionError::H3FrameError {
                reason: "stream ended inside a frame",
            });
        }
        if !stream.remote_done {
            if let Err(e) = stream.finish_remote(inbound) {
                self.stream_error(stream_id, e);
                return Ok(());
            }
            self.events.push_back(H3Event::Data {
                stream_id,
                data: Bytes::new(),
                end_stream: true,
            });
        }
        self.finish_if_closed(stream_id);
        Ok(())
    }

    fn decode_block(&mut self, block: &[u8]) -> Result<Result<MetaData, StreamError>, SessionError> {
        let builder = &mut self.builder;
        builder.reset();

        match self
            .decoder
            .decode_with_cb(block, |name, value| builder.emit(&name, &value))
        {
            Ok(()) => {}
            Err(QpackOrCallbackError::QpackError(e)) => {
                return Err(CompressionError::from(e).into())
            }
            Err(QpackOrCallbackError::CallbackError(e)) => return Err(e),
        }
        Ok(self.builder.build())
    }

    fn on_uni_data(
        &mut self,
        stream_id: QuicStreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<(), SessionError> {
        let entry = self
            .uni
            .entry(stream_id)
            .or_insert_with(|| UniStream::Pending(BytesMut::new()));

        let next = match entry {
            UniStream::Pending(buf) => {
                buf.extend_from_slice(&data);
                match varint(&buf[..]) {
                    Ok((rest, ty)) => {
                        let consumed = buf.len() - rest.len();
                        buf.advance(consumed);
                        UniNext::Typed(ty, buf.split())
                    }
                    Err(_) => UniNext::Wait,
                }
            }
            UniStream::Control(buf) => {
                buf.extend_from_slice(&data);
                UniNext::Control
            }
            UniStream::Qpack => UniNext::Qpack,
            UniStream::Ignored => UniNext::Ignored,
        };

        match next {
            UniNext::Wait => {
                if fin {
                    self.uni.remove(&stream_id);
                }
                Ok(())
            }
            UniNext::Typed(ty, rest) => match StreamType::from_repr(ty) {
                StreamType::Control => {
                    if self.peer_control.is_some() {
                        return Err(SessionError::H3StreamCreation { stream_type: ty });
                    }
                    debug!(%stream_id, "peer control stream");
                    self.peer_control = Some(stream_id);
                    self.uni.insert(stream_id, UniStream::Control(rest));
                    self.read_control(stream_id, fin)
                }
                kind @ (StreamType::QpackEncoder | StreamType::QpackDecoder) => {
                    if self.peer_qpack.contains(&kind) {
                        return Err(SessionError::H3StreamCreation { stream_type: ty });
                    }
                    self.peer_qpack.push(kind);
                    self.uni.insert(stream_id, UniStream::Qpack);
                    if fin {
                        return Err(SessionError::H3ClosedCriticalStream);
                    }
                    Ok(())
                }
                StreamType::Push => match self.role {
                    Role::Server => Err(SessionError::H3StreamCreation { stream_type: ty }),
                    Role::Client => Err(SessionError::H3IdError {
                        stream_id: stream_id.0,
                    }),
                },
                StreamType::Unknown(_) => {
                    trace!(%stream_id, ty = %format!("{ty:#x}"), "ignoring unknown stream type");
                    self.uni.insert(stream_id, UniStream::Ignored);
                    Ok(())
                }
            },
            UniNext::Control => self.read_control(stream_id, fin),
            UniNext::Qpack if fin => Err(SessionError::H3ClosedCriticalStream),
            UniNext::Qpack | UniNext::Ignored => Ok(()),
        }
    }

    fn read_control(&mut self, stream_id: QuicStreamId, fin: bool) -> Result<(), SessionError> {
        loop {
            let Some(UniStream::Control(buf)) = self.uni.get_mut(&stream_id) else {
                return Ok(());
            };
            if buf.is_empty() {
                break;
            }
            let (header, header_len) = match H3FrameHeader::parse(&buf[..]) {
                Ok((rest, header)) => (header, buf.len() - rest.len()),
                Err(_) => break,
            };
            if header.len > MAX_CONTROL_FRAME_SIZE {
                return Err(SessionError::H3ExcessiveLoad {
                    len: header.len,
                    max: MAX_CONTROL_FRAME_SIZE,
                });
            }
            let total = header_len + header.len as usize;
            if buf.len() < total {
                break;
            }
            buf.advance(header_len);
            let payload = buf.split_to(header.len as usize).freeze();
            self.on_control_frame(header.frame_type, payload)?;
        }

        if fin {
            return Err(SessionError::H3ClosedCriticalStream);
        }
        Ok(())
    }

    fn on_control_frame(&mut self, frame_type: H3FrameType, payload: Bytes) -> Result<(), SessionError> {
        trace!(?frame_type, len = %payload.len(), "< control");
        if self.remote_settings.is_none() {
            if frame_type != H3FrameType::Settings {
                return Err(SessionError::H3MissingSettings);
            }
            let settings = H3Settings::parse(&payload)?;
            debug!(?settings, "Received peer settings");
            self.remote_settings = Some(settings);
            self.events.push_back(H3Event::Settings(settings));
            return Ok(());
        }

        match frame_type {
            H3FrameType::GoAway => {
                let id = match varint(&payload) {
                    Ok((rest, id)) if rest.is_empty() => id,
                    _ => {
                        return Err(SessionError::H3FrameError {
                            reason: "malformed GOAWAY",
                        })
                    }
                };
                self.on_go_away(id)
            }
            H3FrameType::MaxPushId if self.role == Role::Server => {
                trace!("ignoring MAX_PUSH_ID, we never push");
                Ok(())
            }
            H3FrameType::CancelPush => Ok(()),
            H3FrameType::Unknown(_) => Ok(()),
            other => Err(SessionError::H3FrameUnexpected {
                frame_type: other.repr(),
            }),
        }
    }

    fn on_go_away(&mut self, id: u64) -> Result<(), SessionError> {
        debug!(%id, "Received GoAway");
        if self.role == Role::Client && !QuicStreamId(id).is_client_initiated() {
            return Err(SessionError::H3IdError { stream_id: id });
        }
        if self.go_away_received.is_some_and(|previous| id > previous) {
            return Err(SessionError::H3IdError { stream_id: id });
        }
        self.go_away_received = Some(id);

        if self.role == Role::Client {
            let refused: Vec<QuicStreamId> = self
                .streams
                .keys()
                .filter(|stream_id| stream_id.0 >= id)
                .copied()
                .collect();
            for stream_id in refused {
                self.streams.remove(&stream_id);
                self.events.push_back(H3Event::StreamFailed {
                    stream_id,
                    error: StreamError::RefusedStream,
                });
            }
        }
        self.events.push_back(H3Event::GoAway { id });
        Ok(())
    }

    fn on_stream_reset(&mut self, stream_id: QuicStreamId, error_code: u64) -> Result<(), SessionError> {
        if self.peer_control == Some(stream_id) || matches!(self.uni.get(&stream_id), Some(UniStream::Qpack)) {
            return Err(SessionError::H3ClosedCriticalStream);
        }
        if self.streams.remove(&stream_id).is_some() {
            debug!(%stream_id, %error_code, "stream reset by peer");
            self.events.push_back(H3Event::StreamFailed {
                stream_id,
                error: StreamError::ResetH3(error_code),
            });
        } else {
            self.uni.remove(&stream_id);
        }
        Ok(())
    }

    fn write_headers(
        &mut self,
        stream_id: QuicStreamId,
        meta: &MetaData,
        fin: bool,
    ) -> Result<(), StreamError> {
        let fields = meta.to_fields();
        if let Some(max) = self.remote_settings.and_then(|s| s.max_field_section_size) {
            let size: usize = fields
                .iter()
                .map(|(name, value)| weir_hpack::entry_size(name, value))
                .sum();
            if size as u64 > max {
                return Err(StreamError::HeaderListTooLarge {
                    size,
                    max: max as usize,
                });
            }
        }

        let mut block = Vec::new();
        self.encoder.encode_into(
            fields.iter().map(|(name, value)| (*name, value.as_ref())),
            &mut block,
        );
        trace!(%stream_id, ?meta, %fin, ">");
        self.transmits.push_back(Transmit::StreamData {
            stream_id,
            data: encode_frame(H3FrameType::Headers, &block),
            fin,
        });
        Ok(())
    }

    fn stream_error(&mut self, stream_id: QuicStreamId, error: StreamError) {
        let error_code = error.as_h3_error_code();
        debug!(%stream_id, ?error_code, "Resetting stream because: {error}");
        self.transmits.push_back(Transmit::ResetStream {
            stream_id,
            error_code: error_code.repr(),
        });
        if self.streams.remove(&stream_id).is_some() {
            self.events
                .push_back(H3Event::StreamFailed { stream_id, error });
        }
    }

    fn finish_if_closed(&mut self, stream_id: QuicStreamId) {
        if self.streams.get(&stream_id).is_some_and(|s| s.is_closed()) {
            trace!(%stream_id, "stream closed");
            self.streams.remove(&stream_id);
        }
    }

    fn fail(&mut self, error: SessionError) {
        if self.closed {
            return;
        }
        let error_code = error.as_h3_error_code();
        debug!("Connection error: {error} (code {error_code:?})");
        self.transmits.push_back(Transmit::CloseConnection {
            error_code: error_code.repr(),
            reason: Bytes::from(error.to_string()),
        });
        self.fail_all_streams(StreamError::SessionClosed);
        self.events.push_back(H3Event::Failed(error));
        self.close_now();
    }

    fn fail_all_streams(&mut self, error: StreamError) {
        let streams = std::mem::take(&mut self.streams);
        for stream_id in streams.into_keys() {
            self.events.push_back(H3Event::StreamFailed {
                stream_id,
                error: error.clone(),
            });
        }
    }

    fn maybe_close_drained(&mut self) {
        if self.closed {
            return;
        }
        if (self.go_away_sent.is_some() || self.go_away_received.is_some()) && self.streams.is_empty()
        {
            debug!("no streams left after GoAway");
            self.transmits.push_back(Transmit::CloseConnection {
                error_code: H3ErrorCode::NoError.repr(),
                reason: Bytes::new(),
            });
            self.close_now();
        }
    }

    fn close_now(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.push_back(H3Event::Closed);
    }
}

fn encode_frame(frame_type: H3FrameType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    // writing to a BytesMut can't fail
    let _ = H3FrameHeader::new(frame_type, payload.len() as u64).write_into((&mut buf).writer());
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::meta::{Request, Response};

    /// Moves transmits from one session to the other until both are quiet
    fn pump(a: &mut H3Session, b: &mut H3Session) {
        for _ in 0..100 {
            let mut moved = false;
            for flip in [false, true] {
                let (from, to) = if flip { (&mut *b, &mut *a) } else { (&mut *a, &mut *b) };
                while let Some(t) = from.poll_transmit() {
                    moved = true;
                    match t {
                        Transmit::StreamData {
                            stream_id,
                            data,
                            fin,
                        } => to.handle(QuicEvent::StreamData {
                            stream_id,
                            data,
                            fin,
                        }),
                        Transmit::ResetStream {
                            stream_id,
                            error_code,
                        } => to.handle(QuicEvent::StreamReset {
                            stream_id,
                            error_code,
                        }),
                        Transmit::CloseConnection { .. } => to.handle(QuicEvent::ConnectionClosed),
                    }
                }
            }
            if !moved {
                return;
            }
        }
        panic!("sessions never went quiet");
    }

    fn events(session: &mut H3Session) -> Vec<H3Event> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    fn connected() -> (H3Session, H3Session) {
        let mut client = H3Session::new(Role::Client, Default::default());
        let mut server = H3Session::new(Role::Server, Default::default());
        pump(&mut client, &mut server);
        assert!(matches!(events(&mut client)[..], [H3Event::Settings(_)]));
        assert!(matches!(events(&mut server)[..], [H3Event::Settings(_)]));
        (client, server)
    }

    fn get(path: &str) -> MetaData {
        MetaData::Request(Request::new(
            Method::GET,
            format!("https://example.org{path}").parse().unwrap(),
        ))
    }

    #[test]
    fn test_request_response_round_trip() {
        let (mut client, mut server) = connected();
        let stream_id = client.new_stream(get("/"), true).unwrap();
        assert_eq!(stream_id, QuicStreamId(0));
        pump(&mut client, &mut server);

        let evs = events(&mut server);
        let [H3Event::Headers {
            stream_id: id,
            meta: MetaData::Request(req),
            end_stream: true,
        }] = &evs[..]
        else {
            panic!("expected a request, got {evs:?}");
        };
        assert_eq!(*id, stream_id);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.path.as_ref().map(|p| p.as_str()), Some("/"));

        let response = MetaData::Response(Response::new(StatusCode::OK));
        server.send_headers(stream_id, response.clone(), false).unwrap();
        server
            .send_data(stream_id, Bytes::from_static(b"hello"), true)
            .unwrap();
        pump(&mut client, &mut server);

        assert_eq!(
            events(&mut client),
            vec![
                H3Event::Headers {
                    stream_id,
                    meta: response,
                    end_stream: false
                },
                H3Event::Data {
                    stream_id,
                    data: Bytes::from_static(b"hello"),
                    end_stream: true
                },
            ]
        );
        assert_eq!(client.active_streams(), 0);
        assert_eq!(server.active_streams(), 0);
    }

    #[test]
    fn test_data_split_across_packets() {
        let (mut client, mut server) = connected();
        let mut server_out = Vec::new();
        client.new_stream(get("/"), true).unwrap();
        pump(&mut client, &mut server);
        events(&mut server);

        server
            .send_headers(QuicStreamId(0), MetaData::Response(Response::new(StatusCode::OK)), false)
            .unwrap();
        server
            .send_data(QuicStreamId(0), Bytes::from_static(b"0123456789"), true)
            .unwrap();
        while let Some(t) = server.poll_transmit() {
            server_out.push(t);
        }
        let mut wire = BytesMut::new();
        for t in server_out {
            if let Transmit::StreamData { data, .. } = t {
                wire.extend_from_slice(&data);
            }
        }
        // one byte at a time
        let len = wire.len();
        for i in 0..len {
            client.handle(QuicEvent::StreamData {
                stream_id: QuicStreamId(0),
                data: wire.split_to(1).freeze(),
                fin: i == len - 1,
            });
        }

        let body: Vec<u8> = events(&mut client)
            .into_iter()
            .filter_map(|ev| match ev {
                H3Event::Data { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"0123456789");
        assert_eq!(client.active_streams(), 0);
    }

    #[test]
    fn test_control_stream_must_start_with_settings() {
        let mut server = H3Session::new(Role::Server, Default::default());
        let mut data = BytesMut::new();
        let _ = weir_h3::write_varint((&mut data).writer(), StreamType::Control.repr());
        data.put(encode_frame(H3FrameType::GoAway, &[0]));
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(2),
            data: data.freeze(),
            fin: false,
        });
        assert!(server.is_closed());
        assert!(events(&mut server).contains(&H3Event::Failed(SessionError::H3MissingSettings)));
        assert!(std::iter::from_fn(|| server.poll_transmit()).any(|t| matches!(
            t,
            Transmit::CloseConnection { error_code, .. } if error_code == H3ErrorCode::MissingSettings.repr()
        )));
    }

    #[test]
    fn test_closing_the_control_stream_is_fatal() {
        let (_client, mut server) = connected();
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(2),
            data: Bytes::new(),
            fin: true,
        });
        assert!(server.is_closed());
        assert!(events(&mut server).contains(&H3Event::Failed(SessionError::H3ClosedCriticalStream)));
    }

    #[test]
    fn test_second_control_stream_is_fatal() {
        let (_client, mut server) = connected();
        let mut data = BytesMut::new();
        let _ = weir_h3::write_varint((&mut data).writer(), StreamType::Control.repr());
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(6),
            data: data.freeze(),
            fin: false,
        });
        assert!(events(&mut server).contains(&H3Event::Failed(SessionError::H3StreamCreation {
            stream_type: 0
        })));
    }

    #[test]
    fn test_server_initiated_request_stream_is_fatal() {
        let (_client, mut server) = connected();
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(1),
            data: Bytes::from_static(&[0x00, 0x00]),
            fin: false,
        });
        assert!(server.is_closed());
        assert!(events(&mut server).contains(&H3Event::Failed(SessionError::H3StreamCreation {
            stream_type: 0
        })));
    }

    #[test]
    fn test_requests_arriving_out_of_order() {
        let (mut client, mut server) = connected();
        let first = client.new_stream(get("/first"), true).unwrap();
        let second = client.new_stream(get("/second"), true).unwrap();
        assert_eq!((first, second), (QuicStreamId(0), QuicStreamId(4)));

        let mut transmits: Vec<Transmit> = std::iter::from_fn(|| client.poll_transmit()).collect();
        transmits.reverse();
        for t in transmits {
            let Transmit::StreamData {
                stream_id,
                data,
                fin,
            } = t
            else {
                panic!("expected stream data");
            };
            server.handle(QuicEvent::StreamData {
                stream_id,
                data,
                fin,
            });
        }

        let opened: Vec<QuicStreamId> = events(&mut server)
            .into_iter()
            .filter_map(|ev| match ev {
                H3Event::Headers { stream_id, .. } => Some(stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec![second, first]);

        for stream_id in [first, second] {
            server
                .send_headers(stream_id, MetaData::Response(Response::new(StatusCode::OK)), true)
                .unwrap();
        }
        pump(&mut client, &mut server);
        assert_eq!(client.active_streams(), 0);

        // late bytes for a finished stream are dropped, not a new request
        server.handle(QuicEvent::StreamData {
            stream_id: first,
            data: Bytes::new(),
            fin: true,
        });
        assert!(!server.has_stream(first));
        assert_eq!(events(&mut server), vec![]);

        // a gap below the highest id is still a new request
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(12),
            data: Bytes::new(),
            fin: false,
        });
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(8),
            data: Bytes::new(),
            fin: false,
        });
        assert!(server.has_stream(QuicStreamId(8)));
        assert!(server.has_stream(QuicStreamId(12)));
    }

    #[test]
    fn test_reserved_h2_frame_is_unexpected() {
        let (mut client, mut server) = connected();
        client.new_stream(get("/"), false).unwrap();
        pump(&mut client, &mut server);
        // an HTTP/2 WINDOW_UPDATE type on a request stream
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(0),
            data: encode_frame(H3FrameType::from_repr(0x08), &[0x01]),
            fin: false,
        });
        assert!(events(&mut server).contains(&H3Event::Failed(SessionError::H3FrameUnexpected {
            frame_type: 0x08
        })));
    }

    #[test]
    fn test_unknown_frames_and_streams_are_ignored() {
        let (mut client, mut server) = connected();
        let mut data = BytesMut::new();
        let _ = weir_h3::write_varint((&mut data).writer(), 0x21);
        data.put_slice(b"whatever");
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(10),
            data: data.freeze(),
            fin: true,
        });

        client.new_stream(get("/"), false).unwrap();
        pump(&mut client, &mut server);
        server.handle(QuicEvent::StreamData {
            stream_id: QuicStreamId(0),
            data: encode_frame(H3FrameType::Unknown(0x21), b"grease"),
            fin: true,
        });
        assert!(!server.is_closed());
        let evs = events(&mut server);
        assert!(matches!(
            evs.last(),
            Some(H3Event::Data { end_stream: true, .. })
        ));
    }

    #[test]
    fn test_graceful_go_away() {
        let (mut client, mut server) = connected();
        let first = client.new_stream(get("/first"), true).unwrap();
        pump(&mut client, &mut server);
        events(&mut server);

        server.go_away();
        let second = client.new_stream(get("/second"), true).unwrap();
        pump(&mut client, &mut server);

        let evs = events(&mut client);
        assert!(evs.contains(&H3Event::GoAway { id: 4 }));
        assert!(evs.contains(&H3Event::StreamFailed {
            stream_id: second,
            error: StreamError::RefusedStream
        }));
        assert_eq!(
            client.new_stream(get("/third"), true),
            Err(StreamError::RefusedStream)
        );
        assert!(!server.has_stream(second));

        server
            .send_headers(first, MetaData::Response(Response::new(StatusCode::OK)), true)
            .unwrap();
        assert!(server.is_closed());
        pump(&mut client, &mut server);
        assert!(client.is_closed());
    }

    #[test]
    fn test_abort_fails_streams() {
        let (mut client, mut server) = connected();
        let stream_id = client.new_stream(get("/"), true).unwrap();
        pump(&mut client, &mut server);
        events(&mut server);

        server.abort(H3ErrorCode::InternalError);
        assert_eq!(
            events(&mut server),
            vec![
                H3Event::StreamFailed {
                    stream_id,
                    error: StreamError::SessionClosed
                },
                H3Event::Closed
            ]
        );
        pump(&mut client, &mut server);
        assert!(client.is_closed());
    }

    #[test]
    fn test_content_length_mismatch_resets_stream() {
        let (mut client, mut server) = connected();
        let req = Request::new(Method::POST, "https://example.org/upload".parse().unwrap())
            .with_content_length(10);
        let stream_id = client.new_stream(MetaData::Request(req), false).unwrap();
        client
            .send_data(stream_id, Bytes::from_static(b"short"), true)
            .unwrap();
        pump(&mut client, &mut server);

        let evs = events(&mut server);
        assert!(evs.iter().any(|ev| matches!(
            ev,
            H3Event::StreamFailed {
                error: StreamError::DataLengthDoesNotMatchContentLength { .. },
                ..
            }
        )));
        assert!(events(&mut client).iter().any(|ev| matches!(
            ev,
            H3Event::StreamFailed { error: StreamError::ResetH3(code), .. }
                if *code == H3ErrorCode::MessageError.repr()
        )));
    }

    #[test]
    fn test_trailers() {
        let (mut client, mut server) = connected();
        let stream_id = client.new_stream(get("/"), true).unwrap();
        pump(&mut client, &mut server);
        events(&mut server);

        server
            .send_headers(stream_id, MetaData::Response(Response::new(StatusCode::OK)), false)
            .unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        server.send_trailers(stream_id, trailers.clone()).unwrap();
        pump(&mut client, &mut server);

        let evs = events(&mut client);
        assert_eq!(
            evs.last(),
            Some(&H3Event::Headers {
                stream_id,
                meta: MetaData::Fields(trailers),
                end_stream: true
            })
        );
    }
}

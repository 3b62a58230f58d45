use std::collections::{BTreeMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use smallvec::SmallVec;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use weir_h2::{
    ErrorCode, FrameKind, KnownErrorCode, PrioritySpec, Setting, Settings, SettingsError, StreamId,
};

use super::{
    flow::{RecvFlow, Window, DEFAULT_WINDOW_SIZE},
    frame::Frame,
    generator::{GenerateError, Generator},
    parser::Parser,
    stream::{Stream, StreamState},
};
use crate::{
    conf::SessionConf,
    error::{Direction, ErrorLevel, SessionError, StreamError},
    listener::{notify, SessionListener, StreamListener},
    meta::{MetaData, Request},
    Role,
};

/// How many recently reset streams we remember, so that frames the peer
/// sent before seeing our RST_STREAM are ignored instead of treated as
/// protocol errors.
const RECENTLY_RESET_CAPACITY: usize = 64;

/// How to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayKind {
    /// Let streams we already processed finish, refuse new ones
    Graceful,
    /// Fail everything now, with this error code
    Abort(ErrorCode),
}

/// An HTTP/2 connection, without the I/O: bytes go in through
/// [Session::receive], bytes come out through [Session::take_output], and
/// events reach the application through its listeners.
///
/// Inbound frames are processed one at a time, in order. Nothing in here
/// blocks or spawns.
pub struct Session {
    role: Role,
    conf: SessionConf,

    /// What we announced and the peer acknowledged (or that we apply
    /// eagerly, for the initial settings)
    local_settings: Settings,
    /// What we announced and the peer hasn't acknowledged yet
    unacked_settings: VecDeque<Settings>,
    remote_settings: Settings,

    parser: Parser,
    generator: Generator,
    out: BytesMut,

    listener: Box<dyn SessionListener>,
    streams: BTreeMap<StreamId, Stream>,
    recently_reset: VecDeque<StreamId>,

    conn_send: Window,
    conn_recv: RecvFlow,

    next_local_id: u32,
    /// Highest stream id the peer used
    last_remote_id: StreamId,
    /// Highest peer stream we handed to the application
    last_processed_id: StreamId,

    go_away_sent: Option<StreamId>,
    go_away_received: Option<StreamId>,
    closed: bool,
}

impl Session {
    pub fn new(role: Role, conf: SessionConf, listener: Box<dyn SessionListener>) -> Self {
        let local_settings = conf.local_settings();
        let parser = Parser::new(role, &local_settings);
        let mut generator = Generator::new(role);
        generator.set_max_header_fragment_size(conf.max_header_fragment_size);

        Self {
            role,
            local_settings,
            unacked_settings: Default::default(),
            remote_settings: Default::default(),
            parser,
            generator,
            out: Default::default(),
            listener,
            streams: Default::default(),
            recently_reset: Default::default(),
            conn_send: Window::new(DEFAULT_WINDOW_SIZE),
            conn_recv: RecvFlow::new(DEFAULT_WINDOW_SIZE),
            next_local_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            last_remote_id: StreamId::CONNECTION,
            last_processed_id: StreamId::CONNECTION,
            go_away_sent: None,
            go_away_received: None,
            closed: false,
            conf,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// The highest peer-initiated stream we processed, as announced in
    /// GOAWAY.
    pub fn last_processed_stream_id(&self) -> StreamId {
        self.last_processed_id
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get(&stream_id).map(|s| s.state())
    }

    /// Bytes queued on `stream_id` waiting for flow-control credit
    pub fn pending_data(&self, stream_id: StreamId) -> usize {
        self.streams
            .get(&stream_id)
            .map(|s| s.pending_len())
            .unwrap_or_default()
    }

    /// The stream's send window, shared with the session.
    pub fn send_window(&self, stream_id: StreamId) -> Option<Window> {
        self.streams.get(&stream_id).map(|s| s.send_window.clone())
    }

    pub fn connection_send_window(&self) -> Window {
        self.conn_send.clone()
    }

    /// Queues the connection preface: the client magic, our SETTINGS, and a
    /// WINDOW_UPDATE if the connection window is configured above 65535.
    pub fn preface(&mut self) {
        let values = self.local_settings.non_default_pairs();
        debug!(role = ?self.role, ?values, "Sending initial settings");
        if let Err(e) = self.generator.generate_preface(&mut self.out, &values) {
            warn!("could not write preface: {e}");
        }
        self.unacked_settings.push_back(self.local_settings);

        if let Some(increment) = self.conn_recv.grow_to(self.conf.connection_window_size) {
            self.send_frame(Frame::WindowUpdate {
                stream_id: StreamId::CONNECTION,
                increment,
            });
        }
    }

    /// Processes every complete frame in `buf`. Partial frames are left in
    /// the buffer for next time.
    pub fn receive(&mut self, buf: &mut BytesMut) {
        while !self.closed {
            match self.parser.parse(buf) {
                Ok(Some(frame)) => {
                    debug!(?frame, "<");
                    self.handle_frame(frame);
                }
                Ok(None) => break,
                Err(e) => self.handle_error(e),
            }
        }
        self.after_op();
    }

    /// Everything written since the last call
    pub fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    pub fn wants_write(&self) -> bool {
        !self.out.is_empty()
    }

    /// Opens a stream by sending a request. Clients only.
    pub fn new_stream(
        &mut self,
        meta: MetaData,
        end_stream: bool,
        listener: Box<dyn StreamListener>,
    ) -> Result<StreamId, StreamError> {
        if self.role != Role::Client {
            return Err(StreamError::InvalidState {
                what: "requests from a server",
            });
        }
        if !meta.is_request() {
            return Err(StreamError::InvalidState {
                what: "a stream without a request",
            });
        }
        if self.closed {
            return Err(StreamError::SessionClosed);
        }
        if self.go_away_sent.is_some() || self.go_away_received.is_some() {
            debug!("refusing new stream, session is going away");
            return Err(StreamError::RefusedStream);
        }
        if let Some(max) = self.remote_settings.max_concurrent_streams {
            if self.local_active() >= max as usize {
                debug!(%max, "refusing new stream, peer's concurrency limit reached");
                return Err(StreamError::RefusedStream);
            }
        }
        if self.next_local_id > StreamId::MAX.0 {
            debug!("stream ids exhausted, going away");
            self.go_away(GoAwayKind::Graceful);
            return Err(StreamError::RefusedStream);
        }

        let stream_id = StreamId(self.next_local_id);
        self.next_local_id += 2;

        let mut stream = Stream::new(
            stream_id,
            StreamState::Idle,
            Direction::Response,
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
            listener,
        );
        stream.send_headers(&meta, end_stream)?;
        self.write_headers(&Frame::Headers {
            stream_id,
            meta,
            priority: None,
            end_stream,
        })?;
        self.streams.insert(stream_id, stream);
        self.after_op();
        Ok(stream_id)
    }

    /// Promises a pushed response for `request` on stream `stream_id`.
    /// Servers only, and only if the client enabled push.
    pub fn push_promise(
        &mut self,
        stream_id: StreamId,
        request: Request,
        listener: Box<dyn StreamListener>,
    ) -> Result<StreamId, StreamError> {
        if self.role != Role::Server || !self.remote_settings.enable_push {
            return Err(StreamError::InvalidState { what: "push promises" });
        }
        if self.go_away_sent.is_some() || self.go_away_received.is_some() {
            return Err(StreamError::RefusedStream);
        }
        match self.streams.get(&stream_id) {
            Some(parent) if parent.state().can_send() => {}
            Some(_) => return Err(StreamError::StreamClosed),
            None => return Err(StreamError::StreamClosed),
        }
        if self.next_local_id > StreamId::MAX.0 {
            return Err(StreamError::RefusedStream);
        }

        let promised_stream_id = StreamId(self.next_local_id);
        self.next_local_id += 2;
        self.write_headers(&Frame::PushPromise {
            stream_id,
            promised_stream_id,
            meta: MetaData::Request(request),
        })?;
        self.streams.insert(
            promised_stream_id,
            Stream::new(
                promised_stream_id,
                StreamState::ReservedLocal,
                Direction::Request,
                self.remote_settings.initial_window_size,
                self.local_settings.initial_window_size,
                listener,
            ),
        );
        Ok(promised_stream_id)
    }

    /// Sends a header block on an open stream: a response (informational
    /// ones included), or a request on a reserved stream.
    pub fn send_headers(
        &mut self,
        stream_id: StreamId,
        meta: MetaData,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        if matches!(meta, MetaData::Fields(_)) {
            return Err(StreamError::InvalidState {
                what: "headers without pseudo-headers",
            });
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamClosed)?;
        stream.send_headers(&meta, end_stream)?;

        let res = self.write_headers(&Frame::Headers {
            stream_id,
            meta,
            priority: None,
            end_stream,
        });
        if let Err(e) = res {
            // the stream thinks the headers went out, it can't go on
            self.stream_error(stream_id, e.clone());
            self.after_op();
            return Err(e);
        }
        self.finish_if_closed(stream_id);
        self.after_op();
        Ok(())
    }

    /// Queues body data. It goes out as flow control allows.
    pub fn send_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamClosed)?
            .queue_data(data, end_stream)?;
        self.after_op();
        Ok(())
    }

    /// Queues trailers, which end the stream once queued data is out.
    pub fn send_trailers(
        &mut self,
        stream_id: StreamId,
        trailers: HeaderMap,
    ) -> Result<(), StreamError> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(StreamError::StreamClosed)?
            .queue_trailers(MetaData::Fields(trailers))?;
        self.after_op();
        Ok(())
    }

    /// Resets a stream. Queued data is dropped.
    pub fn reset(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if self.remove_stream(stream_id).is_none() {
            return;
        }
        debug!(%stream_id, ?error_code, "Sending RstStream");
        self.send_rst(stream_id, error_code);
        self.after_op();
    }

    pub fn ping(&mut self, payload: [u8; 8]) {
        self.send_frame(Frame::Ping {
            ack: false,
            payload,
        });
    }

    /// Announces new settings. Limits on what we accept take effect once
    /// the peer acknowledges them.
    pub fn update_settings(&mut self, settings: Settings) {
        let current = self.unacked_settings.back().unwrap_or(&self.local_settings);
        let values = settings_delta(current, &settings);
        if values.is_empty() {
            return;
        }
        self.unacked_settings.push_back(settings);
        self.send_frame(Frame::Settings { ack: false, values });
    }

    /// The application consumed `n` bytes of body from `stream_id`:
    /// flow-control credit goes back to the peer once enough has piled up.
    pub fn consume(&mut self, stream_id: StreamId, n: usize) {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            // credit was given back when the stream went away
            return;
        };
        let n = n.min(stream.unconsumed);
        stream.unconsumed -= n;
        let update = if stream.state().can_recv() {
            stream.recv.release(n)
        } else {
            None
        };
        if let Some(increment) = update {
            self.send_frame(Frame::WindowUpdate {
                stream_id,
                increment,
            });
        }
        self.release_connection(n);
    }

    pub fn go_away(&mut self, kind: GoAwayKind) {
        if self.closed {
            return;
        }
        let last_stream_id = self.last_processed_id;
        match kind {
            GoAwayKind::Graceful => {
                if self.go_away_sent.is_some() {
                    return;
                }
                debug!(%last_stream_id, "Sending graceful GoAway");
                self.go_away_sent = Some(last_stream_id);
                self.send_frame(Frame::GoAway {
                    last_stream_id,
                    error_code: KnownErrorCode::NoError.into(),
                    debug_data: Bytes::new(),
                });
                self.after_op();
            }
            GoAwayKind::Abort(error_code) => {
                debug!(%last_stream_id, ?error_code, "Sending GoAway");
                self.go_away_sent = Some(last_stream_id);
                self.send_frame(Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: Bytes::new(),
                });
                self.fail_all_streams(StreamError::SessionClosed);
                self.close_now();
            }
        }
    }

    /// Streams idle for longer than the configured timeout go through
    /// `on_idle_timeout`, and get reset unless the listener keeps them.
    pub fn check_idle(&mut self, now: Instant) {
        let Some(timeout) = self.conf.stream_idle_timeout else {
            return;
        };
        let expired: SmallVec<[StreamId; 8]> = self
            .streams
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for stream_id in expired {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            let keep = notify("on_idle_timeout", || {
                Ok(stream.listener.on_idle_timeout(stream_id))
            });
            if keep {
                stream.last_activity = now;
                continue;
            }
            debug!(%stream_id, ?timeout, "stream idle timeout");
            self.stream_error(stream_id, StreamError::IdleTimeout);
        }
        self.after_op();
    }

    /// When [Session::check_idle] should be called next
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        let timeout = self.conf.stream_idle_timeout?;
        self.streams
            .values()
            .map(|s| s.last_activity + timeout)
            .min()
    }

    /// The transport is gone.
    pub fn close(&mut self) {
        self.handle_frame(Frame::Disconnect);
    }

    fn handle_frame(&mut self, frame: Frame) {
        if let Err(e) = self.process_frame(frame) {
            self.handle_error(e);
        }
    }

    fn handle_error(&mut self, e: ErrorLevel) {
        match e {
            ErrorLevel::Stream(stream_id, e) => {
                debug!(%stream_id, "Sending rst because: {e}");
                self.stream_error(stream_id, e);
            }
            ErrorLevel::Session(error) => self.handle_frame(Frame::Failure { error }),
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<(), ErrorLevel> {
        match frame {
            Frame::Preface => {
                notify("on_accept", || self.listener.on_accept());
            }
            Frame::Settings { ack: true, .. } => self.on_settings_ack(),
            Frame::Settings { ack: false, values } => self.on_settings(values)?,
            Frame::Ping { ack: true, payload } => {
                notify("on_ping", || self.listener.on_ping(payload));
            }
            Frame::Ping {
                ack: false,
                payload,
            } => self.send_frame(Frame::Ping { ack: true, payload }),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => self.on_go_away(last_stream_id, error_code, debug_data),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_window_update(stream_id, increment)?,
            Frame::Headers {
                stream_id,
                meta,
                priority,
                end_stream,
            } => self.on_headers(stream_id, meta, priority, end_stream)?,
            Frame::Data {
                stream_id,
                data,
                end_stream,
                padding,
            } => self.on_data(stream_id, data, end_stream, padding)?,
            Frame::RstStream {
                stream_id,
                error_code,
            } => self.on_rst(stream_id, error_code)?,
            Frame::Priority { stream_id, spec } => {
                trace!(%stream_id, ?spec, "received priority, ignoring");
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                meta,
            } => self.on_push_promise(stream_id, promised_stream_id, meta)?,
            Frame::Continuation { stream_id, .. } => {
                // the parser reassembles header blocks
                return Err(SessionError::UnexpectedContinuationFrame { stream_id }.into());
            }
            Frame::Disconnect => {
                if !self.closed {
                    debug!("Peer hung up");
                    self.fail_all_streams(StreamError::SessionClosed);
                    self.close_now();
                }
            }
            Frame::Failure { error } => self.on_failure(error),
        }
        Ok(())
    }

    fn on_failure(&mut self, error: SessionError) {
        if self.closed {
            return;
        }
        let error_code = error.as_known_error_code();
        debug!("Connection error: {error} ({error:?}) (code {error_code:?})");

        let last_stream_id = self.last_processed_id;
        debug!(%last_stream_id, ?error_code, "Sending GoAway");
        self.go_away_sent = Some(last_stream_id);
        self.send_frame(Frame::GoAway {
            last_stream_id,
            error_code: error_code.into(),
            debug_data: Bytes::from(error.to_string()),
        });
        self.fail_all_streams(StreamError::SessionClosed);
        notify("on_failure", || self.listener.on_failure(&error));
        self.close_now();
    }

    fn on_settings(&mut self, values: Vec<(Setting, u32)>) -> Result<(), ErrorLevel> {
        for (setting, value) in values {
            match setting {
                Setting::InitialWindowSize => {
                    let delta = value as i64 - self.remote_settings.initial_window_size as i64;
                    for (stream_id, stream) in self.streams.iter() {
                        stream.send_window.adjust(delta).map_err(|_| {
                            SessionError::StreamWindowSizeOverflowDueToSettings {
                                stream_id: *stream_id,
                            }
                        })?;
                    }
                }
                Setting::HeaderTableSize => self.generator.set_header_table_size(value),
                Setting::MaxFrameSize => self.generator.set_max_frame_size(value),
                Setting::MaxHeaderListSize => self.generator.set_max_header_list_size(value),
                Setting::EnablePush if self.role == Role::Client && value != 0 => {
                    return Err(SessionError::BadSettingValue(
                        SettingsError::InvalidEnablePushValue { actual: value },
                    )
                    .into());
                }
                Setting::EnablePush | Setting::MaxConcurrentStreams => {}
            }
            self.remote_settings
                .apply(setting, value)
                .map_err(SessionError::from)?;
        }

        debug!("Acknowledging peer settings");
        self.send_frame(Frame::Settings {
            ack: true,
            values: Vec::new(),
        });
        notify("on_settings", || {
            self.listener.on_settings(&self.remote_settings)
        });
        Ok(())
    }

    fn on_settings_ack(&mut self) {
        let Some(settings) = self.unacked_settings.pop_front() else {
            debug!("Peer acknowledged settings we never sent, ignoring");
            return;
        };
        debug!("Peer has acknowledged our settings");

        self.parser.set_max_frame_size(settings.max_frame_size);
        self.parser
            .set_max_header_list_size(settings.max_header_list_size);
        self.parser.set_header_table_size(settings.header_table_size);
        self.parser
            .set_enable_push(self.role == Role::Client && settings.enable_push);

        if settings.initial_window_size != self.local_settings.initial_window_size {
            for (stream_id, stream) in self.streams.iter_mut() {
                if stream.recv.retarget(settings.initial_window_size).is_err() {
                    warn!(%stream_id, "could not apply new initial window size");
                }
            }
        }
        self.local_settings = settings;
    }

    fn on_go_away(&mut self, last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) {
        debug!(%last_stream_id, ?error_code, "Received GoAway");
        self.go_away_received = Some(last_stream_id);

        // ours, and never processed: safe to retry elsewhere
        let refused: SmallVec<[StreamId; 8]> = self
            .streams
            .keys()
            .filter(|id| !self.is_remote_initiated(**id) && **id > last_stream_id)
            .copied()
            .collect();
        for stream_id in refused {
            if let Some(mut stream) = self.remove_stream(stream_id) {
                notify("on_failure", || {
                    stream
                        .listener
                        .on_failure(stream_id, &StreamError::RefusedStream)
                });
            }
        }

        notify("on_go_away", || {
            self.listener
                .on_go_away(last_stream_id, error_code, &debug_data)
        });

        if error_code != KnownErrorCode::NoError.into() {
            self.fail_all_streams(StreamError::SessionClosed);
            let error = SessionError::GoAway { error_code };
            notify("on_failure", || self.listener.on_failure(&error));
            self.close_now();
        }
    }

    fn on_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<(), ErrorLevel> {
        if stream_id == StreamId::CONNECTION {
            self.conn_send
                .increase(increment)
                .map_err(|_| SessionError::WindowUpdateOverflow)?;
            trace!(capacity = %self.conn_send.available(), "connection window update");
            return Ok(());
        }

        match self.streams.get(&stream_id) {
            Some(stream) => {
                stream
                    .send_window
                    .increase(increment)
                    .map_err(|_| ErrorLevel::Stream(stream_id, StreamError::WindowUpdateOverflow))?;
                trace!(%stream_id, capacity = %stream.send_window.available(), "stream window update");
                Ok(())
            }
            None if self.is_idle(stream_id) => Err(SessionError::FrameOnIdleStream {
                frame_kind: FrameKind::WindowUpdate,
                stream_id,
            }
            .into()),
            None => Ok(()),
        }
    }

    fn on_rst(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<(), ErrorLevel> {
        match self.remove_stream(stream_id) {
            Some(mut stream) => {
                debug!(%stream_id, ?error_code, "stream reset by peer");
                notify("on_reset", || stream.listener.on_reset(stream_id, error_code));
                Ok(())
            }
            None if self.is_idle(stream_id) => Err(SessionError::FrameOnIdleStream {
                frame_kind: FrameKind::RstStream,
                stream_id,
            }
            .into()),
            None => Ok(()),
        }
    }

    fn on_headers(
        &mut self,
        stream_id: StreamId,
        meta: MetaData,
        priority: Option<PrioritySpec>,
        end_stream: bool,
    ) -> Result<(), ErrorLevel> {
        if let Some(spec) = priority {
            if spec.stream_dependency == stream_id {
                return Err(ErrorLevel::Stream(
                    stream_id,
                    StreamError::SelfDependency { stream_id },
                ));
            }
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream
                .recv_headers(&meta, end_stream)
                .map_err(|e| ErrorLevel::Stream(stream_id, e))?;
            notify("on_headers", || {
                stream.listener.on_headers(stream_id, meta, end_stream)
            });
            self.finish_if_closed(stream_id);
            return Ok(());
        }

        if self.recently_reset.contains(&stream_id) {
            trace!(%stream_id, "ignoring headers for a stream we reset");
            return Ok(());
        }

        if !self.is_remote_initiated(stream_id) {
            return Err(if stream_id.0 >= self.next_local_id {
                SessionError::FrameOnIdleStream {
                    frame_kind: FrameKind::Headers,
                    stream_id,
                }
            } else {
                SessionError::StreamClosed { stream_id }
            }
            .into());
        }

        if self.role == Role::Client {
            // servers only open streams by promising them first
            return Err(if stream_id > self.last_remote_id {
                SessionError::FrameOnIdleStream {
                    frame_kind: FrameKind::Headers,
                    stream_id,
                }
            } else {
                SessionError::StreamClosed { stream_id }
            }
            .into());
        }

        if stream_id < self.last_remote_id {
            return Err(SessionError::StreamIdShouldIncrease {
                stream_id,
                last_stream_id: self.last_remote_id,
            }
            .into());
        }
        if stream_id == self.last_remote_id {
            return Err(SessionError::StreamClosed { stream_id }.into());
        }
        self.last_remote_id = stream_id;

        if let Some(last) = self.go_away_sent {
            if stream_id > last {
                debug!(%stream_id, %last, "refusing stream opened after GoAway");
                self.refuse(stream_id);
                return Ok(());
            }
        }
        if let Some(max) = self.local_settings.max_concurrent_streams {
            if self.remote_active() >= max as usize {
                debug!(%stream_id, %max, "refusing stream, too many concurrent streams");
                self.refuse(stream_id);
                return Ok(());
            }
        }

        let listener = notify("on_new_stream", || {
            Ok(self.listener.on_new_stream(stream_id))
        });
        let Some(listener) = listener else {
            debug!(%stream_id, "listener refused stream");
            self.refuse(stream_id);
            return Ok(());
        };

        let mut stream = Stream::new(
            stream_id,
            StreamState::Idle,
            Direction::Request,
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
            listener,
        );
        let res = stream.recv_headers(&meta, end_stream);
        self.last_processed_id = stream_id;
        self.streams.insert(stream_id, stream);
        res.map_err(|e| ErrorLevel::Stream(stream_id, e))?;

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            notify("on_headers", || {
                stream.listener.on_headers(stream_id, meta, end_stream)
            });
        }
        self.finish_if_closed(stream_id);
        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
        padding: u16,
    ) -> Result<(), ErrorLevel> {
        let data_len = data.len() as u32;
        let flow_len = data_len + padding as u32;
        if !self.conn_recv.receive(flow_len) {
            return Err(SessionError::WindowUnderflow.into());
        }

        let outcome = match self.streams.get_mut(&stream_id) {
            None => Err(None),
            Some(stream) => {
                if !stream.recv.receive(flow_len) {
                    Err(Some(StreamError::FlowControlViolation))
                } else {
                    match stream.recv_data(data.len(), end_stream) {
                        Err(e) => Err(Some(e)),
                        Ok(()) => {
                            stream.unconsumed += data_len;
                            // padding never reaches the application, give it back now
                            let update = match padding {
                                0 => None,
                                _ if stream.state().can_recv() => {
                                    stream.recv.release(padding as u32)
                                }
                                _ => None,
                            };
                            notify("on_data_available", || {
                                stream
                                    .listener
                                    .on_data_available(stream_id, data, end_stream)
                            });
                            Ok(update)
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(update) => {
                if let Some(increment) = update {
                    self.send_frame(Frame::WindowUpdate {
                        stream_id,
                        increment,
                    });
                }
                self.release_connection(padding as u32);
                self.finish_if_closed(stream_id);
                Ok(())
            }
            Err(error) => {
                self.release_connection(flow_len);
                match error {
                    Some(e) => Err(ErrorLevel::Stream(stream_id, e)),
                    None if self.recently_reset.contains(&stream_id) => Ok(()),
                    None if self.is_idle(stream_id) => Err(SessionError::FrameOnIdleStream {
                        frame_kind: FrameKind::Data,
                        stream_id,
                    }
                    .into()),
                    None => Err(ErrorLevel::Stream(stream_id, StreamError::StreamClosed)),
                }
            }
        }
    }

    fn on_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        meta: MetaData,
    ) -> Result<(), ErrorLevel> {
        if !promised_stream_id.is_server_initiated() {
            return Err(SessionError::StreamIdWrongParity {
                stream_id: promised_stream_id,
            }
            .into());
        }
        if promised_stream_id <= self.last_remote_id {
            return Err(SessionError::StreamIdShouldIncrease {
                stream_id: promised_stream_id,
                last_stream_id: self.last_remote_id,
            }
            .into());
        }
        self.last_remote_id = promised_stream_id;

        let request = match meta {
            MetaData::Request(req) if req.method.is_safe() && req.method != http::Method::OPTIONS => {
                req
            }
            _ => {
                return Err(ErrorLevel::Stream(
                    promised_stream_id,
                    StreamError::Malformed {
                        direction: Direction::Request,
                        reason: "pushed requests must be safe and cacheable",
                    },
                ))
            }
        };

        let is_idle = self.is_idle(stream_id);
        let listener = match self.streams.get_mut(&stream_id) {
            Some(parent) if parent.state().can_recv() => notify("on_push_promise", || {
                Ok(parent
                    .listener
                    .on_push_promise(stream_id, promised_stream_id, request))
            }),
            Some(_) => None,
            None if is_idle => {
                return Err(SessionError::FrameOnIdleStream {
                    frame_kind: FrameKind::PushPromise,
                    stream_id,
                }
                .into())
            }
            None => None,
        };
        let Some(listener) = listener else {
            debug!(%promised_stream_id, "refusing pushed stream");
            self.refuse(promised_stream_id);
            return Ok(());
        };

        self.last_processed_id = promised_stream_id;
        self.streams.insert(
            promised_stream_id,
            Stream::new(
                promised_stream_id,
                StreamState::ReservedRemote,
                Direction::Response,
                self.remote_settings.initial_window_size,
                self.local_settings.initial_window_size,
                listener,
            ),
        );
        Ok(())
    }

    fn is_remote_initiated(&self, stream_id: StreamId) -> bool {
        match self.role {
            Role::Server => stream_id.is_client_initiated(),
            Role::Client => stream_id.is_server_initiated(),
        }
    }

    /// Whether `stream_id` was never opened by either side
    fn is_idle(&self, stream_id: StreamId) -> bool {
        if self.is_remote_initiated(stream_id) {
            stream_id > self.last_remote_id
        } else {
            stream_id.0 >= self.next_local_id
        }
    }

    fn local_active(&self) -> usize {
        self.streams
            .iter()
            .filter(|(id, s)| !self.is_remote_initiated(**id) && s.state() != StreamState::ReservedLocal)
            .count()
    }

    fn remote_active(&self) -> usize {
        self.streams
            .iter()
            .filter(|(id, s)| self.is_remote_initiated(**id) && s.state() != StreamState::ReservedRemote)
            .count()
    }

    fn send_frame(&mut self, frame: Frame) {
        debug!(?frame, ">");
        if let Err(e) = self.generator.generate(&mut self.out, &frame) {
            warn!("could not write {:?} frame: {e}", frame.kind());
        }
    }

    fn write_headers(&mut self, frame: &Frame) -> Result<(), StreamError> {
        debug!(?frame, ">");
        match self.generator.generate(&mut self.out, frame) {
            Ok(_) => Ok(()),
            Err(GenerateError::Stream(e)) => Err(e),
            Err(e) => {
                warn!("could not write header block: {e}");
                Err(StreamError::InvalidState {
                    what: "a header block that could not be encoded",
                })
            }
        }
    }

    fn send_rst(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        self.send_frame(Frame::RstStream {
            stream_id,
            error_code,
        });
        if self.recently_reset.len() == RECENTLY_RESET_CAPACITY {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }

    fn refuse(&mut self, stream_id: StreamId) {
        self.send_rst(stream_id, KnownErrorCode::RefusedStream.into());
    }

    /// Resets a stream because of something that went wrong with it
    fn stream_error(&mut self, stream_id: StreamId, error: StreamError) {
        let error_code = error.as_known_error_code();
        debug!(%stream_id, ?error_code, "Sending RstStream");
        self.send_rst(stream_id, error_code.into());

        if self.is_remote_initiated(stream_id) && stream_id > self.last_remote_id {
            self.last_remote_id = stream_id;
        }
        if let Some(mut stream) = self.remove_stream(stream_id) {
            notify("on_failure", || stream.listener.on_failure(stream_id, &error));
        }
    }

    /// Forgets a stream, handing back the connection credit its unread data
    /// was holding.
    fn remove_stream(&mut self, stream_id: StreamId) -> Option<Stream> {
        let mut stream = self.streams.remove(&stream_id)?;
        stream.reset();
        let unconsumed = std::mem::take(&mut stream.unconsumed);
        self.release_connection(unconsumed);
        Some(stream)
    }

    fn finish_if_closed(&mut self, stream_id: StreamId) {
        if self.streams.get(&stream_id).is_some_and(|s| s.is_closed()) {
            trace!(%stream_id, "stream closed");
            self.remove_stream(stream_id);
        }
    }

    fn release_connection(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        if let Some(increment) = self.conn_recv.release(n) {
            self.send_frame(Frame::WindowUpdate {
                stream_id: StreamId::CONNECTION,
                increment,
            });
        }
    }

    fn fail_all_streams(&mut self, error: StreamError) {
        let streams = std::mem::take(&mut self.streams);
        for (stream_id, mut stream) in streams {
            stream.reset();
            notify("on_failure", || stream.listener.on_failure(stream_id, &error));
        }
    }

    fn close_now(&mut self) {
        if self.closed {
            return;
        }
        debug!("session closed");
        self.closed = true;
        notify("on_close", || self.listener.on_close());
    }

    /// Flushes what flow control allows, and closes the session once it is
    /// going away and nothing is left.
    fn after_op(&mut self) {
        if self.closed {
            return;
        }
        self.flush_data();
        if (self.go_away_sent.is_some() || self.go_away_received.is_some())
            && self.streams.is_empty()
        {
            debug!("no streams left after GoAway");
            self.close_now();
        }
    }

    fn flush_data(&mut self) {
        let ids: SmallVec<[StreamId; 8]> = self
            .streams
            .iter()
            .filter(|(_, s)| s.has_pending())
            .map(|(id, _)| *id)
            .collect();
        for stream_id in ids {
            self.flush_stream(stream_id);
        }
    }

    fn flush_stream(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };

        loop {
            let is_last =
                stream.pending.len() == 1 && stream.end_queued && stream.trailers.is_none();
            let Some(chunk) = stream.pending.front_mut() else {
                break;
            };
            let max_len = self
                .conn_send
                .capacity(chunk.len())
                .min(stream.send_window.capacity(chunk.len()));
            if max_len == 0 && !chunk.is_empty() {
                trace!(%stream_id, conn_cap = %self.conn_send.available(), strm_cap = %stream.send_window.available(), "waiting for window");
                break;
            }

            let written = match self.generator.generate_data(
                &mut self.out,
                stream_id,
                &chunk[..],
                is_last,
                max_len,
            ) {
                Ok(written) => written,
                Err(e) => {
                    warn!(%stream_id, "could not write data: {e}");
                    break;
                }
            };
            trace!(%stream_id, %written, end_stream = %is_last, "wrote data");
            // capacity was checked above
            self.conn_send.try_consume(written as u32);
            stream.send_window.try_consume(written as u32);
            chunk.advance(written);

            if !chunk.is_empty() {
                break;
            }
            stream.pending.pop_front();
            if is_last {
                stream.close_local();
            }
        }

        if stream.pending.is_empty() {
            if let Some(meta) = stream.trailers.take() {
                let frame = Frame::Headers {
                    stream_id,
                    meta,
                    priority: None,
                    end_stream: true,
                };
                debug!(?frame, ">");
                if let Err(e) = self.generator.generate(&mut self.out, &frame) {
                    warn!(%stream_id, "could not write trailers: {e}");
                }
                stream.close_local();
            }
        }

        self.finish_if_closed(stream_id);
    }
}

/// The settings that changed between `old` and `new`
fn settings_delta(old: &Settings, new: &Settings) -> Vec<(Setting, u32)> {
    let mut values = Vec::new();
    if old.header_table_size != new.header_table_size {
        values.push((Setting::HeaderTableSize, new.header_table_size));
    }
    if old.enable_push != new.enable_push {
        values.push((Setting::EnablePush, new.enable_push as u32));
    }
    if old.max_concurrent_streams != new.max_concurrent_streams {
        values.push((
            Setting::MaxConcurrentStreams,
            new.max_concurrent_streams.unwrap_or(u32::MAX),
        ));
    }
    if old.initial_window_size != new.initial_window_size {
        values.push((Setting::InitialWindowSize, new.initial_window_size));
    }
    if old.max_frame_size != new.max_frame_size {
        values.push((Setting::MaxFrameSize, new.max_frame_size));
    }
    if old.max_header_list_size != new.max_header_list_size {
        values.push((Setting::MaxHeaderListSize, new.max_header_list_size));
    }
    values
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::BufMut;
    use http::{Method, StatusCode};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::meta::Response;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Headers(StreamId, MetaData, bool),
        Data(StreamId, Bytes, bool),
        Failure(StreamId, StreamError),
        Reset(StreamId, ErrorCode),
        GoAway(StreamId, ErrorCode),
        SessionFailure(SessionError),
        Ping([u8; 8]),
        Closed,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn push(&self, ev: Event) {
            self.0.lock().unwrap().push(ev);
        }

        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        fn received(&self, stream_id: StreamId) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|ev| match ev {
                    Event::Data(id, data, _) if *id == stream_id => data.len(),
                    _ => 0,
                })
                .sum()
        }

        fn has(&self, pred: impl Fn(&Event) -> bool) -> bool {
            self.0.lock().unwrap().iter().any(pred)
        }
    }

    impl StreamListener for Recorder {
        fn on_headers(
            &mut self,
            stream_id: StreamId,
            meta: MetaData,
            end_stream: bool,
        ) -> b_x::Result<()> {
            self.push(Event::Headers(stream_id, meta, end_stream));
            Ok(())
        }

        fn on_data_available(
            &mut self,
            stream_id: StreamId,
            data: Bytes,
            end_stream: bool,
        ) -> b_x::Result<()> {
            self.push(Event::Data(stream_id, data, end_stream));
            Ok(())
        }

        fn on_failure(&mut self, stream_id: StreamId, error: &StreamError) -> b_x::Result<()> {
            self.push(Event::Failure(stream_id, error.clone()));
            Ok(())
        }

        fn on_reset(&mut self, stream_id: StreamId, error_code: ErrorCode) -> b_x::Result<()> {
            self.push(Event::Reset(stream_id, error_code));
            Ok(())
        }
    }

    impl SessionListener for Recorder {
        fn on_new_stream(&mut self, _stream_id: StreamId) -> Option<Box<dyn StreamListener>> {
            Some(Box::new(self.clone()))
        }

        fn on_ping(&mut self, payload: [u8; 8]) -> b_x::Result<()> {
            self.push(Event::Ping(payload));
            Ok(())
        }

        fn on_go_away(
            &mut self,
            last_stream_id: StreamId,
            error_code: ErrorCode,
            _debug_data: &Bytes,
        ) -> b_x::Result<()> {
            self.push(Event::GoAway(last_stream_id, error_code));
            Ok(())
        }

        fn on_failure(&mut self, error: &SessionError) -> b_x::Result<()> {
            self.push(Event::SessionFailure(error.clone()));
            Ok(())
        }

        fn on_close(&mut self) -> b_x::Result<()> {
            self.push(Event::Closed);
            Ok(())
        }
    }

    struct Pair {
        client: Session,
        server: Session,
        client_events: Recorder,
        server_events: Recorder,
    }

    impl Pair {
        fn new(client_conf: SessionConf, server_conf: SessionConf) -> Self {
            let client_events = Recorder::default();
            let server_events = Recorder::default();
            let mut pair = Self {
                client: Session::new(Role::Client, client_conf, Box::new(client_events.clone())),
                server: Session::new(Role::Server, server_conf, Box::new(server_events.clone())),
                client_events,
                server_events,
            };
            pair.client.preface();
            pair.server.preface();
            pair.pump();
            pair
        }

        fn connected() -> Self {
            Self::new(Default::default(), Default::default())
        }

        /// Moves bytes both ways until both sides are quiet
        fn pump(&mut self) {
            for _ in 0..100 {
                if !self.client.wants_write() && !self.server.wants_write() {
                    return;
                }
                let mut buf = BytesMut::from(&self.client.take_output()[..]);
                self.server.receive(&mut buf);
                let mut buf = BytesMut::from(&self.server.take_output()[..]);
                self.client.receive(&mut buf);
            }
            panic!("sessions never went quiet");
        }

        fn get(&mut self, path: &str) -> StreamId {
            let req = Request::new(
                Method::GET,
                format!("https://example.org{path}").parse().unwrap(),
            );
            self.client
                .new_stream(
                    MetaData::Request(req),
                    true,
                    Box::new(self.client_events.clone()),
                )
                .unwrap()
        }
    }

    fn ok_response() -> MetaData {
        MetaData::Response(Response::new(StatusCode::OK))
    }

    #[test]
    fn test_get_round_trip() {
        let mut p = Pair::connected();
        let stream_id = p.get("/");
        p.pump();

        let events = p.server_events.take();
        let Some(Event::Headers(id, MetaData::Request(req), true)) = events.first() else {
            panic!("expected a request, got {events:?}");
        };
        assert_eq!(*id, stream_id);
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.scheme, Some(http::uri::Scheme::HTTPS));
        assert_eq!(req.path.as_ref().map(|p| p.as_str()), Some("/"));

        p.server.send_headers(stream_id, ok_response(), false).unwrap();
        p.server
            .send_data(stream_id, Bytes::from_static(b"hello"), true)
            .unwrap();
        p.pump();

        assert_eq!(
            p.client_events.take(),
            vec![
                Event::Headers(stream_id, ok_response(), false),
                Event::Data(stream_id, Bytes::from_static(b"hello"), true),
            ]
        );
        assert_eq!(p.client.active_streams(), 0);
        assert_eq!(p.server.active_streams(), 0);
    }

    #[test]
    fn test_ping() {
        let mut p = Pair::connected();
        p.client.ping(*b"weirping");
        p.pump();
        assert!(p.client_events.has(|ev| *ev == Event::Ping(*b"weirping")));
    }

    #[test]
    fn test_reset_one_stream_while_another_continues() {
        let mut p = Pair::connected();
        let first = p.get("/first");
        let second = p.get("/second");
        p.pump();

        let body = Bytes::from(vec![b'x'; 100_000]);
        for id in [first, second] {
            p.server.send_headers(id, ok_response(), false).unwrap();
            p.server.send_data(id, body.clone(), true).unwrap();
        }
        p.pump();

        // windows are exhausted, both streams have data waiting
        assert!(p.server.pending_data(first) > 0);
        assert!(p.server.pending_data(second) > 0);

        p.client
            .reset(first, KnownErrorCode::Cancel.into());
        p.pump();
        assert_eq!(p.server.stream_state(first), None);
        assert_eq!(p.server.pending_data(first), 0);
        assert!(p
            .server_events
            .has(|ev| *ev == Event::Reset(first, KnownErrorCode::Cancel.into())));

        // the application reads the second stream, credit flows back
        let mut consumed = 0;
        for _ in 0..100 {
            let received = p.client_events.received(second);
            if received > consumed {
                p.client.consume(second, received - consumed);
                consumed = received;
            }
            p.pump();
            if p.client_events.has(|ev| matches!(ev, Event::Data(id, _, true) if *id == second)) {
                break;
            }
        }
        assert_eq!(p.client_events.received(second), 100_000);
        assert_eq!(p.server.active_streams(), 0);
    }

    #[test]
    fn test_graceful_go_away() {
        let mut p = Pair::connected();
        let first = p.get("/first");
        p.pump();

        // the server goes away while the client opens another stream
        p.server.go_away(GoAwayKind::Graceful);
        let second = p.get("/second");
        p.pump();

        assert!(p.client_events.has(|ev| *ev
            == Event::GoAway(first, KnownErrorCode::NoError.into())));
        assert!(p
            .client_events
            .has(|ev| *ev == Event::Failure(second, StreamError::RefusedStream)));
        assert!(StreamError::RefusedStream.is_retryable());
        assert_eq!(
            p.client.new_stream(
                MetaData::Request(Request::new(
                    Method::GET,
                    "https://example.org/third".parse().unwrap()
                )),
                true,
                Box::new(NoopRecorder),
            ),
            Err(StreamError::RefusedStream)
        );

        // the first stream still completes
        assert!(!p.server.is_closed());
        p.server.send_headers(first, ok_response(), true).unwrap();
        p.pump();
        assert!(p
            .client_events
            .has(|ev| *ev == Event::Headers(first, ok_response(), true)));
        assert!(p.server.is_closed());
        assert!(p.client.is_closed());
    }

    #[derive(Debug)]
    struct NoopRecorder;
    impl StreamListener for NoopRecorder {}

    #[test]
    fn test_abort_go_away_fails_open_streams() {
        let mut p = Pair::connected();
        let first = p.get("/first");
        let second = p.get("/second");
        p.pump();
        p.server_events.take();

        p.server
            .go_away(GoAwayKind::Abort(KnownErrorCode::InternalError.into()));
        assert!(p.server.is_closed());
        let server_events = p.server_events.take();
        assert!(server_events.contains(&Event::Failure(first, StreamError::SessionClosed)));
        assert!(server_events.contains(&Event::Failure(second, StreamError::SessionClosed)));

        let mut buf = BytesMut::from(&p.server.take_output()[..]);
        p.client.receive(&mut buf);
        assert!(p.client.is_closed());
        let client_events = p.client_events.take();
        assert!(client_events.contains(&Event::Failure(first, StreamError::SessionClosed)));
        assert!(client_events.contains(&Event::Failure(second, StreamError::SessionClosed)));
        assert!(client_events.contains(&Event::SessionFailure(SessionError::GoAway {
            error_code: KnownErrorCode::InternalError.into()
        })));
    }

    /// Drives a server session with hand-made frames, returning what it
    /// answered, parsed.
    fn server_answers(server: &mut Session, frames: &[Frame]) -> Vec<Frame> {
        let mut generator = Generator::new(Role::Client);
        let mut buf = BytesMut::new();
        for frame in frames {
            generator.generate(&mut buf, frame).unwrap();
        }
        server.receive(&mut buf);

        let mut parser = Parser::new(Role::Client, &Settings::default());
        let mut out = BytesMut::from(&server.take_output()[..]);
        let mut answers = Vec::new();
        while let Ok(Some(frame)) = parser.parse(&mut out) {
            answers.push(frame);
        }
        answers
    }

    fn started_server() -> (Session, Recorder) {
        let events = Recorder::default();
        let mut server = Session::new(Role::Server, Default::default(), Box::new(events.clone()));
        server.preface();
        let mut buf = BytesMut::from(weir_h2::PREFACE);
        Generator::new(Role::Server)
            .generate(
                &mut buf,
                &Frame::Settings {
                    ack: false,
                    values: vec![],
                },
            )
            .unwrap();
        server.receive(&mut buf);
        server.take_output();
        (server, events)
    }

    fn get_headers(stream_id: u32) -> Frame {
        Frame::Headers {
            stream_id: StreamId(stream_id),
            meta: MetaData::Request(Request::new(
                Method::GET,
                "https://example.org/".parse().unwrap(),
            )),
            priority: None,
            end_stream: true,
        }
    }

    #[test]
    fn test_window_update_overflow_on_stream_resets_it() {
        let (mut server, events) = started_server();
        let answers = server_answers(
            &mut server,
            &[
                get_headers(1),
                Frame::WindowUpdate {
                    stream_id: StreamId(1),
                    increment: (1 << 31) - 1,
                },
            ],
        );
        assert_eq!(
            answers,
            vec![Frame::RstStream {
                stream_id: StreamId(1),
                error_code: KnownErrorCode::FlowControlError.into(),
            }]
        );
        assert!(!server.is_closed());
        assert!(events.has(|ev| *ev == Event::Failure(StreamId(1), StreamError::WindowUpdateOverflow)));
    }

    #[test]
    fn test_window_update_overflow_on_connection_goes_away() {
        let (mut server, events) = started_server();
        let answers = server_answers(
            &mut server,
            &[Frame::WindowUpdate {
                stream_id: StreamId::CONNECTION,
                increment: (1 << 31) - 1,
            }],
        );
        assert!(matches!(
            &answers[..],
            [Frame::GoAway { error_code, .. }] if *error_code == KnownErrorCode::FlowControlError.into()
        ));
        assert!(server.is_closed());
        assert!(events.has(|ev| *ev == Event::SessionFailure(SessionError::WindowUpdateOverflow)));
        assert_eq!(server.connection_send_window().available(), 65535);
    }

    #[test]
    fn test_oversized_headers_are_fatal() {
        let events = Recorder::default();
        let conf = SessionConf {
            max_header_list_size: 128,
            ..Default::default()
        };
        let mut server = Session::new(Role::Server, conf, Box::new(events.clone()));
        server.preface();
        let mut buf = BytesMut::from(weir_h2::PREFACE);
        server.receive(&mut buf);
        server.take_output();

        let req = Request::new(Method::GET, "https://example.org/".parse().unwrap()).with_header(
            http::header::COOKIE,
            http::HeaderValue::from_bytes(&[b'c'; 200]).unwrap(),
        );
        let answers = server_answers(
            &mut server,
            &[Frame::Headers {
                stream_id: StreamId(1),
                meta: MetaData::Request(req),
                priority: None,
                end_stream: true,
            }],
        );
        assert!(matches!(&answers[..], [Frame::GoAway { .. }]));
        assert!(server.is_closed());
        assert!(events.has(|ev| matches!(
            ev,
            Event::SessionFailure(SessionError::HeaderListTooLarge { max: 128, .. })
        )));
    }

    #[test]
    fn test_stream_ids_must_increase() {
        let (mut server, events) = started_server();
        let answers = server_answers(&mut server, &[get_headers(5), get_headers(3)]);
        assert!(matches!(&answers[..], [Frame::GoAway { last_stream_id, error_code, .. }]
            if *last_stream_id == StreamId(5) && *error_code == KnownErrorCode::ProtocolError.into()));
        assert!(events.has(|ev| matches!(
            ev,
            Event::SessionFailure(SessionError::StreamIdShouldIncrease { .. })
        )));
    }

    #[test]
    fn test_data_on_idle_stream_is_fatal() {
        let (mut server, _events) = started_server();
        let answers = server_answers(
            &mut server,
            &[Frame::Data {
                stream_id: StreamId(7),
                data: Bytes::from_static(b"nope"),
                end_stream: false,
                padding: 0,
            }],
        );
        assert!(matches!(&answers[..], [Frame::GoAway { .. }]));
        assert!(server.is_closed());
    }

    #[test]
    fn test_too_many_streams_are_refused() {
        let events = Recorder::default();
        let conf = SessionConf {
            max_concurrent_streams: 1,
            ..Default::default()
        };
        let mut server = Session::new(Role::Server, conf, Box::new(events.clone()));
        server.preface();
        let mut buf = BytesMut::from(weir_h2::PREFACE);
        server.receive(&mut buf);
        server.take_output();

        let answers = server_answers(&mut server, &[get_headers(1), get_headers(3)]);
        assert_eq!(
            answers,
            vec![Frame::RstStream {
                stream_id: StreamId(3),
                error_code: KnownErrorCode::RefusedStream.into(),
            }]
        );
        assert_eq!(server.stream_state(StreamId(1)), Some(StreamState::HalfClosedRemote));
    }

    #[test]
    fn test_initial_window_size_change_applies_to_open_streams() {
        let mut p = Pair::connected();
        let stream_id = p.get("/");
        p.pump();
        p.server.send_headers(stream_id, ok_response(), false).unwrap();
        let window = p.server.send_window(stream_id).unwrap();
        assert_eq!(window.available(), 65535);

        p.client.update_settings(Settings {
            initial_window_size: 1000,
            ..*p.client.local_settings()
        });
        p.pump();
        assert_eq!(window.available(), 1000);
        assert_eq!(p.server.remote_settings().initial_window_size, 1000);
        assert_eq!(p.client.local_settings().initial_window_size, 1000);
    }

    #[test]
    fn test_connection_window_is_raised_after_preface() {
        let conf = SessionConf {
            connection_window_size: 1 << 20,
            ..Default::default()
        };
        let p = Pair::new(conf, Default::default());
        assert_eq!(p.server.connection_send_window().available(), 1 << 20);
    }

    #[test]
    fn test_idle_timeout() {
        let mut p = Pair::connected();
        let stream_id = p.get("/slow");
        p.pump();

        let deadline = p.server.next_idle_deadline().unwrap();
        p.server.check_idle(deadline - Duration::from_secs(1));
        assert_eq!(p.server.active_streams(), 1);

        p.server.check_idle(deadline);
        assert_eq!(p.server.active_streams(), 0);
        assert!(p
            .server_events
            .has(|ev| *ev == Event::Failure(stream_id, StreamError::IdleTimeout)));
        p.pump();
        assert!(p
            .client_events
            .has(|ev| *ev == Event::Reset(stream_id, KnownErrorCode::Cancel.into())));
    }

    #[test]
    fn test_trailers_after_data() {
        let mut p = Pair::connected();
        let stream_id = p.get("/");
        p.pump();
        p.server.send_headers(stream_id, ok_response(), false).unwrap();
        p.server
            .send_data(stream_id, Bytes::from_static(b"body"), false)
            .unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        p.server.send_trailers(stream_id, trailers.clone()).unwrap();
        p.pump();

        assert_eq!(
            p.client_events.take(),
            vec![
                Event::Headers(stream_id, ok_response(), false),
                Event::Data(stream_id, Bytes::from_static(b"body"), false),
                Event::Headers(stream_id, MetaData::Fields(trailers), true),
            ]
        );
    }

    #[test]
    fn test_transport_eof_fails_streams_once() {
        let mut p = Pair::connected();
        let stream_id = p.get("/");
        p.pump();
        p.client.close();
        p.client.close();
        let events = p.client_events.take();
        assert_eq!(
            events,
            vec![
                Event::Failure(stream_id, StreamError::SessionClosed),
                Event::Closed
            ]
        );
    }

    #[test]
    fn test_partial_frames_are_kept() {
        let (mut server, events) = started_server();
        let mut generator = Generator::new(Role::Client);
        let mut input = BytesMut::new();
        generator.generate(&mut input, &get_headers(1)).unwrap();

        let mut buf = BytesMut::new();
        let split = input.len() / 2;
        buf.put_slice(&input[..split]);
        server.receive(&mut buf);
        assert_eq!(server.active_streams(), 0);
        buf.put_slice(&input[split..]);
        server.receive(&mut buf);
        assert!(buf.is_empty());
        assert!(events.has(|ev| matches!(ev, Event::Headers(id, _, true) if *id == StreamId(1))));
    }
}

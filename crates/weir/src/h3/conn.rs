//! Drives an [H3Session] over a [QuicConnection], with the same command
//! and stream channels as the HTTP/2 adapters.

use std::collections::HashMap;

use bytes::Bytes;
use http::HeaderMap;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace};
use weir_h3::QuicStreamId;

use super::{
    session::{H3Conf, H3Event, H3Session, QuicEvent, Transmit},
    QuicConnection,
};
use crate::{
    body::StreamEvent,
    error::{ServeError, SessionError, StreamError},
    handle::{Accepted, Command, Dispatcher, Engine},
    meta::MetaData,
    Role,
};

/// An [H3Session] plus the channels its streams are wired to.
pub(crate) struct H3Engine {
    session: H3Session,
    streams: HashMap<QuicStreamId, mpsc::UnboundedSender<StreamEvent>>,
    incoming: Option<mpsc::UnboundedSender<Accepted>>,
    failure: Option<SessionError>,
}

impl H3Engine {
    fn new(role: Role, conf: H3Conf, incoming: Option<mpsc::UnboundedSender<Accepted>>) -> Self {
        Self {
            session: H3Session::new(role, conf),
            streams: Default::default(),
            incoming,
            failure: None,
        }
    }

    /// Routes what the session reported to the application.
    fn dispatch_events(&mut self) {
        while let Some(ev) = self.session.poll_event() {
            match ev {
                H3Event::Headers {
                    stream_id,
                    meta,
                    end_stream,
                } => self.on_headers(stream_id, meta, end_stream),
                H3Event::Data {
                    stream_id,
                    data,
                    end_stream,
                } => self.send(stream_id, StreamEvent::Data { data, end_stream }),
                H3Event::StreamFailed { stream_id, error } => {
                    if let Some(tx) = self.streams.remove(&stream_id) {
                        let _ = tx.send(StreamEvent::Failed(error));
                    }
                }
                H3Event::Settings(settings) => debug!(?settings, "peer settings"),
                H3Event::GoAway { id } => debug!(%id, "peer is going away"),
                H3Event::Failed(e) => {
                    self.failure.get_or_insert(e);
                }
                H3Event::Closed => trace!("session closed"),
            }
        }

        // streams the session is done with won't get any more events
        let session = &self.session;
        self.streams.retain(|id, _| session.has_stream(*id));
    }

    fn on_headers(&mut self, stream_id: QuicStreamId, meta: MetaData, end_stream: bool) {
        if self.streams.contains_key(&stream_id) {
            let ev = match meta {
                MetaData::Fields(trailers) => StreamEvent::Trailers(trailers),
                meta => StreamEvent::Headers { meta, end_stream },
            };
            self.send(stream_id, ev);
            return;
        }

        let request = match meta {
            MetaData::Request(request) | MetaData::ConnectRequest(request) => request,
            _ => return,
        };
        let Some(incoming) = self.incoming.as_ref() else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let accepted = Accepted {
            key: stream_id.0,
            request,
            end_stream,
            events: rx,
        };
        if incoming.send(accepted).is_err() {
            debug!(%stream_id, "nobody is accepting, rejecting request");
            self.session
                .reset(stream_id, weir_h3::H3ErrorCode::RequestRejected);
            return;
        }
        self.streams.insert(stream_id, tx);
    }

    fn send(&mut self, stream_id: QuicStreamId, ev: StreamEvent) {
        if let Some(tx) = self.streams.get(&stream_id) {
            let _ = tx.send(ev);
        }
    }
}

impl Engine for H3Engine {
    fn open(
        &mut self,
        meta: MetaData,
        end_stream: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<u64, StreamError> {
        let stream_id = self.session.new_stream(meta, end_stream)?;
        self.streams.insert(stream_id, events);
        Ok(stream_id.0)
    }

    fn send_headers(
        &mut self,
        stream: u64,
        meta: MetaData,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        self.session
            .send_headers(QuicStreamId(stream), meta, end_stream)
    }

    fn send_data(&mut self, stream: u64, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.session.send_data(QuicStreamId(stream), data, end_stream)
    }

    fn send_trailers(&mut self, stream: u64, trailers: HeaderMap) -> Result<(), StreamError> {
        self.session.send_trailers(QuicStreamId(stream), trailers)
    }

    fn reset(&mut self, stream: u64, error: &StreamError) {
        let stream_id = QuicStreamId(stream);
        self.session.reset(stream_id, error.as_h3_error_code());
        self.streams.remove(&stream_id);
    }

    fn consume(&mut self, _stream: u64, _n: usize) {
        // QUIC flow control belongs to the transport
    }

    fn pending_data(&self, stream: u64) -> Option<usize> {
        // everything is handed to the transport right away
        self.session.has_stream(QuicStreamId(stream)).then_some(0)
    }

    fn go_away(&mut self) {
        self.session.go_away();
    }
}

pub(crate) struct H3Driver<C> {
    conn: C,
    engine: H3Engine,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C> H3Driver<C>
where
    C: QuicConnection,
{
    pub(crate) fn new(
        conn: C,
        role: Role,
        conf: H3Conf,
        incoming: Option<mpsc::UnboundedSender<Accepted>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            conn,
            engine: H3Engine::new(role, conf, incoming),
            commands,
        }
    }

    pub(crate) async fn run(self) -> Result<(), ServeError> {
        let Self {
            mut conn,
            mut engine,
            mut commands,
        } = self;

        let mut dispatcher = Dispatcher::default();
        let mut commands_open = true;

        let res: Result<(), ServeError> = loop {
            if let Err(e) = transmit(&mut engine.session, &mut conn).await {
                engine.session.handle(QuicEvent::ConnectionClosed);
                engine.dispatch_events();
                break Err(e);
            }
            engine.dispatch_events();
            dispatcher.resolve(&engine);
            if engine.session.is_closed() {
                break Ok(());
            }

            let deadline = engine.session.next_idle_deadline();
            tokio::select! {
                ev = conn.next_event() => match ev {
                    Some(ev) => engine.session.handle(ev),
                    None => {
                        debug!("QUIC connection gone");
                        engine.session.handle(QuicEvent::ConnectionClosed);
                    }
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => dispatcher.handle(&mut engine, cmd),
                    None => {
                        debug!("all handles dropped, going away");
                        commands_open = false;
                        engine.session.go_away();
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    engine.session.check_idle(Instant::now());
                }
            }
        };

        // the final CONNECTION_CLOSE, if any
        let _ = transmit(&mut engine.session, &mut conn).await;
        dispatcher.resolve(&engine);
        res?;

        match engine.failure.take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn transmit(session: &mut H3Session, conn: &mut impl QuicConnection) -> Result<(), ServeError> {
    while let Some(t) = session.poll_transmit() {
        match t {
            Transmit::StreamData {
                stream_id,
                data,
                fin,
            } => {
                trace!(%stream_id, len = %data.len(), %fin, ">");
                conn.send(stream_id, data, fin).await?;
            }
            Transmit::ResetStream {
                stream_id,
                error_code,
            } => conn.reset(stream_id, error_code).await?,
            Transmit::CloseConnection { error_code, reason } => {
                debug!(error_code = %format!("{error_code:#x}"), "closing QUIC connection");
                conn.close(error_code, reason).await;
            }
        }
    }
    Ok(())
}

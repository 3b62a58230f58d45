//! Drives a [Session] over a byte stream: reads feed the session, its
//! output is written back, and application handles talk to it through
//! commands.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace};
use weir_h2::{ErrorCode, StreamId};

use super::session::{GoAwayKind, Session};
use crate::{
    body::StreamEvent,
    error::{ServeError, SessionError, StreamError},
    handle::{Accepted, Command, Dispatcher, Engine},
    listener::{SessionListener, StreamListener},
    meta::MetaData,
};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Forwards one stream's events to the application.
pub(crate) struct ChannelListener {
    events: mpsc::UnboundedSender<StreamEvent>,
    /// Set on server streams until the request arrives
    accept: Option<(
        mpsc::UnboundedSender<Accepted>,
        mpsc::UnboundedReceiver<StreamEvent>,
    )>,
}

impl ChannelListener {
    pub(crate) fn new(events: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            events,
            accept: None,
        }
    }

    fn send(&self, ev: StreamEvent) {
        // the application dropped its half, nobody cares
        let _ = self.events.send(ev);
    }
}

impl StreamListener for ChannelListener {
    fn on_headers(
        &mut self,
        stream_id: StreamId,
        meta: MetaData,
        end_stream: bool,
    ) -> b_x::Result<()> {
        match meta {
            MetaData::Request(request) | MetaData::ConnectRequest(request)
                if self.accept.is_some() =>
            {
                if let Some((incoming, events)) = self.accept.take() {
                    let _ = incoming.send(Accepted {
                        key: stream_id.0 as u64,
                        request,
                        end_stream,
                        events,
                    });
                }
            }
            MetaData::Fields(trailers) => self.send(StreamEvent::Trailers(trailers)),
            meta => self.send(StreamEvent::Headers { meta, end_stream }),
        }
        Ok(())
    }

    fn on_data_available(
        &mut self,
        _stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> b_x::Result<()> {
        self.send(StreamEvent::Data { data, end_stream });
        Ok(())
    }

    fn on_failure(&mut self, _stream_id: StreamId, error: &StreamError) -> b_x::Result<()> {
        self.send(StreamEvent::Failed(error.clone()));
        Ok(())
    }

    fn on_reset(&mut self, _stream_id: StreamId, error_code: ErrorCode) -> b_x::Result<()> {
        self.send(StreamEvent::Failed(StreamError::Reset(error_code)));
        Ok(())
    }
}

/// Session-wide listener of the adapters: hands new streams to the
/// acceptor and remembers why the session failed.
pub(crate) struct ConnListener {
    incoming: Option<mpsc::UnboundedSender<Accepted>>,
    failure: Arc<Mutex<Option<SessionError>>>,
}

impl SessionListener for ConnListener {
    fn on_new_stream(&mut self, stream_id: StreamId) -> Option<Box<dyn StreamListener>> {
        let incoming = self.incoming.as_ref()?;
        let (tx, rx) = mpsc::unbounded_channel();
        trace!(%stream_id, "new stream");
        Some(Box::new(ChannelListener {
            events: tx,
            accept: Some((incoming.clone(), rx)),
        }))
    }

    fn on_failure(&mut self, error: &SessionError) -> b_x::Result<()> {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| error.clone());
        }
        Ok(())
    }
}

fn stream_id(key: u64) -> Result<StreamId, StreamError> {
    u32::try_from(key)
        .map(StreamId)
        .map_err(|_| StreamError::StreamClosed)
}

impl Engine for Session {
    fn open(
        &mut self,
        meta: MetaData,
        end_stream: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<u64, StreamError> {
        self.new_stream(meta, end_stream, Box::new(ChannelListener::new(events)))
            .map(|id| id.0 as u64)
    }

    fn send_headers(
        &mut self,
        stream: u64,
        meta: MetaData,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        Session::send_headers(self, stream_id(stream)?, meta, end_stream)
    }

    fn send_data(
        &mut self,
        stream: u64,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        Session::send_data(self, stream_id(stream)?, data, end_stream)
    }

    fn send_trailers(&mut self, stream: u64, trailers: HeaderMap) -> Result<(), StreamError> {
        Session::send_trailers(self, stream_id(stream)?, trailers)
    }

    fn reset(&mut self, stream: u64, error: &StreamError) {
        if let Ok(id) = stream_id(stream) {
            Session::reset(self, id, error.as_known_error_code().into());
        }
    }

    fn consume(&mut self, stream: u64, n: usize) {
        if let Ok(id) = stream_id(stream) {
            Session::consume(self, id, n);
        }
    }

    fn pending_data(&self, stream: u64) -> Option<usize> {
        let id = stream_id(stream).ok()?;
        self.stream_state(id)?;
        Some(Session::pending_data(self, id))
    }

    fn go_away(&mut self) {
        Session::go_away(self, GoAwayKind::Graceful);
    }
}

/// The connection task shared by the client and server adapters.
pub(crate) struct Driver<IO> {
    io: IO,
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
    failure: Arc<Mutex<Option<SessionError>>>,
}

impl<IO> Driver<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Sets up a session whose streams reach the application through
    /// channels. Pass `incoming` to accept peer streams.
    pub(crate) fn new(
        io: IO,
        role: crate::Role,
        conf: crate::SessionConf,
        incoming: Option<mpsc::UnboundedSender<Accepted>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let failure: Arc<Mutex<Option<SessionError>>> = Default::default();
        let listener = ConnListener {
            incoming,
            failure: failure.clone(),
        };
        Self {
            io,
            session: Session::new(role, conf, Box::new(listener)),
            commands,
            failure,
        }
    }

    pub(crate) async fn run(self) -> Result<(), ServeError> {
        let Self {
            mut io,
            mut session,
            mut commands,
            failure,
        } = self;

        let mut dispatcher = Dispatcher::default();
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let mut commands_open = true;
        session.preface();

        let res: Result<(), ServeError> = loop {
            if let Err(e) = flush(&mut session, &mut io).await {
                session.close();
                break Err(e.into());
            }
            dispatcher.resolve(&session);
            if session.is_closed() {
                break Ok(());
            }

            let deadline = session.next_idle_deadline();
            tokio::select! {
                res = io.read_buf(&mut buf) => match res {
                    Ok(0) => {
                        debug!("peer hung up");
                        session.close();
                    }
                    Ok(n) => {
                        trace!(%n, "read");
                        session.receive(&mut buf);
                    }
                    Err(e) => {
                        debug!("read error: {e}");
                        session.close();
                        break Err(e.into());
                    }
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => dispatcher.handle(&mut session, cmd),
                    None => {
                        debug!("all handles dropped, going away");
                        commands_open = false;
                        session.go_away(GoAwayKind::Graceful);
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    session.check_idle(Instant::now());
                }
            }
        };

        // whatever the session had left to say, GOAWAY included
        if flush(&mut session, &mut io).await.is_ok() {
            let _ = io.shutdown().await;
        }
        dispatcher.resolve(&session);
        res?;

        match failure.lock().ok().and_then(|mut f| f.take()) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn flush(session: &mut Session, io: &mut (impl AsyncWrite + Unpin)) -> std::io::Result<()> {
    if !session.wants_write() {
        return Ok(());
    }
    while session.wants_write() {
        let out = session.take_output();
        trace!(len = %out.len(), "write");
        io.write_all(&out).await?;
    }
    io.flush().await
}

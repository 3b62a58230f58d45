//! Handles applications use to talk to a connection task, for both
//! protocols: requests go in as [Command]s, stream events come back out
//! through per-stream channels.

use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{
    body::{RecvStream, SendStream, StreamEvent},
    error::{Direction, StreamError},
    meta::{MetaData, Request, Response},
};

type Reply<T> = oneshot::Sender<Result<T, StreamError>>;

/// Something an application handle asks of the connection task. Streams are
/// keyed by their protocol stream id.
#[derive(Debug)]
pub(crate) enum Command {
    Request {
        meta: MetaData,
        end_stream: bool,
        reply: Reply<(u64, mpsc::UnboundedReceiver<StreamEvent>)>,
    },
    Headers {
        stream: u64,
        meta: MetaData,
        end_stream: bool,
        reply: Reply<()>,
    },
    /// Answered once the data is written out
    Data {
        stream: u64,
        data: Bytes,
        end_stream: bool,
        reply: Reply<()>,
    },
    Trailers {
        stream: u64,
        trailers: HeaderMap,
        reply: Reply<()>,
    },
    Reset {
        stream: u64,
        error: StreamError,
    },
    /// The application read `n` body bytes
    Consume {
        stream: u64,
        n: usize,
    },
    GoAway,
}

/// A protocol session, as seen by the connection task.
pub(crate) trait Engine {
    fn open(
        &mut self,
        meta: MetaData,
        end_stream: bool,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<u64, StreamError>;

    fn send_headers(
        &mut self,
        stream: u64,
        meta: MetaData,
        end_stream: bool,
    ) -> Result<(), StreamError>;

    fn send_data(&mut self, stream: u64, data: Bytes, end_stream: bool)
        -> Result<(), StreamError>;

    fn send_trailers(&mut self, stream: u64, trailers: HeaderMap) -> Result<(), StreamError>;

    fn reset(&mut self, stream: u64, error: &StreamError);

    fn consume(&mut self, stream: u64, n: usize);

    /// Bytes still queued on `stream`, or `None` once it is gone
    fn pending_data(&self, stream: u64) -> Option<usize>;

    fn go_away(&mut self);
}

struct Waiter {
    stream: u64,
    end_stream: bool,
    reply: Reply<()>,
}

/// Applies commands to an [Engine] and answers writers once their data is
/// out.
#[derive(Default)]
pub(crate) struct Dispatcher {
    waiters: Vec<Waiter>,
}

impl Dispatcher {
    pub(crate) fn handle(&mut self, engine: &mut impl Engine, cmd: Command) {
        trace!(?cmd, "command");
        match cmd {
            Command::Request {
                meta,
                end_stream,
                reply,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let res = engine.open(meta, end_stream, tx).map(|key| (key, rx));
                let _ = reply.send(res);
            }
            Command::Headers {
                stream,
                meta,
                end_stream,
                reply,
            } => {
                let _ = reply.send(engine.send_headers(stream, meta, end_stream));
            }
            Command::Data {
                stream,
                data,
                end_stream,
                reply,
            } => match engine.send_data(stream, data, end_stream) {
                Ok(()) => self.waiters.push(Waiter {
                    stream,
                    end_stream,
                    reply,
                }),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Trailers {
                stream,
                trailers,
                reply,
            } => match engine.send_trailers(stream, trailers) {
                Ok(()) => self.waiters.push(Waiter {
                    stream,
                    end_stream: true,
                    reply,
                }),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Reset { stream, error } => engine.reset(stream, &error),
            Command::Consume { stream, n } => engine.consume(stream, n),
            Command::GoAway => engine.go_away(),
        }
    }

    /// Answers writers whose data went out, or whose stream went away.
    pub(crate) fn resolve(&mut self, engine: &impl Engine) {
        for waiter in std::mem::take(&mut self.waiters) {
            let res = match engine.pending_data(waiter.stream) {
                Some(0) => Ok(()),
                Some(_) => {
                    self.waiters.push(waiter);
                    continue;
                }
                // a stream we were ending may be gone because it completed
                None if waiter.end_stream => Ok(()),
                None => Err(StreamError::StreamClosed),
            };
            let _ = waiter.reply.send(res);
        }
    }
}

/// A request the peer sent, with what's needed to answer it.
pub struct IncomingRequest {
    pub request: Request,
    pub body: RecvStream,
    pub respond: SendResponse,
}

/// A new peer stream, as handed from the connection task to the [Acceptor].
pub(crate) struct Accepted {
    pub(crate) key: u64,
    pub(crate) request: Request,
    pub(crate) end_stream: bool,
    pub(crate) events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Server side: yields requests as the peer opens streams.
pub struct Acceptor {
    incoming: mpsc::UnboundedReceiver<Accepted>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Acceptor {
    pub(crate) fn new(
        incoming: mpsc::UnboundedReceiver<Accepted>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self { incoming, commands }
    }

    /// The next request, or `None` once the connection is gone.
    pub async fn accept(&mut self) -> Option<IncomingRequest> {
        let accepted = self.incoming.recv().await?;
        debug!(stream = %accepted.key, method = %accepted.request.method, "accepted request");
        Some(IncomingRequest {
            request: accepted.request,
            body: RecvStream::new(
                accepted.key,
                accepted.events,
                self.commands.clone(),
                accepted.end_stream,
            ),
            respond: SendResponse {
                key: accepted.key,
                commands: self.commands.clone(),
            },
        })
    }

    /// Stops taking new streams. Those already accepted run to completion.
    pub fn graceful_shutdown(&self) {
        let _ = self.commands.send(Command::GoAway);
    }
}

/// Answers one request.
pub struct SendResponse {
    key: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl SendResponse {
    /// Sends a 1xx response. Any number of them may precede the final one.
    pub async fn send_informational(&mut self, response: Response) -> Result<(), StreamError> {
        if !response.status.is_informational() {
            return Err(StreamError::InvalidState {
                what: "a final response as informational",
            });
        }
        self.send_headers(MetaData::Response(response), false).await
    }

    /// Sends the final response. Unless `end_stream` is set, the body
    /// follows through the returned [SendStream].
    pub async fn send_response(
        mut self,
        response: Response,
        end_stream: bool,
    ) -> Result<SendStream, StreamError> {
        self.send_headers(MetaData::Response(response), end_stream)
            .await?;
        Ok(SendStream::new(self.key, self.commands))
    }

    pub fn reset(self, error: StreamError) {
        let _ = self.commands.send(Command::Reset {
            stream: self.key,
            error,
        });
    }

    pub fn stream_id(&self) -> u64 {
        self.key
    }

    async fn send_headers(&mut self, meta: MetaData, end_stream: bool) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Headers {
                stream: self.key,
                meta,
                end_stream,
                reply,
            })
            .map_err(|_| StreamError::SessionClosed)?;
        rx.await.map_err(|_| StreamError::SessionClosed)?
    }
}

/// Client side: opens streams. Cheap to clone.
#[derive(Clone)]
pub struct SendRequest {
    commands: mpsc::UnboundedSender<Command>,
}

impl SendRequest {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Opens a stream with `request`. The response arrives through the
    /// [ResponseFuture], the request body goes out through the
    /// [SendStream] (unless `end_stream` is set).
    pub async fn send_request(
        &mut self,
        request: Request,
        end_stream: bool,
    ) -> Result<(ResponseFuture, SendStream), StreamError> {
        let meta = if request.method == http::Method::CONNECT {
            MetaData::ConnectRequest(request)
        } else {
            MetaData::Request(request)
        };

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                meta,
                end_stream,
                reply,
            })
            .map_err(|_| StreamError::SessionClosed)?;
        let (key, events) = rx.await.map_err(|_| StreamError::SessionClosed)??;

        Ok((
            ResponseFuture {
                key,
                events: Some(events),
                commands: self.commands.clone(),
            },
            SendStream::new(key, self.commands.clone()),
        ))
    }

    /// Asks the connection to go away once in-flight streams complete.
    pub fn graceful_shutdown(&self) {
        let _ = self.commands.send(Command::GoAway);
    }
}

/// Resolves to the final response of a request, and its body.
/// Informational responses are skipped.
pub struct ResponseFuture {
    key: u64,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ResponseFuture {
    pub fn stream_id(&self) -> u64 {
        self.key
    }
}

impl Future for ResponseFuture {
    type Output = Result<(Response, RecvStream), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let Some(events) = self.events.as_mut() else {
                return Poll::Ready(Err(StreamError::InvalidState {
                    what: "a response twice",
                }));
            };
            let res = match ready!(events.poll_recv(cx)) {
                None => Err(StreamError::SessionClosed),
                Some(StreamEvent::Failed(e)) => Err(e),
                Some(StreamEvent::Headers {
                    meta: MetaData::Response(response),
                    ..
                }) if response.status.is_informational() => {
                    trace!(stream = %self.key, status = %response.status, "informational response");
                    continue;
                }
                Some(StreamEvent::Headers {
                    meta: MetaData::Response(response),
                    end_stream,
                }) => {
                    let events = self.events.take();
                    return Poll::Ready(match events {
                        Some(events) => Ok((
                            response,
                            RecvStream::new(self.key, events, self.commands.clone(), end_stream),
                        )),
                        None => Err(StreamError::SessionClosed),
                    });
                }
                Some(_) => Err(StreamError::Malformed {
                    direction: Direction::Response,
                    reason: "expected response headers first",
                }),
            };
            self.events = None;
            return Poll::Ready(res);
        }
    }
}

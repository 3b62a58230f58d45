//! Body halves handed to applications: [RecvStream] reads what the peer
//! sends on a stream, [SendStream] writes to it.

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::{error::StreamError, handle::Command, meta::MetaData};

/// What the connection task tells a stream's reader.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Headers { meta: MetaData, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderMap),
    Failed(StreamError),
}

/// The receiving half of a stream: body chunks, then maybe trailers.
pub struct RecvStream {
    key: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    commands: mpsc::UnboundedSender<Command>,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl RecvStream {
    pub(crate) fn new(
        key: u64,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        commands: mpsc::UnboundedSender<Command>,
        end_stream: bool,
    ) -> Self {
        Self {
            key,
            events,
            commands,
            trailers: None,
            done: end_stream,
        }
    }

    /// The next body chunk, or `None` once the peer ended the stream.
    ///
    /// Flow-control credit for a chunk goes back to the peer as it is
    /// handed out, so a reader that stops reading stops the sender.
    pub async fn data(&mut self) -> Option<Result<Bytes, StreamError>> {
        while !self.done {
            let Some(ev) = self.events.recv().await else {
                self.done = true;
                return Some(Err(StreamError::SessionClosed));
            };
            match ev {
                StreamEvent::Data { data, end_stream } => {
                    self.done = end_stream;
                    if data.is_empty() {
                        continue;
                    }
                    let _ = self.commands.send(Command::Consume {
                        stream: self.key,
                        n: data.len(),
                    });
                    return Some(Ok(data));
                }
                StreamEvent::Trailers(trailers) => {
                    self.trailers = Some(trailers);
                    self.done = true;
                }
                StreamEvent::Headers { meta, .. } => {
                    trace!(stream = %self.key, ?meta, "ignoring header block in body");
                }
                StreamEvent::Failed(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }

    /// Reads (and drops) whatever is left of the body, then returns the
    /// trailers, if the peer sent any.
    pub async fn trailers(&mut self) -> Result<Option<HeaderMap>, StreamError> {
        while let Some(chunk) = self.data().await {
            chunk?;
        }
        Ok(self.trailers.take())
    }

    /// Whether the peer is done sending
    pub fn is_end_stream(&self) -> bool {
        self.done
    }

    pub fn stream_id(&self) -> u64 {
        self.key
    }
}

/// The sending half of a stream.
pub struct SendStream {
    key: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl SendStream {
    pub(crate) fn new(key: u64, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { key, commands }
    }

    /// Queues `data`, and waits until it has been written out, which only
    /// happens as fast as the peer grants flow-control credit.
    pub async fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Data {
            stream: self.key,
            data,
            end_stream,
            reply,
        })?;
        rx.await.map_err(|_| StreamError::SessionClosed)?
    }

    /// Ends the stream with trailers, once queued data is out.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Trailers {
            stream: self.key,
            trailers,
            reply,
        })?;
        rx.await.map_err(|_| StreamError::SessionClosed)?
    }

    /// Resets the stream. Anything still queued is dropped.
    pub fn reset(&mut self, error: StreamError) {
        let _ = self.command(Command::Reset {
            stream: self.key,
            error,
        });
    }

    pub fn stream_id(&self) -> u64 {
        self.key
    }

    fn command(&self, cmd: Command) -> Result<(), StreamError> {
        self.commands
            .send(cmd)
            .map_err(|_| StreamError::SessionClosed)
    }
}

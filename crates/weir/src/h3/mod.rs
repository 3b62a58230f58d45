//! HTTP/3: the sans-I/O [H3Session] and client/server adapters over any
//! QUIC implementation that can be made to fit [QuicConnection].

use bytes::Bytes;
use tokio::sync::mpsc;

mod conn;
pub mod session;

pub use session::{H3Conf, H3Event, H3Session, QuicEvent, Transmit};
pub use weir_h3::{H3ErrorCode, H3Settings, QuicStreamId};

use crate::{
    error::ServeError,
    handle::{Acceptor, SendRequest},
    Role,
};

/// The slice of a QUIC connection HTTP/3 needs. Streams are opened
/// implicitly by the first `send` on them.
#[allow(async_fn_in_trait)]
pub trait QuicConnection {
    /// The next thing that happened on the connection, or `None` once it
    /// is gone.
    async fn next_event(&mut self) -> Option<QuicEvent>;

    async fn send(&mut self, stream_id: QuicStreamId, data: Bytes, fin: bool)
        -> Result<(), ServeError>;

    /// Resets our sending side and asks the peer to stop sending.
    async fn reset(&mut self, stream_id: QuicStreamId, error_code: u64) -> Result<(), ServeError>;

    async fn close(&mut self, error_code: u64, reason: Bytes);
}

/// The connection task for either role.
pub struct H3Connection<C> {
    driver: conn::H3Driver<C>,
}

impl<C> H3Connection<C>
where
    C: QuicConnection,
{
    /// Runs until the QUIC connection goes away, the session fails, or
    /// every handle is dropped and in-flight streams complete.
    pub async fn run(self) -> Result<(), ServeError> {
        self.driver.run().await
    }
}

/// Serves HTTP/3 on an established QUIC connection.
pub fn serve<C>(conn: C, conf: H3Conf) -> (H3Connection<C>, Acceptor)
where
    C: QuicConnection,
{
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let driver = conn::H3Driver::new(conn, Role::Server, conf, Some(incoming_tx), commands_rx);
    (
        H3Connection { driver },
        Acceptor::new(incoming_rx, commands_tx),
    )
}

/// Speaks HTTP/3 as a client on an established QUIC connection.
pub fn connect<C>(conn: C, conf: H3Conf) -> (H3Connection<C>, SendRequest)
where
    C: QuicConnection,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let driver = conn::H3Driver::new(conn, Role::Client, conf, None, commands_rx);
    (H3Connection { driver }, SendRequest::new(commands_tx))
}

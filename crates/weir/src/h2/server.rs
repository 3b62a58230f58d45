//! HTTP/2 server over any `AsyncRead + AsyncWrite`.

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use super::conn::Driver;
use crate::{error::ServeError, handle::Acceptor, Role, SessionConf};

/// The connection task. Nothing happens until [ServerConnection::run] is
/// polled, typically from its own task.
pub struct ServerConnection<IO> {
    driver: Driver<IO>,
}

impl<IO> ServerConnection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Serves the connection until the peer goes away, the session fails,
    /// or every handle (acceptor included) is dropped and in-flight streams
    /// complete.
    pub async fn run(self) -> Result<(), ServeError> {
        self.driver.run().await
    }
}

/// Sets up a server connection on `io`. The client preface is expected
/// first, our SETTINGS go out as soon as the connection runs.
pub fn handshake<IO>(io: IO, conf: SessionConf) -> (ServerConnection<IO>, Acceptor)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let driver = Driver::new(io, Role::Server, conf, Some(incoming_tx), commands_rx);
    (
        ServerConnection { driver },
        Acceptor::new(incoming_rx, commands_tx),
    )
}

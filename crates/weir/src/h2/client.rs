//! HTTP/2 client over any `AsyncRead + AsyncWrite`.

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use super::conn::Driver;
use crate::{error::ServeError, handle::SendRequest, Role, SessionConf};

/// The connection task. Requests only make progress while
/// [ClientConnection::run] is being polled.
pub struct ClientConnection<IO> {
    driver: Driver<IO>,
}

impl<IO> ClientConnection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs until the peer goes away, the session fails, or every
    /// [SendRequest] and stream handle is dropped and in-flight streams
    /// complete.
    pub async fn run(self) -> Result<(), ServeError> {
        self.driver.run().await
    }
}

/// Sets up a client connection on `io`: the preface and our SETTINGS go
/// out as soon as the connection runs. Pushed streams are refused.
pub fn handshake<IO>(io: IO, conf: SessionConf) -> (ClientConnection<IO>, SendRequest)
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let conf = SessionConf {
        enable_push: false,
        ..conf
    };
    let driver = Driver::new(io, Role::Client, conf, None, commands_rx);
    (ClientConnection { driver }, SendRequest::new(commands_tx))
}

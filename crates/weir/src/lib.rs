//! An HTTP/2 and HTTP/3 protocol engine.
//!
//! Both protocols come in two layers: a sans-I/O session ([h2::Session],
//! [h3::H3Session]) that turns bytes into events and back, and adapters
//! that drive a session over tokio I/O or a QUIC connection and hand out
//! [Acceptor], [SendRequest] and body handles.

pub mod conf;
pub mod error;
pub mod h2;
pub mod h3;
pub mod listener;
pub mod meta;

mod body;
mod handle;

/// re-exported so consumers can use whatever version we use
pub use http;

pub use body::{RecvStream, SendStream};
pub use conf::SessionConf;
pub use error::{CompressionError, Direction, ServeError, SessionError, StreamError};
pub use handle::{Acceptor, IncomingRequest, ResponseFuture, SendRequest, SendResponse};
pub use meta::{MetaData, Request, Response};

/// Which end of the connection a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

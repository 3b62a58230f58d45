//! HTTP/2: frames, flow control, the stream state machine and the
//! sans-I/O [Session], plus client and server adapters over tokio I/O.

pub mod client;
mod conn;
pub mod flow;
pub mod frame;
pub mod generator;
pub mod parser;
pub mod server;
pub mod session;
pub mod stream;

pub use session::{GoAwayKind, Session};

//! The seams through which applications consume the engine.
//!
//! Every method has a default that does nothing, so listeners only
//! implement what they care about. The engine calls them through
//! [notify], which catches panics and logs errors: a broken listener never
//! leaves the session half-updated.

use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::Bytes;
use tracing::{debug, warn};
use weir_h2::{ErrorCode, Settings, StreamId};

use crate::{
    error::{SessionError, StreamError},
    meta::{MetaData, Request, Response},
};

/// Connection-wide events.
#[allow(unused_variables)]
pub trait SessionListener: Send {
    /// The peer opened a stream. Returning `None` refuses it. Servers get
    /// the request itself through the returned listener's `on_request`.
    fn on_new_stream(&mut self, stream_id: StreamId) -> Option<Box<dyn StreamListener>> {
        None
    }

    /// A server session saw the client preface and is ready for requests.
    fn on_accept(&mut self) -> b_x::Result<()> {
        Ok(())
    }

    /// The peer's settings, as they stand after applying a SETTINGS frame.
    fn on_settings(&mut self, settings: &Settings) -> b_x::Result<()> {
        Ok(())
    }

    /// A PING we sent was acknowledged.
    fn on_ping(&mut self, payload: [u8; 8]) -> b_x::Result<()> {
        Ok(())
    }

    fn on_go_away(
        &mut self,
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: &Bytes,
    ) -> b_x::Result<()> {
        Ok(())
    }

    /// The session failed. Every stream has already been failed.
    fn on_failure(&mut self, error: &SessionError) -> b_x::Result<()> {
        Ok(())
    }

    /// The session is closed, for whatever reason. Called exactly once.
    fn on_close(&mut self) -> b_x::Result<()> {
        Ok(())
    }
}

/// Per-stream events.
#[allow(unused_variables)]
pub trait StreamListener: Send {
    /// A header block arrived. The default hands requests to `on_request`,
    /// responses to `on_response` and trailers to `on_trailer`.
    fn on_headers(
        &mut self,
        stream_id: StreamId,
        meta: MetaData,
        end_stream: bool,
    ) -> b_x::Result<()> {
        match meta {
            MetaData::Request(req) | MetaData::ConnectRequest(req) => {
                self.on_request(stream_id, req, end_stream)
            }
            MetaData::Response(res) => self.on_response(stream_id, res, end_stream),
            MetaData::Fields(fields) => self.on_trailer(stream_id, MetaData::Fields(fields)),
        }
    }

    fn on_request(
        &mut self,
        stream_id: StreamId,
        request: Request,
        end_stream: bool,
    ) -> b_x::Result<()> {
        Ok(())
    }

    /// Informational (1xx) responses come through here too, before the
    /// final one.
    fn on_response(
        &mut self,
        stream_id: StreamId,
        response: Response,
        end_stream: bool,
    ) -> b_x::Result<()> {
        Ok(())
    }

    /// Body bytes. Flow-control credit only comes back once the
    /// application calls `Session::consume`.
    fn on_data_available(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> b_x::Result<()> {
        Ok(())
    }

    fn on_trailer(&mut self, stream_id: StreamId, trailers: MetaData) -> b_x::Result<()> {
        Ok(())
    }

    /// The stream saw no activity for the configured timeout. Returning
    /// `true` keeps it alive, `false` resets it.
    fn on_idle_timeout(&mut self, stream_id: StreamId) -> bool {
        false
    }

    /// The stream failed locally or because the session did.
    fn on_failure(&mut self, stream_id: StreamId, error: &StreamError) -> b_x::Result<()> {
        Ok(())
    }

    /// The peer reset the stream.
    fn on_reset(&mut self, stream_id: StreamId, error_code: ErrorCode) -> b_x::Result<()> {
        Ok(())
    }

    /// A PUSH_PROMISE reserved `promised_stream_id` for a pushed response.
    /// Returning `None` refuses the push.
    fn on_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        request: Request,
    ) -> Option<Box<dyn StreamListener>> {
        None
    }
}

/// Calls into listener code. Returned errors are logged, panics are caught
/// and logged, and either way the engine carries on with the default.
pub(crate) fn notify<T: Default>(what: &'static str, f: impl FnOnce() -> b_x::Result<T>) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            debug!(%what, "listener returned an error: {e}");
            T::default()
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "(non-string panic)".to_string());
            warn!(%what, "listener panicked: {msg}");
            T::default()
        }
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}
impl StreamListener for NoopListener {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_swallows_errors_and_panics() {
        let n: u32 = notify("ok", || Ok(7));
        assert_eq!(n, 7);

        let n: u32 = notify("err", || Err(b_x::BX::from_string("nope".into())));
        assert_eq!(n, 0);

        let kept: bool = notify("panic", || -> b_x::Result<bool> { panic!("listener bug") });
        assert!(!kept);
    }
}

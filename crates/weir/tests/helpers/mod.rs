#![allow(dead_code)]

use std::future::Future;

use b_x::BX;
use bytes::Bytes;
use tokio::sync::mpsc;
use weir::{
    h3::{QuicConnection, QuicEvent, QuicStreamId},
    RecvStream, ServeError,
};

pub(crate) mod tracing_common;

pub(crate) fn run(test: impl Future<Output = Result<(), BX>>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    rt.block_on(async {
        tracing_common::setup_tracing();

        if let Err(e) = test.await {
            panic!("Error: {e}");
        }
    });
}

/// Reads a whole body.
pub(crate) async fn read_body(body: &mut RecvStream) -> Result<Vec<u8>, BX> {
    let mut out = Vec::new();
    while let Some(chunk) = body.data().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// One end of an in-memory QUIC connection: whatever one end sends, the
/// other end sees as events, in order.
pub(crate) struct MemQuic {
    events: mpsc::UnboundedReceiver<QuicEvent>,
    peer: mpsc::UnboundedSender<QuicEvent>,
}

impl MemQuic {
    pub(crate) fn pair() -> (MemQuic, MemQuic) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemQuic {
                events: a_rx,
                peer: b_tx,
            },
            MemQuic {
                events: b_rx,
                peer: a_tx,
            },
        )
    }

    fn deliver(&self, ev: QuicEvent) -> Result<(), ServeError> {
        self.peer.send(ev).map_err(|_| ServeError::ConnectionClosed)
    }
}

impl QuicConnection for MemQuic {
    async fn next_event(&mut self) -> Option<QuicEvent> {
        self.events.recv().await
    }

    async fn send(&mut self, stream_id: QuicStreamId, data: Bytes, fin: bool) -> Result<(), ServeError> {
        self.deliver(QuicEvent::StreamData {
            stream_id,
            data,
            fin,
        })
    }

    async fn reset(&mut self, stream_id: QuicStreamId, error_code: u64) -> Result<(), ServeError> {
        self.deliver(QuicEvent::StreamReset {
            stream_id,
            error_code,
        })
    }

    async fn close(&mut self, _error_code: u64, _reason: Bytes) {
        let _ = self.deliver(QuicEvent::ConnectionClosed);
    }
}

//! In-process transport pair for paired-instance tests.
//!
//! Two `LoopbackWs` ends joined by unbounded channels; each implements the
//! same `Stream`/`Sink` surface as a real WebSocket.  Dropping one end (or
//! sending a Close frame) ends the peer's read stream, which is exactly how
//! a PWS session loop observes a disconnect.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use pws::WsError;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

type FramePipe = mpsc::UnboundedSender<Result<Message, WsError>>;

/// One end of an in-process WebSocket-shaped transport.
pub struct LoopbackWs {
    tx: FramePipe,
    rx: mpsc::UnboundedReceiver<Result<Message, WsError>>,
}

/// Two connected transport ends.
pub fn loopback_pair() -> (LoopbackWs, LoopbackWs) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LoopbackWs { tx: a_tx, rx: a_rx },
        LoopbackWs { tx: b_tx, rx: b_rx },
    )
}

impl LoopbackWs {
    /// Push a read error into the peer's stream, as a failing socket would.
    pub fn inject_error(&self) {
        let _ = self.tx.send(Err(WsError::ConnectionClosed));
    }
}

impl Stream for LoopbackWs {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Sink<Message> for LoopbackWs {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        self.tx
            .send(Ok(item))
            .map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// RawPeer
// ---------------------------------------------------------------------------

/// Drives one loopback end at the wire level: crafts chunks with explicit
/// headers and inspects the frames the instance under test emits.
pub struct RawPeer {
    ws: LoopbackWs,
}

impl RawPeer {
    pub fn new(ws: LoopbackWs) -> Self {
        Self { ws }
    }

    /// Send a message or jet-command chunk with an explicit index.
    pub async fn send_chunk(&mut self, index: u64, jet: bool, command: bool, payload: &[u8]) {
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&pws::wire::encode_header(index, jet, command));
        frame.extend_from_slice(payload);
        self.send_binary(frame).await;
    }

    /// Send a signal chunk.
    pub async fn send_signal(&mut self, code: u16, payload: &[u8]) {
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&pws::wire::encode_signal(code));
        frame.extend_from_slice(payload);
        self.send_binary(frame).await;
    }

    pub async fn send_binary(&mut self, frame: Vec<u8>) {
        self.ws
            .send(Message::Binary(frame.into()))
            .await
            .expect("loopback send");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("loopback send");
    }

    /// Next binary frame from the instance under test; `None` on hangup.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        while let Some(msg) = self.ws.next().await {
            match msg.expect("loopback read") {
                Message::Binary(frame) => return Some(frame),
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    }

    /// Like [`RawPeer::next_frame`], bounded by `wait`.
    pub async fn next_frame_within(&mut self, wait: Duration) -> Option<Bytes> {
        tokio::time::timeout(wait, self.next_frame())
            .await
            .ok()
            .flatten()
    }
}

//! Transport decorator that severs the connection mid-stream.
//!
//! Counts outbound message chunks (data or jet-command headers; signals are
//! free) and drops the wrapped transport once the count runs out, so both
//! directions die exactly as if the socket vanished with those chunks "on
//! the wire".  Meant for loopback transports, where a sent frame is
//! delivered without flushing.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use pws::WsError;
use tokio_tungstenite::tungstenite::protocol::Message;

pub struct CutAfter<T> {
    inner: Option<T>,
    remaining: usize,
}

impl<T> CutAfter<T> {
    /// Sever the connection after `chunks` outbound message chunks.
    pub fn new(inner: T, chunks: usize) -> Self {
        Self {
            inner: Some(inner),
            remaining: chunks,
        }
    }
}

fn is_message_chunk(item: &Message) -> bool {
    match item {
        Message::Binary(frame) if frame.len() >= 2 => {
            let header = u16::from_be_bytes([frame[0], frame[1]]);
            header < 0x8000 || header >= 0xC000
        }
        _ => false,
    }
}

impl<T> Stream for CutAfter<T>
where
    T: Stream<Item = Result<Message, WsError>> + Unpin,
{
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            None => Poll::Ready(None),
            Some(inner) => Pin::new(inner).poll_next(cx),
        }
    }
}

impl<T> Sink<Message> for CutAfter<T>
where
    T: Sink<Message, Error = WsError> + Unpin,
{
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        match self.inner.as_mut() {
            None => Poll::Ready(Err(WsError::AlreadyClosed)),
            Some(inner) => Pin::new(inner).poll_ready(cx),
        }
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        let counted = is_message_chunk(&item);
        let Some(inner) = self.inner.as_mut() else {
            return Err(WsError::AlreadyClosed);
        };
        Pin::new(inner).start_send(item)?;
        if counted {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                self.inner = None;
            }
        }
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        match self.inner.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        match self.inner.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(inner) => Pin::new(inner).poll_close(cx),
        }
    }
}

// pws-test-utils: shared test transports for the persistent-WebSocket suite.
//
// Provides an in-process loopback transport pair, a wire-level peer driver,
// a mid-stream disconnect decorator, and a live WebSocket acceptor.

pub mod cut_after;
pub mod loopback;
pub mod ws_server;

pub use cut_after::CutAfter;
pub use loopback::{LoopbackWs, RawPeer, loopback_pair};
pub use ws_server::{ServerWs, WsTestServer};

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::Message;

    /// Test: frames sent into one loopback end come out of the other.
    #[tokio::test]
    async fn loopback_delivers_frames_in_order() {
        let (mut a, mut b) = loopback_pair();
        for i in 0u8..5 {
            a.send(Message::Binary(vec![0, 0, i].into())).await.unwrap();
        }
        for i in 0u8..5 {
            match b.next().await.unwrap().unwrap() {
                Message::Binary(frame) => assert_eq!(frame[2], i),
                other => panic!("expected binary, got {other:?}"),
            }
        }
    }

    /// Test: dropping one end ends the peer's stream.
    #[tokio::test]
    async fn dropping_an_end_hangs_up_the_peer() {
        let (a, mut b) = loopback_pair();
        drop(a);
        assert!(b.next().await.is_none());
    }

    /// Test: CutAfter delivers exactly its quota of message chunks, then
    /// both directions die; signal frames are not counted.
    #[tokio::test]
    async fn cut_after_severs_on_schedule() {
        let (a, mut b) = loopback_pair();
        let mut cut = CutAfter::new(a, 2);

        cut.send(Message::Binary(vec![0x80, 0x11, 0, 0].into()))
            .await
            .unwrap(); // signal: free
        cut.send(Message::Binary(vec![0x00, 0x00].into())).await.unwrap();
        cut.send(Message::Binary(vec![0x00, 0x01].into())).await.unwrap();
        assert!(
            cut.send(Message::Binary(vec![0x00, 0x02].into()))
                .await
                .is_err()
        );

        let mut seen = 0;
        while let Some(frame) = b.next().await {
            let _ = frame.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 3, "signal + two data chunks, then hangup");
    }

    /// Test: the live server accepts and upgrades a real connection.
    #[tokio::test]
    async fn ws_test_server_accepts_connections() {
        let mut server = WsTestServer::start().await.unwrap();
        let url = server.url();

        let (mut client, _resp) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let mut server_ws = server.accept().await;

        client
            .send(Message::Binary(vec![1, 2, 3].into()))
            .await
            .unwrap();
        match server_ws.next().await.unwrap().unwrap() {
            Message::Binary(frame) => assert_eq!(&frame[..], &[1, 2, 3]),
            other => panic!("expected binary, got {other:?}"),
        }
    }
}

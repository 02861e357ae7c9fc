//! Replay across reconnects: deterministic mid-stream cuts and random chaos.
//!
//! These run on the real clock: recovery must not depend on any particular
//! interleaving of timers, resend requests, and reconnects, so none is
//! pinned down here.

use futures_util::StreamExt;
use pws::PersistentWebSocket;
use pws_test_utils::{CutAfter, LoopbackWs, loopback_pair};
use tokio::time::{Duration, timeout};

/// `RUST_LOG=pws=trace cargo test` shows the full chunk flow.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Scenario: the socket dies with 10 chunks on the wire and 20 more queued;
/// after a reconnect the receiver requests resend and ends up with all 30
/// messages exactly once, in order.
#[tokio::test]
async fn resend_after_reconnect_delivers_everything_once() {
    init_tracing();
    let sender = PersistentWebSocket::<CutAfter<LoopbackWs>>::new("cut-sender");
    let receiver = PersistentWebSocket::<LoopbackWs>::new("cut-receiver");
    let mut incoming = receiver.incoming();

    // session 1: severed after 10 message chunks
    let (ta, tb) = loopback_pair();
    let s1_send = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.connected(CutAfter::new(ta, 10)).await })
    };
    let s1_recv = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.connected(tb).await })
    };

    for i in 0u32..30 {
        sender.send(i.to_be_bytes().to_vec()).await;
    }
    let _ = timeout(Duration::from_secs(10), s1_send)
        .await
        .expect("cut ends the sender session")
        .expect("task");
    let _ = timeout(Duration::from_secs(10), s1_recv)
        .await
        .expect("cut ends the receiver session")
        .expect("task");

    // session 2: same instances, fresh transport
    let (ta, tb) = loopback_pair();
    let _s2_send = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.connected(CutAfter::new(ta, usize::MAX)).await })
    };
    let _s2_recv = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.connected(tb).await })
    };

    let mut got = Vec::new();
    while got.len() < 30 {
        let message = timeout(Duration::from_secs(10), incoming.next())
            .await
            .expect("replay stalled")
            .expect("stream open");
        got.push(u32::from_be_bytes(message[..4].try_into().unwrap()));
    }
    assert_eq!(got, (0..30).collect::<Vec<_>>());
    assert!(
        timeout(Duration::from_millis(300), incoming.next()).await.is_err(),
        "nothing must be delivered twice"
    );

    sender.abandon_connection().await;
    receiver.abandon_connection().await;
}

/// Chaos: both sides randomly drop the socket; a driver keeps reconnecting
/// them.  Delivery is still exactly-once and in order.
#[tokio::test]
async fn chaos_drops_do_not_lose_or_duplicate_messages() {
    init_tracing();
    let sender = PersistentWebSocket::<LoopbackWs>::new("chaos-sender");
    let receiver = PersistentWebSocket::<LoopbackWs>::new("chaos-receiver");
    sender.set_chaos(25);
    receiver.set_chaos(25);
    let mut incoming = receiver.incoming();

    let (stop, stop_rx) = tokio::sync::watch::channel(false);
    let driver = {
        let sender = sender.clone();
        let receiver = receiver.clone();
        tokio::spawn(async move {
            while !*stop_rx.borrow() {
                let (ta, tb) = loopback_pair();
                let s = sender.connected(ta);
                let r = receiver.connected(tb);
                let _ = tokio::join!(s, r);
            }
        })
    };

    let payloads: Vec<Vec<u8>> = (0..40u32).map(|i| i.to_be_bytes().to_vec()).collect();
    for payload in &payloads {
        sender.send(payload.clone()).await;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let mut got = Vec::new();
    while got.len() < payloads.len() {
        let message = timeout(Duration::from_secs(30), incoming.next())
            .await
            .expect("delivery stalled under chaos")
            .expect("stream open");
        got.push(message.to_vec());
    }
    assert_eq!(got, payloads);
    assert!(
        timeout(Duration::from_millis(300), incoming.next()).await.is_err(),
        "nothing must be delivered twice"
    );

    stop.send_replace(true);
    sender.abandon_connection().await;
    receiver.abandon_connection().await;
    let _ = driver.await;
}

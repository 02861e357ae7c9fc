//! Minimal live WebSocket acceptor for tests.
//!
//! Binds 127.0.0.1:0 and hands accepted, upgraded sockets to the test, which
//! decides what to do with each (run a PWS session, drop it to simulate a
//! flap, etc.).

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

pub struct WsTestServer {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerWs>,
    /// Accept loop; dies with the server.
    _task: tokio::task::JoinHandle<()>,
}

impl WsTestServer {
    /// Bind a random port and start accepting in the background.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, conns) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let _ = tx.send(ws);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            conns,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// The next upgraded connection.
    pub async fn accept(&mut self) -> ServerWs {
        self.conns.recv().await.expect("accept loop alive")
    }
}

//! Reliable, ordered, resumable message transport over a WebSocket.
//!
//! The persistent WebSocket (PWS) layer sits above a message-oriented socket
//! and survives transient disconnections: outbound chunks carry a 2-byte
//! indexed header and stay in a bounded journal until acknowledged, the
//! receiver suppresses duplicates and requests retransmission of gaps, and a
//! reconnect loop keeps the conversation alive.  A secondary "jet" channel
//! multiplexed on the same socket tunnels a single TCP byte stream, driven
//! by `forward_to`/`disconnect` commands.  [`JsonFramer`] splits the legacy
//! text channel into complete JSON values.
//!
//! ```no_run
//! # async fn demo() -> Result<(), pws::PwsError> {
//! use futures_util::StreamExt;
//!
//! let pws = pws::ClientPws::new("hub");
//! let mut incoming = pws.incoming();
//! let driver = {
//!     let pws = pws.clone();
//!     let uri = format!("wss://hub.example.net:8443/rpc1/a1b2c3d4e5f6g7h8i9/{}",
//!         pws::conversation_id());
//!     tokio::spawn(async move { pws.connect(&uri).await })
//! };
//! pws.send(&b"hello"[..]).await;
//! while let Some(message) = incoming.next().await {
//!     println!("{}", pws::printable_hex(&message));
//! }
//! driver.abort();
//! # Ok(()) }
//! ```

pub mod connect;
pub mod error;
pub mod jet;
pub mod journal;
pub mod json_framer;
pub mod pws;
pub mod timekeeper;
pub mod util;
pub mod wire;

pub use connect::{ClientStream, connectivity_check};
pub use error::{PwsError, WsError};
pub use jet::{JetCommand, JetError, format_host_port, parse_host_port};
pub use journal::{Journal, JournalError, MAX_SEND_BUFFER};
pub use json_framer::JsonFramer;
pub use pws::{ClientPws, PersistentWebSocket, Transport};
pub use util::{conversation_id, printable_hex};

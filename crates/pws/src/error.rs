//! Error taxonomy and connect-failure classification.
//!
//! Two families matter to callers: transient failures are reported on the
//! error stream and retried by the reconnect loop; everything else is fatal
//! and requires tearing the instance down and opening a fresh conversation.
//!
//! User-visible strings are plain English without stack traces.  `B#####`
//! codes appear only in log lines, for correlation.

use tracing::warn;

use crate::journal::JournalError;

/// Error type of the underlying WebSocket library.
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Message published when the connection is abandoned on purpose.
pub const ABANDON_MSG: &str = "abandoning connection";

#[derive(Debug, thiserror::Error)]
pub enum PwsError {
    /// Recoverable network trouble; the reconnect loop retries.
    #[error("{0}")]
    Transient(String),
    /// Unrecoverable; the connect loop stops and the caller must discard
    /// the instance and open a new conversation.
    #[error("{0}")]
    Fatal(String),
    /// The peer violated the wire protocol; treated like [`PwsError::Fatal`].
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A journal invariant was broken by an impossible ack or resend index.
    #[error("protocol violation: {0}")]
    Journal(#[from] JournalError),
}

impl PwsError {
    /// Everything except [`PwsError::Transient`] ends the conversation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PwsError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Connect-failure classifier
// ---------------------------------------------------------------------------

/// Host probed to tell "our DNS is down" apart from "their hostname is wrong".
const DNS_PROBE_HOST: &str = "example.org";

/// Classify a failed connection attempt into retry-or-give-up, with a
/// human-readable message.
///
/// A DNS miss is ambiguous: if a probe of a well-known name also fails, the
/// local network is at fault (transient); if the probe resolves, the
/// configured hostname is wrong (fatal).
pub async fn classify_connect_error(err: &WsError) -> PwsError {
    match err {
        WsError::Http(response) => {
            warn!(status = %response.status(), "B70721 server did not upgrade the connection");
            PwsError::Fatal(
                "credentials not found; make sure they were entered correctly".to_owned(),
            )
        }
        WsError::Tls(e) => {
            warn!(error = %e, "B70722 TLS handshake failed");
            PwsError::Fatal("secure connection could not be established".to_owned())
        }
        WsError::Url(e) => PwsError::Fatal(format!("invalid server address: {e}")),
        other => classify_failure_text(&other.to_string()).await,
    }
}

/// Substring rules over the OS error text, shared by the WebSocket and raw
/// TCP/TLS paths.
pub async fn classify_failure_text(text: &str) -> PwsError {
    if text.contains("No route to host") {
        return PwsError::Transient("unable to connect to the server; retrying".to_owned());
    }
    if text.contains("No address associated with hostname")
        || text.contains("Failed host lookup")
        || text.contains("failed to lookup address")
    {
        return if dns_probe().await {
            PwsError::Fatal("server name could not be resolved; check the address".to_owned())
        } else {
            PwsError::Transient("no internet connection detected; retrying".to_owned())
        };
    }
    if text.contains("timed out") {
        return PwsError::Transient("connection attempt timed out; retrying".to_owned());
    }
    if text.contains("Connection refused") {
        return PwsError::Fatal(
            "the server refused the connection; check the address and port".to_owned(),
        );
    }
    if text.contains("Connection reset by peer") {
        return PwsError::Fatal("the connection was reset by the server".to_owned());
    }
    warn!(error = %text, "B70729 unclassified connection failure");
    PwsError::Fatal("unable to connect".to_owned())
}

/// True when a well-known public name resolves, i.e. local DNS works.
pub async fn dns_probe() -> bool {
    tokio::net::lookup_host((DNS_PROBE_HOST, 443)).await.is_ok()
}

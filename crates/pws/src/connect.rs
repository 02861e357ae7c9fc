//! Client-side connector: bounded connect attempts in an unbounded retry
//! loop, plus a standalone TCP+TLS connectivity probe.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, sleep, timeout};
use tracing::warn;

use crate::error::{ABANDON_MSG, PwsError, classify_connect_error, classify_failure_text};

/// The socket type produced by a client connect.
pub type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Hard ceiling per connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Pause between attempts after a recoverable failure.
pub const RETRY_SLEEP: Duration = Duration::from_secs(5);

/// One connection attempt with a hard timeout.
pub(crate) async fn connect_once(uri: &str) -> Result<ClientStream, PwsError> {
    match timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(uri)).await {
        Err(_) => Err(PwsError::Transient(
            "connection attempt timed out; retrying".to_owned(),
        )),
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(classify_connect_error(&e).await),
    }
}

/// Retry until a socket opens, a failure classifies as fatal, or the
/// connection is abandoned.  Recoverable failures are published on the error
/// stream and retried after [`RETRY_SLEEP`].
pub(crate) async fn reconnect(
    uri: &str,
    errors: &broadcast::Sender<String>,
    abandoned: &mut watch::Receiver<bool>,
) -> Result<ClientStream, PwsError> {
    loop {
        if *abandoned.borrow_and_update() {
            return Err(PwsError::Fatal(ABANDON_MSG.to_owned()));
        }
        match connect_once(uri).await {
            Ok(ws) => return Ok(ws),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(uri, error = %e, "B40432 connect attempt failed; will retry");
                let _ = errors.send(e.to_string());
                tokio::select! {
                    _ = sleep(RETRY_SLEEP) => {}
                    _ = abandoned.changed() => {}
                }
            }
        }
    }
}

/// Probe `host:port` with a TCP connect and a TLS handshake.
///
/// Returns an empty string on success, or the same human-readable message
/// the connect classifier would produce.
pub async fn connectivity_check(host: &str, port: u16) -> String {
    match tls_probe(host, port).await {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

async fn tls_probe(host: &str, port: u16) -> Result<(), PwsError> {
    let tcp = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Err(_) => {
            return Err(PwsError::Transient(
                "connection attempt timed out; retrying".to_owned(),
            ));
        }
        Ok(Err(e)) => return Err(classify_failure_text(&e.to_string()).await),
        Ok(Ok(tcp)) => tcp,
    };

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
        .map_err(|_| PwsError::Fatal(format!("invalid server name {host:?}")))?;
    tokio_rustls::TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|_| PwsError::Fatal("secure connection could not be established".to_owned()))?;
    Ok(())
}

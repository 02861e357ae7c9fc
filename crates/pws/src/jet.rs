//! Jet sub-channel: TCP tunneling over the secondary logical channel.
//!
//! The jet channel shares the WebSocket with the RPC channel and carries two
//! kinds of chunks: data bytes (jet bit set) and UTF-8 commands (jet and
//! signal bits set).  A peer that has opted in via `allow_port_forwarding`
//! reacts to `forward_to HOST:PORT` by dialing the target and piping bytes
//! both ways; `disconnect` tears the TCP connection down.  At most one TCP
//! connection exists per instance.

use std::str::FromStr;
use std::sync::Weak;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::pws::{PersistentWebSocket, Shared, Transport};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JetError {
    #[error("unknown jet command: {0:?}")]
    UnknownCommand(String),
    #[error("forward_to needs a HOST:PORT target")]
    MissingTarget,
    #[error("invalid host:port: {0:?}")]
    InvalidHostPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    #[error("missing port in {0:?}")]
    MissingPort(String),
}

/// A command carried in a jet command chunk (header ≥ 0xC000).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JetCommand {
    /// Open an outbound TCP connection to `host:port` and link it to the
    /// jet channel.
    ForwardTo { host: String, port: u16 },
    /// Close the current TCP connection.
    Disconnect,
}

impl FromStr for JetCommand {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self, JetError> {
        let mut words = s.split_whitespace();
        match words.next() {
            Some("forward_to") => {
                let target = words.next().ok_or(JetError::MissingTarget)?;
                let (host, port) = parse_host_port(target, None)?;
                Ok(JetCommand::ForwardTo { host, port })
            }
            Some("disconnect") => Ok(JetCommand::Disconnect),
            _ => Err(JetError::UnknownCommand(s.to_owned())),
        }
    }
}

impl std::fmt::Display for JetCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JetCommand::ForwardTo { host, port } => {
                write!(f, "forward_to {}", format_host_port(host, *port))
            }
            JetCommand::Disconnect => write!(f, "disconnect"),
        }
    }
}

// ---------------------------------------------------------------------------
// HOST:PORT parsing
// ---------------------------------------------------------------------------

/// Parse `host`, `host:port`, `[ipv6]`, or `[ipv6]:port`.
///
/// A bare IPv6 address (containing `:` without brackets) is accepted as a
/// host with the default port.  Without a default, a missing port is an
/// error; port 0 is always an error.
pub fn parse_host_port(s: &str, default_port: Option<u16>) -> Result<(String, u16), JetError> {
    let need_port = |p: Option<u16>| p.ok_or_else(|| JetError::MissingPort(s.to_owned()));

    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| JetError::InvalidHostPort(s.to_owned()))?;
        if host.is_empty() {
            return Err(JetError::InvalidHostPort(s.to_owned()));
        }
        let port = match after {
            "" => need_port(default_port)?,
            _ => parse_port(s, after.strip_prefix(':').ok_or_else(|| {
                JetError::InvalidHostPort(s.to_owned())
            })?)?,
        };
        return Ok((host.to_owned(), port));
    }

    match s.rsplit_once(':') {
        // more than one colon and no brackets: a bare IPv6 host
        Some((head, _)) if head.contains(':') => Ok((s.to_owned(), need_port(default_port)?)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_owned(), parse_port(s, port)?)),
        Some(_) => Err(JetError::InvalidHostPort(s.to_owned())),
        None => {
            if s.is_empty() {
                return Err(JetError::InvalidHostPort(s.to_owned()));
            }
            Ok((s.to_owned(), need_port(default_port)?))
        }
    }
}

/// Inverse of [`parse_host_port`]: brackets any host containing a colon.
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn parse_port(whole: &str, port: &str) -> Result<u16, JetError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(JetError::InvalidPort(whole.to_owned())),
        Ok(p) => Ok(p),
    }
}

// ---------------------------------------------------------------------------
// Pipe task
// ---------------------------------------------------------------------------

/// Handle to the running TCP pipe; dropping it leaves the task to wind down
/// on its own, [`JetPipe::disconnect`] stops it promptly.
pub(crate) struct JetPipe {
    shutdown: watch::Sender<bool>,
}

impl JetPipe {
    /// Dial `host:port` and pipe jet-channel bytes to it and TCP bytes back.
    ///
    /// `jet_rx` must be subscribed before any data chunk for the new
    /// connection can arrive, so the caller subscribes and hands it in.
    pub(crate) fn spawn<T: Transport>(
        pws: Weak<Shared<T>>,
        jet_rx: broadcast::Receiver<Bytes>,
        host: String,
        port: u16,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_pipe(pws, jet_rx, host, port, shutdown_rx));
        Self { shutdown }
    }

    pub(crate) fn disconnect(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_pipe<T: Transport>(
    pws: Weak<Shared<T>>,
    mut jet_rx: broadcast::Receiver<Bytes>,
    host: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let target = format_host_port(&host, port);
    let tcp = match TcpStream::connect((host.as_str(), port)).await {
        Ok(tcp) => tcp,
        Err(e) => {
            warn!(target = %target, error = %e, "B61109 jet target unreachable");
            if let Some(shared) = pws.upgrade() {
                PersistentWebSocket::from_shared(shared)
                    .publish_error(format!("unable to reach {target}"));
            }
            return;
        }
    };
    info!(target = %target, "jet pipe open");

    let (mut tcp_rd, mut tcp_wr) = tcp.into_split();
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            chunk = jet_rx.recv() => match chunk {
                Ok(bytes) => {
                    if tcp_wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(n, target = %target, "jet pipe lagged; bytes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            read = tcp_rd.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Some(shared) = pws.upgrade() else { break };
                    PersistentWebSocket::from_shared(shared)
                        .send_jet(Bytes::copy_from_slice(&buf[..n]))
                        .await;
                }
            },
        }
    }
    debug!(target = %target, "jet pipe closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_accepted_target_shape() {
        assert_eq!(
            parse_host_port("example.com:80", None).unwrap(),
            ("example.com".to_owned(), 80)
        );
        assert_eq!(
            parse_host_port("example.com", Some(22)).unwrap(),
            ("example.com".to_owned(), 22)
        );
        assert_eq!(
            parse_host_port("192.168.8.1:8443", None).unwrap(),
            ("192.168.8.1".to_owned(), 8443)
        );
        assert_eq!(
            parse_host_port("[fe80::1]:80", None).unwrap(),
            ("fe80::1".to_owned(), 80)
        );
        assert_eq!(
            parse_host_port("[::1]", Some(443)).unwrap(),
            ("::1".to_owned(), 443)
        );
        assert_eq!(
            parse_host_port("fe80::1", Some(443)).unwrap(),
            ("fe80::1".to_owned(), 443)
        );
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!(parse_host_port("example.com", None).is_err());
        assert!(parse_host_port("example.com:0", None).is_err());
        assert!(parse_host_port("example.com:notaport", None).is_err());
        assert!(parse_host_port("[fe80::1", None).is_err());
        assert!(parse_host_port("[fe80::1]80", None).is_err());
        assert!(parse_host_port("", Some(1)).is_err());
        assert!(parse_host_port(":80", None).is_err());
    }

    /// Law: `parse(format(host, port)) == (host, port)`, IPv6 bracketed.
    #[test]
    fn format_parse_round_trip() {
        let cases = [
            ("example.com", 80u16),
            ("192.168.8.1", 8443),
            ("fe80::1", 22),
            ("::1", 65535),
        ];
        for (host, port) in cases {
            let formatted = format_host_port(host, port);
            if host.contains(':') {
                assert!(formatted.starts_with('['), "{formatted}");
            }
            assert_eq!(
                parse_host_port(&formatted, None).unwrap(),
                (host.to_owned(), port),
                "{formatted}"
            );
        }
    }

    #[test]
    fn command_parse_and_format() {
        let cmd: JetCommand = "forward_to 192.168.8.1:80".parse().unwrap();
        assert_eq!(
            cmd,
            JetCommand::ForwardTo {
                host: "192.168.8.1".to_owned(),
                port: 80
            }
        );
        assert_eq!(cmd.to_string(), "forward_to 192.168.8.1:80");

        assert_eq!("disconnect".parse::<JetCommand>().unwrap(), JetCommand::Disconnect);
        assert_eq!(JetCommand::Disconnect.to_string(), "disconnect");

        assert!(" forward_to  [::1]:80 ".parse::<JetCommand>().is_ok());
        assert!("forward_to".parse::<JetCommand>().is_err());
        assert!("open_sesame x".parse::<JetCommand>().is_err());
    }
}

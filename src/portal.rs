//! Authentication events from the captive-portal front end.
//!
//! The HTTP front end runs in its own process. When a client logs in it
//! connects to a Unix stream socket and writes one line per event:
//!
//! ```text
//! auth_ok 10.0.0.9
//! ```
//!
//! Each line is answered with `ok` once the event is queued for the engine,
//! or `error: <reason>` when it cannot be parsed. A line longer than
//! [`MAX_LINE_LEN`] bytes closes the connection.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Longest accepted event line, newline excluded.
pub const MAX_LINE_LEN: usize = 256;

/// An event reported by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalEvent {
    /// The client at this address logged in.
    AuthOk(Ipv4Addr),
}

/// Malformed portal messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortalParseError {
    #[error("empty message")]
    Empty,

    #[error("unknown event kind {0:?}")]
    UnknownKind(String),

    #[error("missing client address")]
    MissingAddress,

    #[error("invalid client address {0:?}")]
    InvalidAddress(String),

    #[error("unexpected trailing data")]
    TrailingData,
}

impl FromStr for PortalEvent {
    type Err = PortalParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let kind = words.next().ok_or(PortalParseError::Empty)?;
        if kind != "auth_ok" {
            return Err(PortalParseError::UnknownKind(kind.to_string()));
        }

        let raw_ip = words.next().ok_or(PortalParseError::MissingAddress)?;
        let ip = raw_ip
            .parse()
            .map_err(|_| PortalParseError::InvalidAddress(raw_ip.to_string()))?;

        if words.next().is_some() {
            return Err(PortalParseError::TrailingData);
        }
        Ok(Self::AuthOk(ip))
    }
}

/// Listens for portal connections and forwards their events.
pub struct PortalListener {
    listener: UnixListener,
    path: PathBuf,
}

impl PortalListener {
    /// Bind the socket, replacing a stale one left by a previous run.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale portal socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Portal event socket listening");
        Ok(Self { listener, path })
    }

    /// Accept connections until the event channel closes.
    pub async fn serve(self, events: mpsc::Sender<PortalEvent>) -> io::Result<()> {
        loop {
            tokio::select! {
                () = events.closed() => {
                    debug!("Portal event channel closed, stopping listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, events).await {
                            warn!("Portal connection failed: {err}");
                        }
                    });
                }
            }
        }
    }
}

impl Drop for PortalListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    events: mpsc::Sender<PortalEvent>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(64);

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if buf.len() > MAX_LINE_LEN && !buf.ends_with(b"\n") {
            warn!(limit = MAX_LINE_LEN, "Portal message too long, closing connection");
            writer.write_all(b"error: line too long\n").await?;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match line.parse::<PortalEvent>() {
            Ok(event) => {
                debug!(?event, "Portal event received");
                if events.send(event).await.is_err() {
                    writer.write_all(b"error: shutting down\n").await?;
                    return Ok(());
                }
                "ok\n".to_string()
            }
            Err(err) => {
                warn!(%line, "Rejected portal message: {err}");
                format!("error: {err}\n")
            }
        };
        writer.write_all(reply.as_bytes()).await?;
    }
}

//! IPC server: one host client per accepted Unix socket connection.

use std::io;
use std::path::{Path, PathBuf};

use termhost_protocol::LineDecoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::host::{ClientLink, HostHandle};

/// Buffer size for socket reads.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line could not be framed or parsed.
    #[error("protocol error: {0}")]
    Protocol(#[from] termhost_protocol::ProtocolError),

    /// The daemon answered with `ok:false`.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// The connection closed before a response arrived.
    #[error("connection closed by daemon")]
    Closed,
}

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Missing parent directories are created (mode 0700 on Unix) and a
    /// stale socket file at `path` is removed first.
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                create_private_dir(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "IPC server listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// An accept error ends the loop and is returned; the socket file is
    /// removed either way.
    pub async fn serve(self, host: HostHandle, shutdown: CancellationToken) -> Result<(), IpcError> {
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => break Err(IpcError::Io(e)),
                    };
                    let link = match host.connect() {
                        Ok(link) => link,
                        Err(_) => {
                            tracing::debug!("Host stopped, no longer accepting");
                            break Ok(());
                        }
                    };
                    tokio::spawn(serve_connection(
                        stream,
                        host.clone(),
                        link,
                        shutdown.child_token(),
                    ));
                }
            }
        };

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }
        result
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Pumps one connection: socket lines into the host, queued lines out.
async fn serve_connection(
    stream: UnixStream,
    host: HostHandle,
    link: ClientLink,
    shutdown: CancellationToken,
) {
    let ClientLink {
        id: client,
        mut outbound,
    } = link;
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = LineDecoder::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    'conn: loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            queued = outbound.recv() => match queued {
                Some(line) => {
                    if let Err(e) = writer.write_all(&line).await {
                        tracing::debug!(client_id = client, error = %e, "Write to client failed");
                        break;
                    }
                }
                // The host dropped this client.
                None => break,
            },
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    if let Some(Ok(line)) = decoder.take_remaining() {
                        let _ = host.send_line(client, line);
                    }
                    break;
                }
                Ok(n) => {
                    decoder.push(&buffer[..n]);
                    while let Some(line) = decoder.next_line() {
                        match line {
                            Ok(line) => {
                                if host.send_line(client, line).is_err() {
                                    break 'conn;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(client_id = client, error = %e, "Dropping malformed line");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(client_id = client, error = %e, "Read from client failed");
                    break;
                }
            },
        }
    }

    host.disconnect(client);
}

//! IPC listener for the broker side
//!
//! Binds the Unix Domain Socket and turns every accepted connection into a
//! coordinator session.

use std::path::Path;

use eyre::{Context, Result, bail};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::stream::bridge;
use crate::channel;
use crate::coordinator::CoordinatorHandle;

/// Bind the broker socket, creating its directory as needed
///
/// A socket file left behind by a dead broker is replaced. One that still
/// accepts connections belongs to a running broker and is left alone.
pub fn bind_socket(socket_path: &Path) -> Result<UnixListener> {
    debug!(?socket_path, "bind_socket: called");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
            bail!("A broker is already listening on {}", socket_path.display());
        }
        info!(?socket_path, "Replacing stale broker socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    UnixListener::bind(socket_path).context("Failed to bind broker socket")
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if let Err(e) = std::fs::remove_file(socket_path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(?socket_path, error = %e, "Failed to remove broker socket");
    }
}

/// Accept connections forever, handing each one to the coordinator
pub async fn serve(listener: UnixListener, handle: CoordinatorHandle, session_buffer: usize, max_message_size: usize) {
    info!("Accepting broker connections");
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_session(stream, handle, session_buffer, max_message_size).await {
                        warn!(error = %e, "Failed to start session");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Failed to accept connection"),
        }
    }
}

async fn accept_session(
    stream: UnixStream,
    handle: CoordinatorHandle,
    session_buffer: usize,
    max_message_size: usize,
) -> Result<()> {
    let (broker_end, client_end) = channel::pair(session_buffer);
    let session_id = handle.add_session(broker_end).await?;
    debug!(session_id, "accept_session: bridging connection");

    let (to_broker, from_broker) = client_end.split();
    bridge(stream, to_broker, from_broker, max_message_size).await;

    debug!(session_id, "accept_session: connection finished");
    Ok(())
}

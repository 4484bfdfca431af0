//! IPC client side: reach a broker over its socket

use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::net::UnixStream;
use tracing::debug;

use super::stream::bridge;
use crate::channel::{self, ClientEnd};

/// Default timeout for establishing the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the broker socket and return the context end of a channel
///
/// The returned end behaves like an in-process channel; closing it closes the
/// socket.
pub async fn connect(socket_path: &Path, buffer: usize, max_message_size: usize) -> Result<ClientEnd> {
    debug!(?socket_path, "connect: called");

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .context("Connection timeout")?
        .context("Failed to connect to broker socket")?;

    let (broker_end, client_end) = channel::pair(buffer);
    let (to_client, from_client) = broker_end.split();
    tokio::spawn(bridge(stream, to_client, from_client, max_message_size));

    Ok(client_end)
}

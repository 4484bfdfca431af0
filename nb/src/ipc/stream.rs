//! Newline-delimited JSON framing shared by both socket ends

use eyre::{Context, Result, eyre};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read one message, returning `None` at end of stream
///
/// The limit excludes the newline. At most `max_message_size + 1` bytes are
/// buffered, so a peer that never sends a newline is cut off at the limit.
pub(crate) async fn read_message<R, M>(reader: &mut R, max_message_size: usize) -> Result<Option<M>>
where
    R: AsyncBufRead + Unpin,
    M: DeserializeOwned,
{
    let mut line = String::new();
    let limit = max_message_size as u64 + 1;
    let bytes_read = (&mut *reader)
        .take(limit)
        .read_line(&mut line)
        .await
        .context("Failed to read message")?;

    if bytes_read == 0 {
        return Ok(None);
    }
    let body_len = if line.ends_with('\n') { bytes_read - 1 } else { bytes_read };
    if body_len > max_message_size {
        return Err(eyre!("Message exceeds {} bytes", max_message_size));
    }

    let msg = serde_json::from_str(line.trim()).context("Failed to parse message")?;
    Ok(Some(msg))
}

/// Write one message followed by a newline
pub(crate) async fn write_message<W, M>(writer: &mut W, msg: &M, max_message_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let json = serde_json::to_string(msg).context("Failed to serialize message")?;
    if json.len() > max_message_size {
        return Err(eyre!("Message too large: {} bytes", json.len()));
    }

    writer.write_all(json.as_bytes()).await.context("Failed to write message")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush stream")?;
    Ok(())
}

/// Pump a socket into `inbound` and `outbound` into the socket
///
/// Returns once either direction ends. Dropping `inbound` on the way out is
/// what the other side observes as the channel closing.
pub(crate) async fn bridge<In, Out>(
    stream: UnixStream,
    inbound: mpsc::Sender<In>,
    mut outbound: mpsc::Receiver<Out>,
    max_message_size: usize,
) where
    In: DeserializeOwned + std::fmt::Debug + Send + 'static,
    Out: Serialize + std::fmt::Debug + Send + Sync + 'static,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = write_message(&mut write_half, &msg, max_message_size).await {
                warn!(error = %e, "Dropping connection after write failure");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    loop {
        match read_message::<_, In>(&mut reader, max_message_size).await {
            Ok(Some(msg)) => {
                debug!(?msg, "bridge: received");
                if inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("bridge: peer closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Closing connection after malformed message");
                break;
            }
        }
    }

    drop(inbound);
    writer.abort();
}

//! CoordinatorHandle - Client interface for broker communication

use eyre::{Result, eyre};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{BrokerSnapshot, CoordRequest, CoordinatorMetrics};
use super::session::SessionId;
use crate::channel::{self, BrokerEnd, ClientEnd};
use crate::error::BrokerError;

/// Handle for transports and in-process contexts to reach the Coordinator
///
/// This handle is cloneable. All operations are async and non-blocking.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordRequest>,
    session_buffer: usize,
}

impl CoordinatorHandle {
    pub(crate) fn new(tx: mpsc::Sender<CoordRequest>, session_buffer: usize) -> Self {
        debug!(session_buffer, "CoordinatorHandle::new: called");
        Self { tx, session_buffer }
    }

    /// Hand the broker end of a channel to the Coordinator
    pub async fn add_session(&self, channel: BrokerEnd) -> Result<SessionId> {
        debug!("CoordinatorHandle::add_session: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(CoordRequest::AddSession { channel, reply_tx })
            .await
            .map_err(|_| eyre!("Coordinator channel closed"))?;

        let id = reply_rx.await.map_err(|_| eyre!("Coordinator dropped session request"))?;
        debug!(session_id = id, "CoordinatorHandle::add_session: added");
        Ok(id)
    }

    /// Open an in-process channel and return its context end
    pub async fn connect(&self) -> Result<(SessionId, ClientEnd)> {
        debug!("CoordinatorHandle::connect: called");
        let (broker_end, client_end) = channel::pair(self.session_buffer);
        let id = self.add_session(broker_end).await?;
        Ok((id, client_end))
    }

    /// Queue an evaluation on behalf of `session_id` and wait for its result
    pub async fn evaluate(&self, session_id: SessionId, input: Value) -> Result<Value, BrokerError> {
        debug!(session_id, "CoordinatorHandle::evaluate: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(CoordRequest::Evaluate {
                session_id,
                input,
                reply_tx,
            })
            .await
            .map_err(|_| BrokerError::CoordinatorClosed)?;

        reply_rx.await.map_err(|_| BrokerError::CoordinatorClosed)?
    }

    /// Get current metrics from the Coordinator
    pub async fn metrics(&self) -> Result<CoordinatorMetrics> {
        debug!("CoordinatorHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(CoordRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| eyre!("Coordinator channel closed"))?;

        reply_rx.await.map_err(|_| eyre!("Metrics request cancelled"))
    }

    /// Get a point-in-time view of sessions, servers and queues
    pub async fn snapshot(&self) -> Result<BrokerSnapshot> {
        debug!("CoordinatorHandle::snapshot: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(CoordRequest::GetSnapshot { reply_tx })
            .await
            .map_err(|_| eyre!("Coordinator channel closed"))?;

        reply_rx.await.map_err(|_| eyre!("Snapshot request cancelled"))
    }

    /// Request Coordinator shutdown
    pub async fn shutdown(&self) -> Result<()> {
        debug!("CoordinatorHandle::shutdown: called");
        self.tx
            .send(CoordRequest::Shutdown)
            .await
            .map_err(|_| eyre!("Coordinator channel closed"))?;
        Ok(())
    }
}

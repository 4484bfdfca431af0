//! Message types for the Coordinator

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::oneshot;

use super::queue::{QueueKey, TaskId};
use super::session::{SessionId, SessionInfo};
use crate::channel::BrokerEnd;
use crate::correlator::CorrelationId;
use crate::error::BrokerError;
use crate::ipc::messages::ClientMessage;

/// Requests to the Coordinator task
///
/// Handles and collaborators send the public variants; the coordinator posts
/// the internal ones to itself from timers and reply watchers.
#[derive(Debug)]
pub enum CoordRequest {
    /// Adopt a newly connected channel
    AddSession {
        channel: BrokerEnd,
        reply_tx: oneshot::Sender<SessionId>,
    },

    /// Evaluate on behalf of a registered session
    Evaluate {
        session_id: SessionId,
        input: Value,
        reply_tx: oneshot::Sender<Result<Value, BrokerError>>,
    },

    /// Get current metrics
    GetMetrics {
        reply_tx: oneshot::Sender<CoordinatorMetrics>,
    },

    /// Get sessions, assignments and in-service tasks
    GetSnapshot {
        reply_tx: oneshot::Sender<BrokerSnapshot>,
    },

    /// Shutdown the coordinator
    Shutdown,

    /// A message arrived on a session's channel (internal)
    Inbound { session_id: SessionId, msg: ClientMessage },

    /// A session's channel closed (internal)
    ChannelClosed { session_id: SessionId },

    /// A correlated request's timer fired (internal)
    RequestTimeout {
        session_id: SessionId,
        correlation_id: CorrelationId,
    },

    /// Time to ping a session again (internal)
    HeartbeatDue { session_id: SessionId },

    /// A ping went unanswered (internal)
    HeartbeatFailed { session_id: SessionId },

    /// The forwarded request for an in-service task settled (internal)
    EvaluationSettled {
        key: QueueKey,
        task_id: TaskId,
        result: Result<Value, BrokerError>,
    },

    /// Backoff elapsed for a task that found no server (internal)
    RetryEvaluation { key: QueueKey, task_id: TaskId },
}

/// Point-in-time view of broker state
#[derive(Debug, Clone, Default)]
pub struct BrokerSnapshot {
    pub sessions: Vec<SessionInfo>,
    pub servers: BTreeMap<String, SessionId>,
    pub in_service: BTreeMap<QueueKey, TaskId>,
    pub queued: BTreeMap<QueueKey, usize>,
}

impl BrokerSnapshot {
    pub fn session(&self, id: SessionId) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

/// Coordinator metrics for observability
#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics {
    pub registered_sessions: usize,
    pub assigned_servers: usize,
    pub queued_tasks: usize,
    pub evaluations_completed: u64,
    pub evaluations_failed: u64,
    pub evaluations_requeued: u64,
    pub no_server_retries: u64,
    pub request_timeouts: u64,
    pub heartbeat_failures: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

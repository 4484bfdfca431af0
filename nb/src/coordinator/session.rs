//! Broker-side representative of one connected context

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::correlator::{CorrelationId, Correlator, ReplyReceiver};
use crate::error::BrokerError;
use crate::ipc::messages::BrokerMessage;

/// Broker-assigned session identifier, increasing in connection order
pub type SessionId = u64;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Connecting,
    AwaitingRegistration,
    Active,
    Closing,
    Closed,
}

/// What a session does for its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Not registered yet
    Unassigned,

    /// Only submits requests
    Consumer,

    /// Can run the resource but has not been elected
    Candidate,

    /// Elected to run the resource for everyone
    Server,
}

/// Observable summary of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub resource_name: Option<String>,
    pub role: Role,
    pub state: SessionState,
    pub pending_requests: usize,
    /// Time since the last answered ping
    pub since_heartbeat: Option<Duration>,
    /// Age of the longest-waiting request to this context
    pub oldest_request: Option<Duration>,
}

/// One connected context, owned by the coordinator task
#[derive(Debug)]
pub struct ClientSession {
    pub id: SessionId,
    pub resource_name: Option<String>,
    pub role: Role,
    pub state: SessionState,
    /// Position in registration order, used to break election ties
    pub registered_seq: Option<u64>,
    pub last_heartbeat_at: Option<Instant>,
    outbound: mpsc::Sender<BrokerMessage>,
    correlator: Correlator<Value>,
    reader: Option<AbortHandle>,
}

impl ClientSession {
    pub fn new(id: SessionId, outbound: mpsc::Sender<BrokerMessage>) -> Self {
        debug!(session_id = id, "ClientSession::new: called");
        Self {
            id,
            resource_name: None,
            role: Role::Unassigned,
            state: SessionState::Connecting,
            registered_seq: None,
            last_heartbeat_at: None,
            outbound,
            correlator: Correlator::new(),
            reader: None,
        }
    }

    /// Channel established: start waiting for `register`
    pub fn attach_reader(&mut self, reader: AbortHandle) {
        self.reader = Some(reader);
        self.state = SessionState::AwaitingRegistration;
    }

    /// Record a successful registration
    pub fn register(&mut self, resource_name: String, can_serve: bool, seq: u64) {
        debug!(session_id = self.id, %resource_name, can_serve, "ClientSession::register: called");
        self.resource_name = Some(resource_name);
        self.role = if can_serve { Role::Candidate } else { Role::Consumer };
        self.registered_seq = Some(seq);
        self.state = SessionState::Active;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether this session may be elected for `name`
    pub fn is_candidate_for(&self, name: &str) -> bool {
        self.is_active() && self.role == Role::Candidate && self.resource_name.as_deref() == Some(name)
    }

    pub fn outbound(&self) -> mpsc::Sender<BrokerMessage> {
        self.outbound.clone()
    }

    /// Send a message that expects no reply
    ///
    /// Never waits for room: a context that stops draining its channel gets
    /// `ChannelFull` here and the coordinator keeps serving everyone else.
    pub fn notify(&self, msg: BrokerMessage) -> Result<(), BrokerError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::ChannelFull(self.id),
            TrySendError::Closed(_) => BrokerError::ChannelClosed,
        })
    }

    /// Send a correlated request
    ///
    /// `build` receives the fresh correlation id. With a timeout, `expired` is
    /// posted to `notify` when it elapses and the owner should call
    /// [`ClientSession::expire`].
    pub fn request<M>(
        &mut self,
        build: impl FnOnce(CorrelationId) -> BrokerMessage,
        timeout: Option<Duration>,
        notify: &mpsc::Sender<M>,
        expired: impl FnOnce(CorrelationId) -> M,
    ) -> Result<(CorrelationId, ReplyReceiver<Value>), BrokerError>
    where
        M: Send + 'static,
    {
        let (id, reply_rx) = self.correlator.begin();

        if let Err(error) = self.notify(build(id)) {
            self.correlator.reject(id, error.clone());
            return Err(error);
        }

        if let Some(timeout) = timeout {
            self.correlator.arm_timeout(id, timeout, notify.clone(), expired(id));
        }
        Ok((id, reply_rx))
    }

    /// Deliver a reply from the context
    pub fn on_reply(&mut self, id: CorrelationId, result: Result<Value, BrokerError>) -> bool {
        match result {
            Ok(value) => self.correlator.resolve(id, value),
            Err(error) => self.correlator.reject(id, error),
        }
    }

    /// A request timer fired
    pub fn expire(&mut self, id: CorrelationId) -> bool {
        self.correlator.expire(id)
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_at = Some(Instant::now());
    }

    /// Stop reading from the channel; the session takes no new work
    pub fn begin_closing(&mut self) {
        debug!(session_id = self.id, "ClientSession::begin_closing: called");
        self.state = SessionState::Closing;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Reject every outstanding request and mark the session closed
    pub fn close(&mut self) -> usize {
        let rejected = self.correlator.reject_all(BrokerError::ChannelClosed);
        self.state = SessionState::Closed;
        debug!(session_id = self.id, rejected, "ClientSession::close: closed");
        rejected
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            resource_name: self.resource_name.clone(),
            role: self.role,
            state: self.state,
            pending_requests: self.correlator.len(),
            since_heartbeat: self.last_heartbeat_at.map(|at| at.elapsed()),
            oldest_request: self.correlator.oldest_age(),
        }
    }
}

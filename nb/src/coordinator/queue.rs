//! Serialized evaluation queue

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::config::QueueScope;
use super::session::SessionId;
use crate::correlator::{CorrelationId, ReplyReceiver};
use crate::error::BrokerError;

/// Broker-wide task identifier
pub type TaskId = u64;

/// Which queue a task waits in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKey {
    Global,
    Resource(String),
}

impl QueueKey {
    pub fn for_resource(scope: QueueScope, resource_name: &str) -> Self {
        match scope {
            QueueScope::Global => QueueKey::Global,
            QueueScope::PerResource => QueueKey::Resource(resource_name.to_string()),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKey::Global => write!(f, "*"),
            QueueKey::Resource(name) => write!(f, "{}", name),
        }
    }
}

/// One evaluate call waiting for, or holding, the in-service slot
#[derive(Debug)]
pub struct EvaluationTask {
    pub id: TaskId,
    pub payload: Value,
    pub requester: SessionId,
    pub resource_name: String,
    /// Servicing attempts that found no server
    pub attempts: u32,
    /// Server session and correlation id of the forwarded request
    pub forwarded_to: Option<(SessionId, CorrelationId)>,
    /// A backoff timer is pending for this task
    pub retry_scheduled: bool,
    reply_tx: oneshot::Sender<Result<Value, BrokerError>>,
}

impl EvaluationTask {
    pub fn new(
        id: TaskId,
        payload: Value,
        requester: SessionId,
        resource_name: String,
    ) -> (Self, ReplyReceiver<Value>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self::with_reply(id, payload, requester, resource_name, reply_tx), reply_rx)
    }

    /// Build a task that settles into an existing reply channel
    pub fn with_reply(
        id: TaskId,
        payload: Value,
        requester: SessionId,
        resource_name: String,
        reply_tx: oneshot::Sender<Result<Value, BrokerError>>,
    ) -> Self {
        Self {
            id,
            payload,
            requester,
            resource_name,
            attempts: 0,
            forwarded_to: None,
            retry_scheduled: false,
            reply_tx,
        }
    }

    fn settle(self, result: Result<Value, BrokerError>) {
        debug!(task_id = self.id, ok = result.is_ok(), "EvaluationTask::settle: called");
        let _ = self.reply_tx.send(result);
    }
}

/// FIFO queue with a single in-service slot
#[derive(Debug, Default)]
pub struct EvaluationQueue {
    waiting: VecDeque<EvaluationTask>,
    in_service: Option<EvaluationTask>,
}

impl EvaluationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task, returning true if it entered service immediately
    pub fn push(&mut self, task: EvaluationTask) -> bool {
        if self.in_service.is_none() {
            debug!(task_id = task.id, "EvaluationQueue::push: entering service");
            self.in_service = Some(task);
            true
        } else {
            debug!(task_id = task.id, waiting = self.waiting.len(), "EvaluationQueue::push: queued");
            self.waiting.push_back(task);
            false
        }
    }

    pub fn in_service(&self) -> Option<&EvaluationTask> {
        self.in_service.as_ref()
    }

    pub fn in_service_mut(&mut self) -> Option<&mut EvaluationTask> {
        self.in_service.as_mut()
    }

    /// Whether `id` currently holds the slot
    pub fn is_serving(&self, id: TaskId) -> bool {
        self.in_service.as_ref().is_some_and(|t| t.id == id)
    }

    /// Settle the in-service task and move the next task into service
    ///
    /// Returns the id of the task that entered service, if any.
    pub fn finish(&mut self, result: Result<Value, BrokerError>) -> Option<TaskId> {
        if let Some(task) = self.in_service.take() {
            task.settle(result);
        }
        self.advance()
    }

    /// Reject every task issued by `requester`
    ///
    /// Returns the number rejected and the id of a task that entered service
    /// because the requester's task had been holding the slot.
    pub fn reject_requester(&mut self, requester: SessionId, error: &BrokerError) -> (usize, Option<TaskId>) {
        let mut rejected = 0;
        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for task in self.waiting.drain(..) {
            if task.requester == requester {
                task.settle(Err(error.clone()));
                rejected += 1;
            } else {
                kept.push_back(task);
            }
        }
        self.waiting = kept;

        let mut started = None;
        if self.in_service.as_ref().is_some_and(|t| t.requester == requester) {
            rejected += 1;
            started = self.finish(Err(error.clone()));
        }
        (rejected, started)
    }

    /// Reject everything, used at shutdown
    pub fn reject_all(&mut self, error: &BrokerError) -> usize {
        let mut rejected = 0;
        if let Some(task) = self.in_service.take() {
            task.settle(Err(error.clone()));
            rejected += 1;
        }
        for task in self.waiting.drain(..) {
            task.settle(Err(error.clone()));
            rejected += 1;
        }
        rejected
    }

    fn advance(&mut self) -> Option<TaskId> {
        self.in_service = self.waiting.pop_front();
        self.in_service.as_ref().map(|t| t.id)
    }

    /// Tasks waiting behind the in-service one
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Total tasks, including the in-service one
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_service.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.in_service.is_none() && self.waiting.is_empty()
    }
}

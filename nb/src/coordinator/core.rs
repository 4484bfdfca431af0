//! Main Coordinator task implementation

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::config::CoordinatorConfig;
use super::handle::CoordinatorHandle;
use super::messages::{BrokerSnapshot, CoordRequest, CoordinatorMetrics};
use super::queue::{EvaluationQueue, EvaluationTask, QueueKey, TaskId};
use super::registry::ResourceRegistry;
use super::session::{ClientSession, SessionId};
use crate::channel::BrokerEnd;
use crate::correlator::CorrelationId;
use crate::error::BrokerError;
use crate::ipc::messages::{BrokerMessage, ClientMessage};

/// The Coordinator owns every session, the registry and the evaluation queues
///
/// All state lives on the single task started by [`Coordinator::run`]; every
/// other party talks to it through [`CoordRequest`]s, so no locking is needed.
pub struct Coordinator {
    config: CoordinatorConfig,
    tx: mpsc::Sender<CoordRequest>,
    rx: mpsc::Receiver<CoordRequest>,
}

impl Coordinator {
    /// Create a new Coordinator with the given configuration
    pub fn new(config: CoordinatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        Self { config, tx, rx }
    }

    /// Get a sender for creating handles
    pub fn sender(&self) -> mpsc::Sender<CoordRequest> {
        self.tx.clone()
    }

    /// Get a handle for collaborators
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(self.tx.clone(), self.config.session_channel_buffer)
    }

    /// Run the Coordinator task
    ///
    /// This consumes the Coordinator and runs until shutdown is requested.
    pub async fn run(mut self) {
        let mut state = BrokerState::new(self.config.clone(), self.tx.clone());

        info!("Coordinator started");

        while let Some(req) = self.rx.recv().await {
            if let CoordRequest::Shutdown = req {
                info!("Coordinator shutting down");
                break;
            }
            state.handle(req);
            state.drain_ready();
        }

        state.shutdown();
        info!("Coordinator stopped");
    }
}

/// Broker-wide mutable state, touched only by the coordinator task
struct BrokerState {
    config: CoordinatorConfig,
    self_tx: mpsc::Sender<CoordRequest>,
    sessions: BTreeMap<SessionId, ClientSession>,
    registry: ResourceRegistry,
    queues: BTreeMap<QueueKey, EvaluationQueue>,
    /// Queues whose in-service task needs a servicing attempt
    ready: VecDeque<QueueKey>,
    next_session_id: SessionId,
    next_registration_seq: u64,
    next_task_id: TaskId,
    metrics: CoordinatorMetrics,
}

impl BrokerState {
    fn new(config: CoordinatorConfig, self_tx: mpsc::Sender<CoordRequest>) -> Self {
        Self {
            config,
            self_tx,
            sessions: BTreeMap::new(),
            registry: ResourceRegistry::new(),
            queues: BTreeMap::new(),
            ready: VecDeque::new(),
            next_session_id: 0,
            next_registration_seq: 0,
            next_task_id: 0,
            metrics: CoordinatorMetrics::default(),
        }
    }

    fn handle(&mut self, req: CoordRequest) {
        match req {
            CoordRequest::AddSession { channel, reply_tx } => {
                let id = self.add_session(channel);
                let _ = reply_tx.send(id);
            }

            CoordRequest::Evaluate {
                session_id,
                input,
                reply_tx,
            } => {
                self.enqueue(session_id, input, reply_tx);
            }

            CoordRequest::GetMetrics { reply_tx } => {
                let _ = reply_tx.send(self.metrics());
            }

            CoordRequest::GetSnapshot { reply_tx } => {
                let _ = reply_tx.send(self.snapshot());
            }

            CoordRequest::Shutdown => {}

            CoordRequest::Inbound { session_id, msg } => {
                self.metrics.messages_received += 1;
                self.handle_inbound(session_id, msg);
            }

            CoordRequest::ChannelClosed { session_id } => {
                self.close_session(session_id, "channel closed");
            }

            CoordRequest::RequestTimeout {
                session_id,
                correlation_id,
            } => {
                if let Some(session) = self.sessions.get_mut(&session_id)
                    && session.expire(correlation_id)
                {
                    self.metrics.request_timeouts += 1;
                }
            }

            CoordRequest::HeartbeatDue { session_id } => {
                self.send_ping(session_id);
            }

            CoordRequest::HeartbeatFailed { session_id } => {
                warn!(session_id, "Heartbeat failed");
                self.metrics.heartbeat_failures += 1;
                self.close_session(session_id, "heartbeat timeout");
            }

            CoordRequest::EvaluationSettled { key, task_id, result } => {
                self.settle(key, task_id, result);
            }

            CoordRequest::RetryEvaluation { key, task_id } => {
                if let Some(task) = self.queues.get_mut(&key).and_then(|q| q.in_service_mut())
                    && task.id == task_id
                {
                    task.retry_scheduled = false;
                    self.ready.push_back(key);
                }
            }
        }
    }

    fn add_session(&mut self, channel: BrokerEnd) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let (outbound, mut inbound) = channel.split();
        let mut session = ClientSession::new(id, outbound);

        let tx = self.self_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if tx.send(CoordRequest::Inbound { session_id: id, msg }).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(CoordRequest::ChannelClosed { session_id: id }).await;
        });
        session.attach_reader(reader.abort_handle());

        self.sessions.insert(id, session);
        info!(session_id = id, "Session connected");
        id
    }

    fn handle_inbound(&mut self, session_id: SessionId, msg: ClientMessage) {
        debug!(session_id, ?msg, "handle_inbound: called");
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(session_id, "handle_inbound: session already gone");
            return;
        };

        match msg {
            ClientMessage::Register {
                resource_name,
                kind,
                can_serve,
            } => {
                self.register(session_id, resource_name, kind, can_serve);
            }

            ClientMessage::Unregister => {
                self.close_session(session_id, "unregistered");
            }

            ClientMessage::Pong { correlation_id } => {
                if session.on_reply(correlation_id, Ok(Value::Null)) {
                    session.record_heartbeat();
                } else {
                    debug!(session_id, correlation_id, "Late pong ignored");
                }
            }

            ClientMessage::Evaluate { correlation_id, input } => {
                self.enqueue_for_channel(session_id, correlation_id, input);
            }

            ClientMessage::Evaluated { correlation_id, output } => {
                if !session.on_reply(correlation_id, Ok(output)) {
                    warn!(session_id, correlation_id, "Reply for unknown request ignored");
                }
            }

            ClientMessage::EvaluateFailed {
                correlation_id,
                message,
            } => {
                if !session.on_reply(correlation_id, Err(BrokerError::EvaluationFailed(message))) {
                    warn!(session_id, correlation_id, "Failure for unknown request ignored");
                }
            }
        }
    }

    fn register(&mut self, session_id: SessionId, resource_name: String, kind: String, can_serve: bool) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        if session.registered_seq.is_some() {
            warn!(session_id, %resource_name, "Duplicate registration ignored");
            return;
        }

        if !self.config.knows_kind(&kind) {
            let error = BrokerError::UnknownResourceKind(kind);
            warn!(session_id, %resource_name, %error, "Registration rejected");
            let rejected = session.notify(BrokerMessage::RegisterRejected {
                reason: error.to_string(),
            });
            match rejected {
                Ok(()) => self.metrics.messages_sent += 1,
                Err(error) => self.close_session(session_id, &error.to_string()),
            }
            return;
        }

        let seq = self.next_registration_seq;
        self.next_registration_seq += 1;
        session.register(resource_name.clone(), can_serve, seq);
        info!(session_id, resource = %resource_name, %kind, can_serve, "Session registered");

        if let Err(error) = session.notify(BrokerMessage::Registered { session_id }) {
            self.close_session(session_id, &error.to_string());
            return;
        }
        self.metrics.messages_sent += 1;

        self.send_ping(session_id);

        if can_serve {
            self.registry.select_server(&resource_name, &mut self.sessions);
        }
    }

    /// Ping a session; the reply watcher schedules the next round or reports failure
    fn send_ping(&mut self, session_id: SessionId) {
        let timeout = self.config.heartbeat_timeout();
        let interval = self.config.heartbeat_interval();

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !session.is_active() {
            return;
        }

        let sent = session
            .request(
                |correlation_id| BrokerMessage::Ping { correlation_id },
                Some(timeout),
                &self.self_tx,
                |correlation_id| CoordRequest::RequestTimeout {
                    session_id,
                    correlation_id,
                },
            );

        match sent {
            Ok((correlation_id, reply_rx)) => {
                debug!(session_id, correlation_id, "send_ping: ping sent");
                self.metrics.messages_sent += 1;
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    match reply_rx.await {
                        Ok(Ok(_)) => {
                            tokio::time::sleep(interval).await;
                            let _ = tx.send(CoordRequest::HeartbeatDue { session_id }).await;
                        }
                        Ok(Err(BrokerError::RequestTimeout(_))) => {
                            let _ = tx.send(CoordRequest::HeartbeatFailed { session_id }).await;
                        }
                        // Session closed; stop pinging
                        _ => {}
                    }
                });
            }
            Err(error) => self.close_session(session_id, &error.to_string()),
        }
    }

    fn enqueue(
        &mut self,
        session_id: SessionId,
        input: Value,
        reply_tx: oneshot::Sender<Result<Value, BrokerError>>,
    ) {
        let Some(session) = self.sessions.get(&session_id) else {
            let _ = reply_tx.send(Err(BrokerError::UnknownSession(session_id)));
            return;
        };
        let Some(resource_name) = session.resource_name.clone().filter(|_| session.is_active()) else {
            let _ = reply_tx.send(Err(BrokerError::NotRegistered(session_id)));
            return;
        };

        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let key = QueueKey::for_resource(self.config.queue_scope, &resource_name);
        debug!(session_id, task_id, queue = %key, "enqueue: evaluation task created");

        let task = EvaluationTask::with_reply(task_id, input, session_id, resource_name, reply_tx);
        if self.queues.entry(key.clone()).or_default().push(task) {
            self.ready.push_back(key);
        }
    }

    /// Evaluate for a consumer on a channel and deliver the result back over it
    fn enqueue_for_channel(&mut self, session_id: SessionId, correlation_id: CorrelationId, input: Value) {
        let Some(outbound) = self.sessions.get(&session_id).map(|s| s.outbound()) else {
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(session_id, input, reply_tx);

        tokio::spawn(async move {
            let msg = match reply_rx.await {
                Ok(Ok(output)) => BrokerMessage::Evaluated { correlation_id, output },
                Ok(Err(BrokerError::ChannelClosed)) | Err(_) => return,
                Ok(Err(BrokerError::EvaluationFailed(message))) => BrokerMessage::EvaluateFailed {
                    correlation_id,
                    message,
                },
                Ok(Err(error)) => BrokerMessage::EvaluateFailed {
                    correlation_id,
                    message: error.to_string(),
                },
            };
            if outbound.send(msg).await.is_err() {
                debug!(session_id, correlation_id, "Consumer left before its result arrived");
            }
        });
    }

    fn drain_ready(&mut self) {
        while let Some(key) = self.ready.pop_front() {
            self.service(key);
        }
    }

    /// Try to hand the in-service task of `key` to a server
    fn service(&mut self, key: QueueKey) {
        let Some(task) = self.queues.get_mut(&key).and_then(|q| q.in_service_mut()) else {
            return;
        };
        if task.forwarded_to.is_some() || task.retry_scheduled {
            return;
        }
        let task_id = task.id;
        let resource_name = task.resource_name.clone();

        let Some(server_id) = self.registry.select_server(&resource_name, &mut self.sessions).server() else {
            self.schedule_retry(key, task_id, resource_name);
            return;
        };

        let Some(server) = self.sessions.get_mut(&server_id) else {
            return;
        };
        let Some(task) = self.queues.get_mut(&key).and_then(|q| q.in_service_mut()) else {
            return;
        };
        let input = task.payload.clone();

        let sent = server
            .request(
                |correlation_id| BrokerMessage::Evaluate { correlation_id, input },
                None,
                &self.self_tx,
                |correlation_id| CoordRequest::RequestTimeout {
                    session_id: server_id,
                    correlation_id,
                },
            );

        match sent {
            Ok((correlation_id, reply_rx)) => {
                debug!(task_id, session_id = server_id, correlation_id, "service: forwarded to server");
                self.metrics.messages_sent += 1;
                task.forwarded_to = Some((server_id, correlation_id));

                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    let result = reply_rx.await.unwrap_or(Err(BrokerError::ChannelClosed));
                    let _ = tx.send(CoordRequest::EvaluationSettled { key, task_id, result }).await;
                });
            }
            Err(error) => {
                warn!(task_id, session_id = server_id, %error, "Server unreachable, re-electing");
                self.close_session(server_id, &error.to_string());
                self.ready.push_back(key);
            }
        }
    }

    fn schedule_retry(&mut self, key: QueueKey, task_id: TaskId, resource_name: String) {
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };
        let Some(task) = queue.in_service_mut() else {
            return;
        };

        task.attempts += 1;
        self.metrics.no_server_retries += 1;

        if !self.config.retry.allows(task.attempts) {
            warn!(task_id, resource = %resource_name, attempts = task.attempts, "No server available, giving up");
            self.metrics.evaluations_failed += 1;
            if queue.finish(Err(BrokerError::NoServerAvailable(resource_name))).is_some() {
                self.ready.push_back(key);
            } else {
                self.queues.remove(&key);
            }
            return;
        }

        warn!(
            task_id,
            resource = %resource_name,
            attempt = task.attempts,
            "No server registered for evaluation, retrying"
        );
        task.retry_scheduled = true;

        let interval = self.config.retry.interval();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(CoordRequest::RetryEvaluation { key, task_id }).await;
        });
    }

    fn settle(&mut self, key: QueueKey, task_id: TaskId, result: Result<Value, BrokerError>) {
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };
        if !queue.is_serving(task_id) {
            debug!(task_id, "settle: task no longer in service, discarding result");
            return;
        }

        let started = match result {
            Ok(output) => {
                debug!(task_id, "settle: evaluation completed");
                self.metrics.evaluations_completed += 1;
                queue.finish(Ok(output))
            }
            Err(error) if error.is_retryable() => {
                warn!(task_id, %error, "Evaluation interrupted, requeueing");
                self.metrics.evaluations_requeued += 1;
                if let Some(task) = queue.in_service_mut() {
                    task.forwarded_to = None;
                }
                self.ready.push_back(key);
                return;
            }
            Err(error) => {
                warn!(task_id, %error, "Evaluation failed");
                self.metrics.evaluations_failed += 1;
                queue.finish(Err(error))
            }
        };

        if started.is_some() {
            self.ready.push_back(key);
        } else if queue.is_empty() {
            self.queues.remove(&key);
        }
    }

    /// Move a session through Closing to Closed
    ///
    /// Its registry entries are cleared first so that requeued work re-elects.
    fn close_session(&mut self, session_id: SessionId, reason: &str) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        session.begin_closing();
        info!(session_id, %reason, "Session closing");

        for resource in self.registry.release_session(session_id) {
            info!(resource = %resource, session_id, "Failover: resource has no server");
        }

        let rejected = session.close();
        debug!(session_id, rejected, "close_session: pending requests rejected");

        let mut emptied = Vec::new();
        for (key, queue) in self.queues.iter_mut() {
            let (count, started) = queue.reject_requester(session_id, &BrokerError::ChannelClosed);
            if count > 0 {
                debug!(session_id, queue = %key, count, "close_session: requester tasks rejected");
            }
            if started.is_some() {
                self.ready.push_back(key.clone());
            } else if queue.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.queues.remove(&key);
        }
    }

    fn metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            registered_sessions: self.sessions.values().filter(|s| s.is_active()).count(),
            assigned_servers: self.registry.len(),
            queued_tasks: self.queues.values().map(|q| q.len()).sum(),
            ..self.metrics.clone()
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            sessions: self.sessions.values().map(|s| s.info()).collect(),
            servers: self.registry.assignments().clone(),
            in_service: self
                .queues
                .iter()
                .filter_map(|(key, q)| q.in_service().map(|t| (key.clone(), t.id)))
                .collect(),
            queued: self.queues.iter().map(|(key, q)| (key.clone(), q.waiting())).collect(),
        }
    }

    fn shutdown(&mut self) {
        for queue in self.queues.values_mut() {
            queue.reject_all(&BrokerError::CoordinatorClosed);
        }
        self.queues.clear();

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id, "coordinator shutdown");
        }
    }
}

//! Context-side endpoint of a broker channel
//!
//! A [`BrokerClient`] registers a context with the broker and keeps it alive:
//! it answers heartbeat pings, runs forwarded evaluations on the local
//! [`InferenceEngine`] when the context serves, and submits the context's own
//! evaluations through its correlator.

mod engine;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use engine::{EchoEngine, InferenceEngine, ModelLoader};

use crate::channel::ClientEnd;
use crate::coordinator::SessionId;
use crate::correlator::{CorrelationId, Correlator, ReplyReceiver};
use crate::error::BrokerError;
use crate::ipc::messages::{BrokerMessage, ClientMessage, DEFAULT_RESOURCE_KIND};

/// What a context declares when it registers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub resource_name: String,
    pub kind: String,
    pub can_serve: bool,
}

impl Registration {
    /// Register to submit requests only
    pub fn consumer(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            kind: DEFAULT_RESOURCE_KIND.to_string(),
            can_serve: false,
        }
    }

    /// Register as able to run the resource
    pub fn server(resource_name: impl Into<String>) -> Self {
        Self {
            can_serve: true,
            ..Self::consumer(resource_name)
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// Registration progress as seen by the context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    Pending,
    Registered(SessionId),
    Rejected(String),
    Closed,
}

enum ClientRequest {
    Evaluate {
        input: Value,
        timeout: Option<Duration>,
        reply_tx: oneshot::Sender<Result<ReplyReceiver<Value>, BrokerError>>,
    },
    Expired {
        correlation_id: CorrelationId,
    },
    Unregister,
}

/// Handle to a registered context
#[derive(Clone)]
pub struct BrokerClient {
    tx: mpsc::Sender<ClientRequest>,
    status: watch::Receiver<RegistrationStatus>,
    kind: String,
}

impl BrokerClient {
    /// Send `register` over `channel` and start answering the broker
    ///
    /// A serving context without an engine answers every forwarded evaluation
    /// with `evaluate-failed`.
    pub async fn connect(
        channel: ClientEnd,
        registration: Registration,
        engine: Option<Arc<dyn InferenceEngine>>,
        loader: Option<Arc<dyn ModelLoader>>,
    ) -> Result<Self, BrokerError> {
        debug!(resource = %registration.resource_name, can_serve = registration.can_serve, "BrokerClient::connect: called");
        let (to_broker, from_broker) = channel.split();

        to_broker
            .send(ClientMessage::Register {
                resource_name: registration.resource_name.clone(),
                kind: registration.kind.clone(),
                can_serve: registration.can_serve,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;

        let (tx, rx) = mpsc::channel(64);
        let (status_tx, status) = watch::channel(RegistrationStatus::Pending);

        let actor = ClientActor {
            to_broker,
            from_broker,
            rx,
            self_tx: tx.clone(),
            correlator: Correlator::new(),
            engine,
            loader,
            status: status_tx,
            kind: registration.kind.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            tx,
            status,
            kind: registration.kind,
        })
    }

    /// Wait for the broker to accept or refuse the registration
    pub async fn registered(&self) -> Result<SessionId, BrokerError> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| *s != RegistrationStatus::Pending)
            .await
            .map_err(|_| BrokerError::ChannelClosed)?
            .clone();

        match settled {
            RegistrationStatus::Registered(id) => Ok(id),
            RegistrationStatus::Rejected(_) => Err(BrokerError::UnknownResourceKind(self.kind.clone())),
            RegistrationStatus::Pending | RegistrationStatus::Closed => Err(BrokerError::ChannelClosed),
        }
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status.borrow().clone()
    }

    /// Submit an evaluation through the broker
    ///
    /// With `timeout`, the call rejects with `RequestTimeout` if no reply
    /// arrives in time. Without one it waits as long as the broker does.
    pub async fn evaluate(&self, input: Value, timeout: Option<Duration>) -> Result<Value, BrokerError> {
        debug!(?timeout, "BrokerClient::evaluate: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ClientRequest::Evaluate {
                input,
                timeout,
                reply_tx,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;

        let pending = reply_rx.await.map_err(|_| BrokerError::ChannelClosed)??;
        pending.await.map_err(|_| BrokerError::ChannelClosed)?
    }

    /// Leave the broker; outstanding evaluations reject with `ChannelClosed`
    pub async fn unregister(&self) -> Result<(), BrokerError> {
        debug!("BrokerClient::unregister: called");
        self.tx
            .send(ClientRequest::Unregister)
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Resolves once the connection to the broker is gone
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| *s == RegistrationStatus::Closed).await;
    }
}

struct ClientActor {
    to_broker: mpsc::Sender<ClientMessage>,
    from_broker: mpsc::Receiver<BrokerMessage>,
    rx: mpsc::Receiver<ClientRequest>,
    self_tx: mpsc::Sender<ClientRequest>,
    correlator: Correlator<Value>,
    engine: Option<Arc<dyn InferenceEngine>>,
    loader: Option<Arc<dyn ModelLoader>>,
    status: watch::Sender<RegistrationStatus>,
    kind: String,
}

impl ClientActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.from_broker.recv() => match msg {
                    Some(msg) => self.on_broker(msg).await,
                    None => {
                        debug!("ClientActor::run: broker closed the channel");
                        break;
                    }
                },
                req = self.rx.recv() => match req {
                    Some(ClientRequest::Unregister) => {
                        let _ = self.to_broker.send(ClientMessage::Unregister).await;
                        info!("Unregistered from broker");
                        break;
                    }
                    Some(req) => self.on_request(req).await,
                    None => break,
                },
            }
        }

        let rejected = self.correlator.reject_all(BrokerError::ChannelClosed);
        debug!(rejected, "ClientActor::run: stopped");
        self.status.send_replace(RegistrationStatus::Closed);
    }

    async fn on_broker(&mut self, msg: BrokerMessage) {
        match msg {
            BrokerMessage::Registered { session_id } => {
                info!(session_id, "Registered with broker");
                self.status.send_replace(RegistrationStatus::Registered(session_id));
            }

            BrokerMessage::RegisterRejected { reason } => {
                warn!(%reason, "Registration rejected");
                self.correlator
                    .reject_all(BrokerError::UnknownResourceKind(self.kind.clone()));
                self.status.send_replace(RegistrationStatus::Rejected(reason));
            }

            BrokerMessage::Ping { correlation_id } => {
                let _ = self.to_broker.send(ClientMessage::Pong { correlation_id }).await;
            }

            BrokerMessage::Evaluate { correlation_id, input } => {
                self.serve(correlation_id, input);
            }

            BrokerMessage::Evaluated { correlation_id, output } => {
                if !self.correlator.resolve(correlation_id, output) {
                    debug!(correlation_id, "Result for abandoned request dropped");
                }
            }

            BrokerMessage::EvaluateFailed { correlation_id, message } => {
                self.correlator
                    .reject(correlation_id, BrokerError::EvaluationFailed(message));
            }
        }
    }

    /// Run a forwarded evaluation off the actor so pings keep flowing
    fn serve(&self, correlation_id: CorrelationId, input: Value) {
        let to_broker = self.to_broker.clone();
        let engine = self.engine.clone();
        let loader = self.loader.clone();

        tokio::spawn(async move {
            let result = match engine {
                Some(engine) => {
                    let ready = match loader {
                        Some(loader) => loader.ready().await,
                        None => Ok(()),
                    };
                    match ready {
                        Ok(()) => engine.run(input).await,
                        Err(e) => Err(e),
                    }
                }
                None => Err(eyre::eyre!("No inference engine in this context")),
            };

            let reply = match result {
                Ok(output) => ClientMessage::Evaluated { correlation_id, output },
                Err(e) => {
                    warn!(correlation_id, error = %e, "Evaluation failed");
                    ClientMessage::EvaluateFailed {
                        correlation_id,
                        message: e.to_string(),
                    }
                }
            };
            let _ = to_broker.send(reply).await;
        });
    }

    async fn on_request(&mut self, req: ClientRequest) {
        match req {
            ClientRequest::Evaluate {
                input,
                timeout,
                reply_tx,
            } => {
                if matches!(*self.status.borrow(), RegistrationStatus::Rejected(_)) {
                    let _ = reply_tx.send(Err(BrokerError::UnknownResourceKind(self.kind.clone())));
                    return;
                }

                let (correlation_id, pending) = self.correlator.begin();
                if self
                    .to_broker
                    .send(ClientMessage::Evaluate { correlation_id, input })
                    .await
                    .is_err()
                {
                    self.correlator.reject(correlation_id, BrokerError::ChannelClosed);
                } else if let Some(timeout) = timeout {
                    self.correlator.arm_timeout(
                        correlation_id,
                        timeout,
                        self.self_tx.clone(),
                        ClientRequest::Expired { correlation_id },
                    );
                }
                let _ = reply_tx.send(Ok(pending));
            }

            ClientRequest::Expired { correlation_id } => {
                self.correlator.expire(correlation_id);
            }

            ClientRequest::Unregister => {}
        }
    }
}

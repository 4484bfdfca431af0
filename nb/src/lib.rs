//! nnbroker - Shared Neural Model Broker
//!
//! Many isolated contexts may want the same expensive model. The broker elects
//! one context per resource name to load and run it, routes every other
//! context's evaluations to that server, and fails over when it goes quiet.
//!
//! # Core Concepts
//!
//! - **One Server Per Name**: election picks the earliest eligible registration
//! - **Correlated Requests**: replies are matched to requests by per-session ids
//! - **Heartbeats**: an unanswered ping closes the session and frees its resources
//! - **Serialized Evaluation**: one evaluation in service per queue, FIFO behind it
//!
//! # Modules
//!
//! - [`coordinator`] - Broker actor owning sessions, registry and queues
//! - [`correlator`] - Request/reply correlation with timeouts
//! - [`channel`] - In-process bidirectional channels
//! - [`client`] - Context-side endpoint and model collaborator traits
//! - [`ipc`] - Unix socket transport and wire messages
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod error;
pub mod ipc;

// Re-export commonly used types
pub use channel::{BrokerEnd, ClientEnd};
pub use client::{BrokerClient, EchoEngine, InferenceEngine, ModelLoader, Registration, RegistrationStatus};
pub use config::Config;
pub use coordinator::{
    BrokerSnapshot, CoordRequest, Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorMetrics, QueueScope,
    RetryPolicy, Role, SessionId, SessionState,
};
pub use correlator::{CorrelationId, Correlator};
pub use error::BrokerError;
pub use ipc::{BrokerMessage, ClientMessage};

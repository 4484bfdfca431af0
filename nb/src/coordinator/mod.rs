//! Coordinator for broker state
//!
//! The Coordinator owns every client session and mediates all broker work:
//! - **Registration:** sessions declare a resource name and whether they can serve it
//! - **Election:** at most one serving session per resource name, with failover
//! - **Evaluation:** calls are queued FIFO and run one at a time on the elected server
//! - **Heartbeat:** silent sessions are closed and their work requeued

mod config;
mod core;
mod handle;
mod messages;
mod queue;
mod registry;
mod session;

pub use config::{CoordinatorConfig, QueueScope, RetryPolicy};
pub use core::Coordinator;
pub use handle::CoordinatorHandle;
pub use messages::{BrokerSnapshot, CoordRequest, CoordinatorMetrics};
pub use queue::{EvaluationQueue, EvaluationTask, QueueKey, TaskId};
pub use registry::{ResourceRegistry, Selection};
pub use session::{ClientSession, Role, SessionId, SessionInfo, SessionState};

//! Broker error types

use std::time::Duration;
use thiserror::Error;

use crate::coordinator::SessionId;

/// Errors surfaced by the broker and its endpoints
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("No reply within {0:?}")]
    RequestTimeout(Duration),

    #[error("No server available for resource {0}")]
    NoServerAvailable(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Session {0} is not draining its channel")]
    ChannelFull(SessionId),

    #[error("Unknown resource kind: {0}")]
    UnknownResourceKind(String),

    #[error("Session {0} has not registered")]
    NotRegistered(SessionId),

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Coordinator is not running")]
    CoordinatorClosed,
}

impl BrokerError {
    /// Check if this is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::RequestTimeout(_))
    }

    /// Check if an evaluation that failed with this error should be requeued
    ///
    /// Liveness failures of the serving session are retried against a newly
    /// elected server; failures reported by the model itself are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::RequestTimeout(_) => true,
            BrokerError::NoServerAvailable(_) => true,
            BrokerError::ChannelClosed => true,
            BrokerError::ChannelFull(_) => true,
            BrokerError::UnknownResourceKind(_) => false,
            BrokerError::NotRegistered(_) => false,
            BrokerError::UnknownSession(_) => false,
            BrokerError::EvaluationFailed(_) => false,
            BrokerError::CoordinatorClosed => false,
        }
    }
}

//! Wire messages exchanged between a context and the broker
//!
//! Each message is a JSON object tagged by `type`. On socket transports every
//! message is a single line of JSON followed by `\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlator::CorrelationId;

/// Resource kind assumed when `register` omits one
pub const DEFAULT_RESOURCE_KIND: &str = "feed-forward";

fn default_kind() -> String {
    DEFAULT_RESOURCE_KIND.to_string()
}

/// Messages from a context to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Declare which resource this context uses and whether it can run it
    Register {
        #[serde(rename = "resource-name")]
        resource_name: String,
        #[serde(default = "default_kind")]
        kind: String,
        #[serde(rename = "can-serve")]
        can_serve: bool,
    },

    /// Graceful departure
    Unregister,

    /// Reply to a broker ping
    Pong {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
    },

    /// Submit work for the registered resource
    Evaluate {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
        input: Value,
    },

    /// Result of work the broker forwarded to this context
    Evaluated {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
        output: Value,
    },

    /// Forwarded work could not be run
    EvaluateFailed {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
        message: String,
    },
}

/// Messages from the broker to a context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BrokerMessage {
    /// Registration accepted
    Registered {
        #[serde(rename = "session-id")]
        session_id: u64,
    },

    /// Registration refused; the session stays unregistered
    RegisterRejected { reason: String },

    /// Liveness check
    Ping {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
    },

    /// Work forwarded to the elected server
    Evaluate {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
        input: Value,
    },

    /// Result delivered to the consumer that asked for it
    Evaluated {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
        output: Value,
    },

    /// The consumer's request failed permanently
    EvaluateFailed {
        #[serde(rename = "correlation-id")]
        correlation_id: CorrelationId,
        message: String,
    },
}

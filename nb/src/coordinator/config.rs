//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How evaluation tasks are serialized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueScope {
    /// One in-service slot shared by every resource name
    Global,

    /// One in-service slot per resource name
    #[default]
    PerResource,
}

/// Backoff applied while no server is available for a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay between servicing attempts in milliseconds
    #[serde(rename = "interval-ms", default = "default_retry_interval_ms")]
    pub interval_ms: u64,

    /// Give up with `NoServerAvailable` after this many attempts (unbounded if unset)
    #[serde(rename = "max-attempts", default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Whether another attempt is allowed after `attempts` have failed
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Time a ping may go unanswered before the session is closed
    #[serde(rename = "heartbeat-timeout-ms", default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Pause between a successful ping and the next one
    #[serde(rename = "heartbeat-interval-ms", default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Retry policy for tasks waiting on a server
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Whether unrelated resources share the in-service slot
    #[serde(rename = "queue-scope", default)]
    pub queue_scope: QueueScope,

    /// Resource kinds a context may register
    #[serde(rename = "resource-kinds", default = "default_resource_kinds")]
    pub resource_kinds: Vec<String>,

    /// Channel buffer size for coordinator requests
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Channel buffer size per session
    #[serde(rename = "session-channel-buffer", default = "default_session_channel_buffer")]
    pub session_channel_buffer: usize,

    /// Max size of one line on socket transports (1MB default)
    #[serde(rename = "max-message-size", default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_heartbeat_timeout_ms() -> u64 {
    debug!("default_heartbeat_timeout_ms: called");
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    debug!("default_heartbeat_interval_ms: called");
    1000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_resource_kinds() -> Vec<String> {
    debug!("default_resource_kinds: called");
    vec!["feed-forward".to_string(), "convolutional".to_string()]
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_session_channel_buffer() -> usize {
    debug!("default_session_channel_buffer: called");
    100
}

fn default_max_message_size() -> usize {
    debug!("default_max_message_size: called");
    1024 * 1024 // 1MB
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            heartbeat_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            retry: RetryPolicy::default(),
            queue_scope: QueueScope::PerResource,
            resource_kinds: default_resource_kinds(),
            channel_buffer: 1000,
            session_channel_buffer: 100,
            max_message_size: 1024 * 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Check whether a registration's resource kind is known
    pub fn knows_kind(&self, kind: &str) -> bool {
        debug!(%kind, "CoordinatorConfig::knows_kind: called");
        self.resource_kinds.iter().any(|k| k == kind)
    }
}

//! Collaborator traits a serving context plugs in

use async_trait::async_trait;
use eyre::Result;
use serde_json::Value;

/// Executes a loaded model
///
/// Input and output are opaque to the broker.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Run the model on one input
    async fn run(&self, input: Value) -> Result<Value>;
}

/// Gates serving on the model being loaded
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Resolves once the model can run
    async fn ready(&self) -> Result<()>;
}

/// Engine that answers with its input, handy for wiring checks
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoEngine;

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn run(&self, input: Value) -> Result<Value> {
        Ok(input)
    }
}

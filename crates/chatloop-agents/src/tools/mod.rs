mod deadline;
mod dispatcher;
mod normalize;
mod rpc;
mod stream_protocol;

use async_trait::async_trait;
use chatloop_common::{FunctionCall, Result, ToolExecutionResult};
use tokio_util::sync::CancellationToken;

use crate::providers::ToolDefinition;

pub use deadline::IdleDeadline;
pub use dispatcher::{
    DEFAULT_IDLE_TIMEOUT, NAMESPACE_SEPARATOR, ToolBackend, ToolDispatcher, ToolRoute,
};
pub use normalize::normalize_chunk;
pub use rpc::{JsonRpcError, RemoteTool};
pub use stream_protocol::{ToolStreamFrame, interpret_frame};

/// Callback-side view of a streaming tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStreamEvent {
    /// Raw chunk text, before chunk normalization.
    Chunk(String),
    Complete,
    Error(String),
}

/// How a streaming tool call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStreamOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Anything that can run the tool calls of an assistant turn.
///
/// Tool-side failures are returned as data (`ToolExecutionResult::error`,
/// `ToolStreamOutcome::Failed`), never as `Err`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool catalog as exposed to the model.
    async fn definitions(&self) -> Result<Vec<ToolDefinition>>;

    /// Whether the named tool produces incremental output.
    async fn supports_streaming(&self, name: &str) -> bool;

    async fn execute_single(
        &self,
        call: &FunctionCall,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult;

    async fn execute_streaming(
        &self,
        call: &FunctionCall,
        cancel: &CancellationToken,
        on_event: &mut (dyn FnMut(ToolStreamEvent) + Send),
    ) -> ToolStreamOutcome;
}

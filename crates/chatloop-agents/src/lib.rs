pub mod driver;
pub mod events;
pub mod openai;
pub mod providers;
pub mod sse;
pub mod stream_handler;
pub mod summarizer;
pub mod tools;

pub use driver::{AbortHandle, ConversationDriver, DriverOutcome, RoundState};
pub use events::{ChunkKind, ConversationEvent, EventSender};
pub use openai::OpenAiProvider;
pub use providers::{
    LlmProvider, LlmRequest, LlmStream, StreamDelta, ToolCallDelta, ToolDefinition,
    normalize_tool_call_delta,
};
pub use stream_handler::{
    CompletionStatus, StreamChunk, StreamRequestHandler, merge_tool_call_delta,
};
pub use summarizer::{ToolResultSummarizer, summary_placeholder};
pub use tools::{
    IdleDeadline, ToolBackend, ToolDispatcher, ToolExecutor, ToolStreamEvent, ToolStreamOutcome,
};

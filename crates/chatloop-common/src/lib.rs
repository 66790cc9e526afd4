pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{
    ConversationMessage, FunctionCall, Role, ToolCallFragment, ToolExecutionResult,
    UNANSWERED_TOOL_CALL, close_unanswered_tool_calls,
};
pub use types::{MessageId, SessionId};

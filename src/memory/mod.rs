//! 记忆层：与引擎会话对齐的短期对话历史

pub mod conversation;

pub use conversation::{
    ContentPart, ConversationHistory, FunctionCall, ImageUrl, Message, MessageContent,
    ProcessedMessages, Role, ToolCall,
};

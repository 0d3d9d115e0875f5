//! 短期记忆：对话历史与增量对齐
//!
//! ConversationHistory 记录引擎会话已经处理过的消息前缀。每次收到完整消息列表时，
//! 与已跟踪的历史逐条比较：是延续则只返回新增部分，发生分叉则要求重置并全量重发。

use serde::{Deserialize, Serialize};

use crate::core::RelayError;
use crate::llm::CompletionResult;

/// 消息角色（与 OpenAI Chat API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 结构化内容片段：text 或 image_url
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            image_url: None,
        }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self {
            kind: "image_url".to_string(),
            text: None,
            image_url: Some(ImageUrl { url: url.into() }),
        }
    }
}

/// 消息内容：纯文本或结构化片段列表
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// 补全结果中请求的工具调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// 函数名与 JSON 字符串形式的参数
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn function(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: default_tool_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// 单条消息；加入历史后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// 附带图片（路径或 URI），仅本地多模态会话使用，不发往远程端点
    #[serde(default, skip_serializing)]
    pub images: Vec<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            images: Vec::new(),
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// 工具结果轮次，tool_call_id 对应触发它的工具调用
    pub fn tool(content: impl Into<MessageContent>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    /// 由补全结果生成 assistant 轮次（content + tool_calls），历史提交与工具循环共用
    pub fn assistant_turn(result: &CompletionResult) -> Self {
        Self {
            tool_calls: result.tool_calls.clone(),
            ..Self::assistant(result.content.clone())
        }
    }

    /// 将内容展开为纯文本：片段之间以换行连接；缺少 content 视为格式错误
    pub fn flatten_content(&self) -> Result<String, RelayError> {
        match &self.content {
            Some(MessageContent::Text(text)) => Ok(text.clone()),
            Some(MessageContent::Parts(parts)) => Ok(parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n")),
            None => Err(RelayError::MalformedInput(format!(
                "missing 'content' in {} message",
                self.role.as_str()
            ))),
        }
    }
}

/// 一次对齐的结果：需要发给引擎的消息，以及是否需要先回滚引擎缓存
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedMessages {
    pub new_messages: Vec<Message>,
    pub requires_reset: bool,
}

/// 引擎会话已处理的消息前缀；只能通过 update / reset 修改
#[derive(Clone, Debug, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对比完整历史与已跟踪历史：更短或任一位置不同即为分叉（全量重发 + 重置），否则只返回新增后缀
    pub fn process_new_messages(&self, full_history: &[Message]) -> ProcessedMessages {
        let divergent = full_history.len() < self.messages.len()
            || self
                .messages
                .iter()
                .zip(full_history)
                .any(|(tracked, incoming)| tracked != incoming);

        if divergent {
            tracing::debug!(
                tracked = self.messages.len(),
                incoming = full_history.len(),
                "conversation diverged, full resend required"
            );
            return ProcessedMessages {
                new_messages: full_history.to_vec(),
                requires_reset: true,
            };
        }

        ProcessedMessages {
            new_messages: full_history[self.messages.len()..].to_vec(),
            requires_reset: false,
        }
    }

    /// 追加本轮增量与引擎生成的 assistant 轮次
    pub fn update(&mut self, new_messages: Vec<Message>, assistant_response: Message) {
        self.messages.extend(new_messages);
        self.messages.push(assistant_response);
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

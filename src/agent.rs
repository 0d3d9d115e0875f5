//! 带工具的 Agent
//!
//! Agent 组合一个 LanguageModel 与一个 ToolRegistry：补全结果请求工具调用时，执行工具、
//! 把 assistant 轮次与工具结果追加到对话，再次补全，直到没有工具调用或达到递归上限。

use serde_json::Value;
use uuid::Uuid;

use crate::config::DispatchSection;
use crate::core::{LanguageModel, RelayError};
use crate::llm::{CompletionParams, CompletionResult, DispatchMode};
use crate::memory::Message;
use crate::tools::{parse_and_execute_tool, ToolOutcome, ToolParameter, ToolRegistry};

/// 默认工具递归上限
pub const DEFAULT_RECURSION_LIMIT: u32 = 3;

#[derive(Debug)]
pub struct Agent {
    model: LanguageModel,
    tools: ToolRegistry,
    mode: DispatchMode,
    recursion_limit: u32,
}

impl Agent {
    pub fn new(model: LanguageModel) -> Self {
        Self {
            model,
            tools: ToolRegistry::new(),
            mode: DispatchMode::Local,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    /// 使用 [dispatch] 段的调度模式与递归上限
    pub fn from_config(model: LanguageModel, dispatch: &DispatchSection) -> Self {
        Self::new(model)
            .with_mode(dispatch.mode)
            .with_recursion_limit(dispatch.tool_recursion_limit)
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn add_tool<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
        func: F,
    ) where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.tools.add(name, description, parameters, func);
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn model(&self) -> &LanguageModel {
        &self.model
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub async fn complete_with_tools(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<CompletionResult, RelayError> {
        self.complete_with_tools_from(messages, params, 0, self.recursion_limit)
            .await
    }

    /// 从已有递归计数继续工具循环；计数达到上限后只做最后一次带 schema 的补全
    pub async fn complete_with_tools_from(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        recursion_count: u32,
        recursion_limit: u32,
    ) -> Result<CompletionResult, RelayError> {
        if self.tools.is_empty() {
            return self.model.complete(messages, params, self.mode, None).await;
        }

        let schemas = self.tools.schemas();
        let params = CompletionParams {
            jinja: true,
            ..params.clone()
        };
        let mut conversation = messages.to_vec();
        let mut count = recursion_count;

        loop {
            let result = self
                .model
                .complete_with_schemas(&conversation, &params, &schemas, self.mode, None)
                .await?;

            if count >= recursion_limit {
                if !result.tool_calls.is_empty() {
                    tracing::info!(
                        recursion_count = count,
                        recursion_limit,
                        "tool recursion limit reached, returning without executing"
                    );
                }
                return Ok(result);
            }

            let outcome = parse_and_execute_tool(&result, &self.tools).await;
            match outcome {
                ToolOutcome::NotCalled => return Ok(result),
                ToolOutcome::Called {
                    name,
                    call_id,
                    output,
                    ..
                } => {
                    let call_id =
                        call_id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                    tracing::debug!(tool = %name, call_id = %call_id, recursion_count = count, "tool executed");
                    conversation.push(Message::assistant_turn(&stamp_call_id(result, &call_id)));
                    conversation.push(Message::tool(tool_output_text(&output), call_id));
                    count += 1;
                }
            }
        }
    }
}

/// 已执行的调用没有 id 时写入生成的 id，使 assistant 轮次与工具结果轮次配对
fn stamp_call_id(mut result: CompletionResult, call_id: &str) -> CompletionResult {
    if let Some(call) = result.tool_calls.first_mut() {
        if call.id.is_none() {
            call.id = Some(call_id.to_string());
        }
    }
    result
}

/// 工具输出写入对话的文本：字符串原样，其余序列化为 JSON
fn tool_output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::config::RemoteSection;
    use crate::core::{open_session, SessionHandle};
    use crate::llm::{ContextParams, Credential, InferenceEngine, MockEngine, RemoteClient};
    use crate::memory::{Role, ToolCall};

    async fn agent(engine: &Arc<MockEngine>) -> Agent {
        let params = ContextParams::new("m.gguf");
        let id = open_session(engine.as_ref(), &params, None).await.unwrap();
        let dyn_engine: Arc<dyn InferenceEngine> = engine.clone();
        let remote = RemoteClient::new(&RemoteSection::default(), Credential::new());
        let mut agent = Agent::new(LanguageModel::new(dyn_engine, SessionHandle { id, params }, remote));
        agent.add_tool(
            "double",
            "Doubles a number",
            vec![ToolParameter::new("x", "number", "Number to double").required()],
            |args| async move {
                let x = args[0]
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("x must be an integer"))?;
                Ok(json!(x * 2))
            },
        );
        agent
    }

    fn tool_call(id: &str, args: &str) -> CompletionResult {
        CompletionResult::from_text("").with_tool_calls(vec![ToolCall::function("double", args).with_id(id)])
    }

    #[tokio::test]
    async fn test_tool_call_is_executed_and_resubmitted() {
        let engine = Arc::new(MockEngine::new());
        let agent = agent(&engine).await;
        engine.push_completion(Ok(tool_call("call_1", r#"{"x":5}"#)));

        let result = agent
            .complete_with_tools(&[Message::user("double 5")], &CompletionParams::default())
            .await
            .unwrap();
        assert!(result.tool_calls.is_empty());

        let requests = engine.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].1.params.jinja);
        assert_eq!(requests[0].1.tools.len(), 1);

        // the assistant turn is already cached by the session, only the tool result goes out
        assert_eq!(requests[1].1.messages, vec![Message::tool("10", "call_1")]);

        let history = agent.model().history().await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_recursion_limit_stops_execution() {
        let engine = Arc::new(MockEngine::new());
        let agent = agent(&engine).await;
        for i in 0..5 {
            engine.push_completion(Ok(tool_call(&format!("call_{i}"), r#"{"x":1}"#)));
        }

        let result = agent
            .complete_with_tools(&[Message::user("loop")], &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(engine.requests().len(), 4);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(engine.requests()[3].1.params.jinja);
    }

    #[tokio::test]
    async fn test_count_at_limit_makes_one_final_completion() {
        let engine = Arc::new(MockEngine::new());
        let agent = agent(&engine).await;
        engine.push_completion(Ok(tool_call("call_1", r#"{"x":1}"#)));

        let result = agent
            .complete_with_tools_from(&[Message::user("hi")], &CompletionParams::default(), 3, 3)
            .await
            .unwrap();
        assert_eq!(engine.requests().len(), 1);
        assert_eq!(engine.requests()[0].1.tools.len(), 1);
        assert_eq!(result.tool_calls[0].function.name, "double");
    }

    #[tokio::test]
    async fn test_failed_tool_returns_result_unchanged() {
        let engine = Arc::new(MockEngine::new());
        let agent = agent(&engine).await;
        let scripted = tool_call("call_1", r#"{"x":"five"}"#);
        engine.push_completion(Ok(scripted.clone()));

        let result = agent
            .complete_with_tools(&[Message::user("double five")], &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(result, scripted);
        assert_eq!(engine.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_is_plain_completion() {
        let engine = Arc::new(MockEngine::new());
        let params = ContextParams::new("m.gguf");
        let id = open_session(engine.as_ref(), &params, None).await.unwrap();
        let dyn_engine: Arc<dyn InferenceEngine> = engine.clone();
        let remote = RemoteClient::new(&RemoteSection::default(), Credential::new());
        let agent = Agent::new(LanguageModel::new(dyn_engine, SessionHandle { id, params }, remote));

        let result = agent
            .complete_with_tools(&[Message::user("hi")], &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(result.content, "Echo: hi");
        let request = &engine.requests()[0].1;
        assert!(request.tools.is_empty());
        assert!(!request.params.jinja);
    }

    #[tokio::test]
    async fn test_generated_call_id_pairs_assistant_and_tool_turns() {
        let engine = Arc::new(MockEngine::new());
        let agent = agent(&engine).await;
        engine.push_completion(Ok(CompletionResult::from_text("")
            .with_tool_calls(vec![ToolCall::function("double", r#"{"x":4}"#)])));

        agent
            .complete_with_tools(&[Message::user("double 4")], &CompletionParams::default())
            .await
            .unwrap();

        let history = agent.model().history().await;
        assert_eq!(history.len(), 4);
        let call_id = history[1].tool_calls[0].id.clone().unwrap();
        assert!(call_id.starts_with("call_"));
        assert_eq!(history[2].role, Role::Tool);
        assert_eq!(history[2].tool_call_id.as_deref(), Some(call_id.as_str()));
    }

    #[test]
    fn test_tool_output_text() {
        assert_eq!(tool_output_text(&json!("plain")), "plain");
        assert_eq!(tool_output_text(&json!(10)), "10");
        assert_eq!(tool_output_text(&json!({"a": 1})), r#"{"a":1}"#);
    }
}

//! 工具执行器
//!
//! 从补全结果中取出工具调用，解析参数并执行注册表中的工具；
//! 解析或执行失败都视为「未调用工具」，只写审计日志，不向上传播。每次执行输出结构化审计日志（JSON）。

use std::time::Instant;

use serde_json::Value;

use crate::llm::CompletionResult;
use crate::tools::ToolRegistry;

/// 一次工具调用的结果
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    NotCalled,
    Called {
        name: String,
        call_id: Option<String>,
        input: Value,
        output: Value,
    },
}

impl ToolOutcome {
    pub fn was_called(&self) -> bool {
        matches!(self, Self::Called { .. })
    }
}

/// 解析并执行补全结果中的工具调用（只执行第一个）
pub async fn parse_and_execute_tool(result: &CompletionResult, tools: &ToolRegistry) -> ToolOutcome {
    let Some(call) = result.tool_calls.first() else {
        return ToolOutcome::NotCalled;
    };
    if result.tool_calls.len() > 1 {
        tracing::warn!(
            count = result.tool_calls.len(),
            "completion requested several tool calls, only the first is executed"
        );
    }

    let name = call.function.name.as_str();
    let start = Instant::now();
    let args_preview = args_preview(&call.function.arguments);

    let executed = match serde_json::from_str::<Value>(&call.function.arguments) {
        Ok(input) => tools
            .execute(name, input.clone())
            .await
            .map(|output| (input, output))
            .map_err(|e| e.to_string()),
        Err(e) => Err(format!("invalid tool arguments: {e}")),
    };

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (ok, outcome) = match &executed {
        Ok(_) => (true, "ok"),
        Err(_) => (false, "error"),
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": name,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");

    match executed {
        Ok((input, output)) => ToolOutcome::Called {
            name: name.to_string(),
            call_id: call.id.clone(),
            input,
            output,
        },
        Err(e) => {
            tracing::debug!(tool = name, error = %e, "tool call ignored");
            ToolOutcome::NotCalled
        }
    }
}

fn args_preview(args: &str) -> String {
    if args.len() > 200 {
        format!("{}...", args.chars().take(200).collect::<String>())
    } else {
        args.to_string()
    }
}

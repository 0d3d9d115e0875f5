//! 错误类型
//!
//! EngineError 来自推理引擎（会话丢失 / 普通失败），RelayError 汇总调度路径上的所有错误，
//! InitError 为初始化计划全部失败后的结构化结果。与 RecoveryEngine 配合决定是否重建会话。

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::llm::remote::RemoteError;
use crate::tools::ToolError;

/// 推理引擎返回的错误；Clone 以便同一个初始化结果分发给多个等待者
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// 引擎侧会话已失效（引擎重载、内存回收等），可通过重建会话恢复
    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("{0}")]
    Failed(String),

    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),
}

static SESSION_LOST_RE: OnceLock<Option<Regex>> = OnceLock::new();

impl EngineError {
    /// 只会以文本报告错误的引擎在边界处经此分类：匹配 "context/session not found" 的为 SessionLost
    pub fn from_native(message: impl Into<String>) -> Self {
        let message = message.into();
        let re = SESSION_LOST_RE
            .get_or_init(|| Regex::new(r"(?i)\b(context|session)\b.*\bnot found\b").ok());
        match re {
            Some(re) if re.is_match(&message) => Self::SessionLost(message),
            _ => Self::Failed(message),
        }
    }

    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }
}

/// 调度路径上的错误（本地引擎、远程端点、工具、输入格式）
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// 输入格式错误（缺少 content 等），立即抛出，不重试
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid mode: {0}. Must be \"local\", \"remote\", \"local-first\", or \"remote-first\"")]
    InvalidDispatchMode(String),
}

impl RelayError {
    /// 是否为引擎会话丢失（已经过一次自动重建仍失败时才会出现在调用方）
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_session_lost())
    }
}

/// 初始化计划中所有配置、所有重试均失败
#[derive(Error, Debug, Clone)]
#[error("Initialization failed after {attempts} attempts: {source}")]
pub struct InitError {
    pub attempts: u32,
    #[source]
    pub source: EngineError,
}

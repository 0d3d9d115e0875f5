//! lmrelay - 有状态推理会话的编排层
//!
//! 模块划分：
//! - **agent**: 带工具循环的 Agent（LanguageModel + ToolRegistry）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、恢复策略、会话监管、后端编排（LanguageModel）
//! - **llm**: 引擎契约与数据类型、模型加载、远程端点、调度模式、Mock 引擎
//! - **memory**: 与引擎会话对齐的对话历史
//! - **observability**: 日志初始化与初始化失败遥测
//! - **tools**: 工具注册表、schema 导出与执行

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use agent::Agent;
pub use crate::core::{EngineError, InitError, LanguageModel, RelayError};
pub use llm::{DispatchMode, InferenceEngine, ModelLoader, RetryConfig};

//! 推理引擎契约
//!
//! 引擎本身（模型加载、Token 生成、多模态编码）是外部协作方，只通过会话 ID 寻址访问。
//! 所有调用可能以 EngineError 失败，其中 SessionLost 表示会话已被引擎侧回收。

use async_trait::async_trait;

use crate::core::EngineError;
use crate::llm::types::{
    CompletionRequest, CompletionResult, ContextParams, EmbeddingParams, EmbeddingResult,
    ProgressCallback, SessionId, TokenCallback, TokenizeResult,
};

/// 有状态推理引擎：每个会话持有一份可增量复用的 KV 缓存
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// 加载模型并创建会话
    async fn init_context(
        &self,
        params: &ContextParams,
        on_progress: Option<ProgressCallback>,
    ) -> Result<SessionId, EngineError>;

    /// 为会话加载多模态投影模型
    async fn init_multimodal(&self, _session: SessionId, _mmproj: &str) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("multimodal"))
    }

    /// 补全；on_token 为流式回调
    async fn completion(
        &self,
        session: SessionId,
        request: &CompletionRequest,
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, EngineError>;

    async fn embedding(
        &self,
        session: SessionId,
        text: &str,
        params: &EmbeddingParams,
    ) -> Result<EmbeddingResult, EngineError>;

    async fn tokenize(&self, session: SessionId, text: &str) -> Result<TokenizeResult, EngineError>;

    /// 丢弃会话已缓存的对话状态
    async fn rewind(&self, session: SessionId) -> Result<(), EngineError>;

    /// 通知正在进行的生成停止
    async fn stop_completion(&self, session: SessionId) -> Result<(), EngineError>;

    async fn release(&self, session: SessionId) -> Result<(), EngineError>;
}

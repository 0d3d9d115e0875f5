//! 会话监管：引擎会话句柄的生命周期与透明恢复
//!
//! 每个逻辑客户端持有一个引擎会话。引擎可能在客户端不知情时回收会话（重载、内存压力），
//! run 对每个引擎操作做一次性恢复：会话丢失时用最近配置重建会话、清空已跟踪历史，再重试一次。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{EngineError, RecoveryAction, RecoveryEngine};
use crate::llm::{ContextParams, InferenceEngine, ProgressCallback, SessionId};
use crate::memory::ConversationHistory;

/// 会话句柄：引擎会话 ID 与创建它的配置
#[derive(Clone, Debug, PartialEq)]
pub struct SessionHandle {
    pub id: SessionId,
    pub params: ContextParams,
}

/// 操作是首次执行还是重建会话后的重试（新会话没有任何缓存轮次）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    AfterReinit,
}

/// 打开会话：加载模型，配置了 mmproj 时再初始化多模态；多模态失败则释放刚建的会话
pub async fn open_session(
    engine: &dyn InferenceEngine,
    params: &ContextParams,
    on_progress: Option<ProgressCallback>,
) -> Result<SessionId, EngineError> {
    let id = engine.init_context(params, on_progress).await?;
    if let Some(mmproj) = params.mmproj.as_deref() {
        if let Err(e) = engine.init_multimodal(id, mmproj).await {
            if let Err(release_err) = engine.release(id).await {
                tracing::debug!(session = %id, error = %release_err, "release after multimodal failure");
            }
            return Err(e);
        }
    }
    Ok(id)
}

/// 停止信号：不经过会话锁即可通知当前会话停止生成
#[derive(Clone)]
pub struct StopHandle {
    engine: Arc<dyn InferenceEngine>,
    current: Arc<AtomicU64>,
}

impl StopHandle {
    /// 会话已不存在时视为没有正在进行的生成
    pub async fn stop(&self) -> Result<(), EngineError> {
        let id = SessionId(self.current.load(Ordering::Acquire));
        match self.engine.stop_completion(id).await {
            Err(e) if e.is_session_lost() => {
                tracing::debug!(session = %id, "stop requested on a lost session");
                Ok(())
            }
            other => other,
        }
    }
}

/// 会话监管者：持有引擎、当前句柄与恢复策略
pub struct SessionSupervisor {
    engine: Arc<dyn InferenceEngine>,
    handle: SessionHandle,
    recovery: RecoveryEngine,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("handle", &self.handle)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl SessionSupervisor {
    pub fn new(engine: Arc<dyn InferenceEngine>, handle: SessionHandle) -> Self {
        let current = Arc::new(AtomicU64::new(handle.id.0));
        Self {
            engine,
            handle,
            recovery: RecoveryEngine::new(),
            current,
            generation: 0,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn session_id(&self) -> SessionId {
        self.handle.id
    }

    /// 重建次数
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            engine: Arc::clone(&self.engine),
            current: Arc::clone(&self.current),
        }
    }

    /// 执行引擎操作；会话丢失时重建并重试一次，其他错误或第二次失败原样返回
    pub async fn run<T, F, Fut>(
        &mut self,
        history: &mut ConversationHistory,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: Fn(Arc<dyn InferenceEngine>, SessionId, Attempt) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let err = match op(Arc::clone(&self.engine), self.handle.id, Attempt::First).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        match self.recovery.handle(&err) {
            RecoveryAction::Propagate => Err(err),
            RecoveryAction::Reinitialize => {
                self.reinitialize(history, &err).await?;
                op(Arc::clone(&self.engine), self.handle.id, Attempt::AfterReinit).await
            }
        }
    }

    async fn reinitialize(
        &mut self,
        history: &mut ConversationHistory,
        cause: &EngineError,
    ) -> Result<(), EngineError> {
        tracing::info!(
            session = %self.handle.id,
            model = %self.handle.params.model,
            cause = %cause,
            "engine session lost, reinitializing"
        );
        let id = open_session(self.engine.as_ref(), &self.handle.params, None).await?;
        self.handle.id = id;
        self.current.store(id.0, Ordering::Release);
        self.generation += 1;
        history.reset();
        Ok(())
    }

    /// 释放会话；会话已失效视为已释放
    pub async fn release(&self) -> Result<(), EngineError> {
        match self.engine.release(self.handle.id).await {
            Err(e) if e.is_session_lost() => {
                tracing::debug!(session = %self.handle.id, "session already gone, release is a no-op");
                Ok(())
            }
            other => other,
        }
    }
}

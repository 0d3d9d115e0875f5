//! Mock 推理引擎（用于测试，无需加载模型）
//!
//! 默认回显最后一条 User 消息；可预置补全结果、让初始化失败、模拟会话被引擎回收，并记录所有调用。

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::EngineError;
use crate::llm::types::{
    CompletionRequest, CompletionResult, ContextParams, EmbeddingParams, EmbeddingResult,
    ProgressCallback, SessionId, TokenCallback, TokenizeResult,
};
use crate::llm::InferenceEngine;
use crate::memory::Role;

#[derive(Default)]
struct MockState {
    next_id: u64,
    live: HashSet<u64>,
    init_calls: Vec<ContextParams>,
    multimodal_calls: Vec<(SessionId, String)>,
    fail_next_inits: usize,
    fail_gpu_inits: bool,
    init_delay: Option<Duration>,
    completions: VecDeque<Result<CompletionResult, EngineError>>,
    requests: Vec<(SessionId, CompletionRequest)>,
    embedding_error: Option<EngineError>,
    rewinds: usize,
    stops: usize,
    releases: usize,
}

/// 可编排的内存引擎
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 接下来 n 次初始化失败
    pub fn fail_next_inits(&self, n: usize) {
        self.state().fail_next_inits = n;
    }

    /// 凡是请求 GPU 层（n_gpu_layers 非 0）的初始化都失败，模拟无加速器设备
    pub fn fail_gpu_inits(&self, fail: bool) {
        self.state().fail_gpu_inits = fail;
    }

    /// 初始化耗时，便于制造并发窗口
    pub fn set_init_delay(&self, delay: Duration) {
        self.state().init_delay = Some(delay);
    }

    /// 预置下一次补全的返回
    pub fn push_completion(&self, result: Result<CompletionResult, EngineError>) {
        self.state().completions.push_back(result);
    }

    pub fn set_embedding_error(&self, error: Option<EngineError>) {
        self.state().embedding_error = error;
    }

    /// 使所有现存会话失效（模拟引擎重载 / 内存回收）
    pub fn invalidate_sessions(&self) {
        self.state().live.clear();
    }

    pub fn init_calls(&self) -> Vec<ContextParams> {
        self.state().init_calls.clone()
    }

    pub fn multimodal_calls(&self) -> Vec<(SessionId, String)> {
        self.state().multimodal_calls.clone()
    }

    pub fn requests(&self) -> Vec<(SessionId, CompletionRequest)> {
        self.state().requests.clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.state().live.len()
    }

    pub fn rewinds(&self) -> usize {
        self.state().rewinds
    }

    pub fn stops(&self) -> usize {
        self.state().stops
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }

    fn check_live(&self, session: SessionId) -> Result<(), EngineError> {
        if self.state().live.contains(&session.0) {
            Ok(())
        } else {
            Err(EngineError::from_native(format!("Context not found: {session}")))
        }
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn init_context(
        &self,
        params: &ContextParams,
        on_progress: Option<ProgressCallback>,
    ) -> Result<SessionId, EngineError> {
        let delay = {
            let mut state = self.state();
            state.init_calls.push(params.clone());
            state.init_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_next_inits > 0 {
            state.fail_next_inits -= 1;
            return Err(EngineError::Failed("Failed to load model".to_string()));
        }
        if state.fail_gpu_inits && params.n_gpu_layers != Some(0) {
            return Err(EngineError::Failed("GPU offload unavailable".to_string()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.live.insert(id);
        drop(state);

        if let Some(cb) = on_progress {
            cb(100);
        }
        Ok(SessionId(id))
    }

    async fn init_multimodal(&self, session: SessionId, mmproj: &str) -> Result<(), EngineError> {
        self.check_live(session)?;
        self.state()
            .multimodal_calls
            .push((session, mmproj.to_string()));
        Ok(())
    }

    async fn completion(
        &self,
        session: SessionId,
        request: &CompletionRequest,
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, EngineError> {
        self.check_live(session)?;
        let scripted = {
            let mut state = self.state();
            state.requests.push((session, request.clone()));
            state.completions.pop_front()
        };

        let result = match scripted {
            Some(result) => result?,
            None => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .and_then(|m| m.flatten_content().ok())
                    .unwrap_or_else(|| "(no input)".to_string());
                CompletionResult::from_text(format!("Echo: {last_user}"))
            }
        };

        if let Some(cb) = on_token {
            for token in result.content.split_inclusive(' ') {
                cb(token);
            }
        }
        Ok(result)
    }

    async fn embedding(
        &self,
        session: SessionId,
        text: &str,
        _params: &EmbeddingParams,
    ) -> Result<EmbeddingResult, EngineError> {
        self.check_live(session)?;
        if let Some(err) = self.state().embedding_error.clone() {
            return Err(err);
        }
        #[allow(clippy::cast_precision_loss)]
        let len = text.len() as f32;
        Ok(EmbeddingResult {
            embedding: vec![len, 1.0, 0.0],
        })
    }

    async fn tokenize(&self, session: SessionId, text: &str) -> Result<TokenizeResult, EngineError> {
        self.check_live(session)?;
        let tokens = text
            .split_whitespace()
            .enumerate()
            .map(|(i, _)| i32::try_from(i).unwrap_or(i32::MAX))
            .collect();
        Ok(TokenizeResult { tokens })
    }

    async fn rewind(&self, session: SessionId) -> Result<(), EngineError> {
        self.check_live(session)?;
        self.state().rewinds += 1;
        Ok(())
    }

    async fn stop_completion(&self, session: SessionId) -> Result<(), EngineError> {
        self.check_live(session)?;
        self.state().stops += 1;
        Ok(())
    }

    async fn release(&self, session: SessionId) -> Result<(), EngineError> {
        self.check_live(session)?;
        let mut state = self.state();
        state.live.remove(&session.0);
        state.releases += 1;
        Ok(())
    }
}

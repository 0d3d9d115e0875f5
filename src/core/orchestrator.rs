//! 后端编排：LanguageModel 句柄
//!
//! 本地路径先经对话对齐只发送增量（分叉时先回滚会话再全量重发），所有引擎调用经 SessionSupervisor
//! 获得会话丢失后的透明恢复；远程路径把整段对话交给远程端点。调度模式决定先走哪个后端以及是否回退一次。
//! 句柄可克隆，克隆共享同一个会话与同一份已跟踪历史。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::session_supervisor::{Attempt, SessionHandle, SessionSupervisor, StopHandle};
use crate::core::RelayError;
use crate::llm::remote::{ImageAttachment, RemoteClient};
use crate::llm::router::{with_fallback, Backend, DispatchMode};
use crate::llm::{
    CompletionParams, CompletionRequest, CompletionResult, ContextParams, EmbeddingParams,
    EmbeddingResult, InferenceEngine, SessionId, TokenCallback, TokenizeResult,
};
use crate::memory::{ConversationHistory, Message};
use crate::tools::ToolSchema;

struct ModelState {
    supervisor: SessionSupervisor,
    history: ConversationHistory,
}

/// 已初始化模型的句柄
#[derive(Clone)]
pub struct LanguageModel {
    state: Arc<Mutex<ModelState>>,
    stop: StopHandle,
    remote: RemoteClient,
}

impl std::fmt::Debug for LanguageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModel")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl LanguageModel {
    pub fn new(engine: Arc<dyn InferenceEngine>, handle: SessionHandle, remote: RemoteClient) -> Self {
        let supervisor = SessionSupervisor::new(engine, handle);
        let stop = supervisor.stop_handle();
        Self {
            state: Arc::new(Mutex::new(ModelState {
                supervisor,
                history: ConversationHistory::new(),
            })),
            stop,
            remote,
        }
    }

    pub async fn session_id(&self) -> SessionId {
        self.state.lock().await.supervisor.session_id()
    }

    /// 当前会话使用的配置（降级后为 CPU-only 配置）
    pub async fn params(&self) -> ContextParams {
        self.state.lock().await.supervisor.handle().params.clone()
    }

    /// 会话已处理的消息
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.history.messages().to_vec()
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    pub async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        mode: DispatchMode,
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, RelayError> {
        self.complete_with_schemas(messages, params, &[], mode, on_token)
            .await
    }

    /// 携带工具 schema 的补全；远程端点不接收 schema
    pub async fn complete_with_schemas(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        tools: &[ToolSchema],
        mode: DispatchMode,
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, RelayError> {
        for message in messages {
            message.flatten_content()?;
        }

        let (primary, fallback) = mode.plan();
        let first = self
            .complete_on(primary, messages, params, tools, on_token.clone())
            .await;
        let fallback = fallback.map(|backend| {
            (backend, move || {
                self.complete_on(backend, messages, params, tools, on_token)
            })
        });
        with_fallback(primary, first, fallback).await
    }

    async fn complete_on(
        &self,
        backend: Backend,
        messages: &[Message],
        params: &CompletionParams,
        tools: &[ToolSchema],
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, RelayError> {
        match backend {
            Backend::Local => self.complete_local(messages, params, tools, on_token).await,
            Backend::Remote => self.complete_remote(messages, params, on_token).await,
        }
    }

    async fn complete_local(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        tools: &[ToolSchema],
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, RelayError> {
        let mut guard = self.state.lock().await;
        let ModelState {
            supervisor,
            history,
        } = &mut *guard;

        let processed = history.process_new_messages(messages);
        if processed.requires_reset {
            supervisor
                .run(history, |engine, id, _| async move { engine.rewind(id).await })
                .await?;
            history.reset();
        }
        let delta = processed.new_messages;
        if delta.is_empty() {
            tracing::warn!("no new messages since the last completion");
        }

        let generation = supervisor.generation();
        let result = supervisor
            .run(history, |engine, id, attempt| {
                let outgoing = match attempt {
                    Attempt::First => delta.clone(),
                    Attempt::AfterReinit => messages.to_vec(),
                };
                let request = CompletionRequest {
                    messages: outgoing,
                    params: params.clone(),
                    tools: tools.to_vec(),
                };
                let on_token = on_token.clone();
                async move { engine.completion(id, &request, on_token).await }
            })
            .await?;

        let committed = if supervisor.generation() == generation {
            delta
        } else {
            messages.to_vec()
        };
        history.update(committed, Message::assistant_turn(&result));
        tracing::debug!(
            session = %supervisor.session_id(),
            tracked = history.len(),
            tokens_predicted = result.tokens_predicted,
            "local completion"
        );
        Ok(result)
    }

    async fn complete_remote(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, RelayError> {
        if params.images.len() > 1 {
            tracing::warn!(
                images = params.images.len(),
                "remote completion attaches only the first image"
            );
        }
        let image = params
            .images
            .first()
            .map(|path| ImageAttachment::Path(PathBuf::from(path)));
        Ok(self
            .remote
            .complete(messages, image.as_ref(), on_token)
            .await?)
    }

    pub async fn embed(
        &self,
        text: &str,
        params: &EmbeddingParams,
        mode: DispatchMode,
    ) -> Result<EmbeddingResult, RelayError> {
        let (primary, fallback) = mode.plan();
        let first = self.embed_on(primary, text, params).await;
        let fallback =
            fallback.map(|backend| (backend, move || self.embed_on(backend, text, params)));
        with_fallback(primary, first, fallback).await
    }

    async fn embed_on(
        &self,
        backend: Backend,
        text: &str,
        params: &EmbeddingParams,
    ) -> Result<EmbeddingResult, RelayError> {
        match backend {
            Backend::Local => {
                let mut guard = self.state.lock().await;
                let ModelState {
                    supervisor,
                    history,
                } = &mut *guard;
                let result = supervisor
                    .run(history, |engine, id, _| {
                        let text = text.to_string();
                        let params = params.clone();
                        async move { engine.embedding(id, &text, &params).await }
                    })
                    .await?;
                Ok(result)
            }
            Backend::Remote => Ok(self.remote.embed(text).await?),
        }
    }

    pub async fn tokenize(&self, text: &str) -> Result<TokenizeResult, RelayError> {
        let mut guard = self.state.lock().await;
        let ModelState {
            supervisor,
            history,
        } = &mut *guard;
        let tokens = supervisor
            .run(history, |engine, id, _| {
                let text = text.to_string();
                async move { engine.tokenize(id, &text).await }
            })
            .await?;
        Ok(tokens)
    }

    /// 清空引擎缓存与已跟踪历史
    pub async fn rewind(&self) -> Result<(), RelayError> {
        let mut guard = self.state.lock().await;
        let ModelState {
            supervisor,
            history,
        } = &mut *guard;
        supervisor
            .run(history, |engine, id, _| async move { engine.rewind(id).await })
            .await?;
        history.reset();
        Ok(())
    }

    /// 通知正在进行的生成停止；不等待会话锁
    pub async fn stop_completion(&self) -> Result<(), RelayError> {
        self.stop.stop().await.map_err(RelayError::from)
    }

    /// 释放会话；重复释放或会话已失效均视为成功
    pub async fn release(&self) -> Result<(), RelayError> {
        let mut guard = self.state.lock().await;
        guard.supervisor.release().await?;
        guard.history.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteSection;
    use crate::core::session_supervisor::open_session;
    use crate::core::EngineError;
    use crate::llm::remote::{Credential, RemoteError};
    use crate::llm::MockEngine;
    use crate::memory::MessageContent;

    async fn model(engine: &Arc<MockEngine>) -> LanguageModel {
        let params = ContextParams::new("m.gguf");
        let id = open_session(engine.as_ref(), &params, None).await.unwrap();
        let dyn_engine: Arc<dyn InferenceEngine> = engine.clone();
        let remote = RemoteClient::new(&RemoteSection::default(), Credential::new());
        LanguageModel::new(dyn_engine, SessionHandle { id, params }, remote)
    }

    async fn local(model: &LanguageModel, messages: &[Message]) -> Result<CompletionResult, RelayError> {
        model
            .complete(messages, &CompletionParams::default(), DispatchMode::Local, None)
            .await
    }

    #[tokio::test]
    async fn test_sends_only_new_messages() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;

        let mut conversation = vec![Message::user("Hello")];
        let first = local(&model, &conversation).await.unwrap();
        assert_eq!(first.content, "Echo: Hello");

        conversation.push(Message::assistant_turn(&first));
        conversation.push(Message::user("How are you?"));
        local(&model, &conversation).await.unwrap();

        let requests = engine.requests();
        assert_eq!(requests[0].1.messages, vec![Message::user("Hello")]);
        assert_eq!(requests[1].1.messages, vec![Message::user("How are you?")]);
        assert_eq!(engine.rewinds(), 0);
        assert_eq!(model.history().await.len(), 4);
    }

    #[tokio::test]
    async fn test_divergence_rewinds_and_resends() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;

        let first = local(&model, &[Message::user("Hello")]).await.unwrap();
        let edited = vec![
            Message::user("Hello"),
            Message::assistant("something else"),
            Message::user("next"),
        ];
        assert_ne!(edited[1], Message::assistant_turn(&first));
        local(&model, &edited).await.unwrap();

        assert_eq!(engine.rewinds(), 1);
        assert_eq!(engine.requests()[1].1.messages, edited);
        assert_eq!(model.history().await.len(), 4);
    }

    #[tokio::test]
    async fn test_session_loss_resends_full_conversation() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let before = model.session_id().await;

        let first = local(&model, &[Message::user("Hello")]).await.unwrap();
        let conversation = vec![
            Message::user("Hello"),
            Message::assistant_turn(&first),
            Message::user("again"),
        ];
        engine.invalidate_sessions();
        let result = local(&model, &conversation).await.unwrap();
        assert_eq!(result.content, "Echo: again");

        let requests = engine.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1.messages, conversation);
        assert_ne!(model.session_id().await, before);
        assert_eq!(model.history().await.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_content_is_rejected_before_engine_call() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let mut broken = Message::user("x");
        broken.content = None;

        let err = model
            .complete(&[broken], &CompletionParams::default(), DispatchMode::LocalFirst, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedInput(_)));
        assert!(engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_parts_content_is_accepted() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let message = Message::user(MessageContent::Parts(vec![
            crate::memory::ContentPart::text("look"),
            crate::memory::ContentPart::text("here"),
        ]));
        let result = local(&model, &[message]).await.unwrap();
        assert_eq!(result.content, "Echo: look\nhere");
    }

    #[tokio::test]
    async fn test_local_first_without_token_surfaces_local_error() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        engine.push_completion(Err(EngineError::Failed("decode failed".into())));

        let err = model
            .complete(
                &[Message::user("hi")],
                &CompletionParams::default(),
                DispatchMode::LocalFirst,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Engine error: decode failed");
    }

    #[tokio::test]
    async fn test_remote_first_falls_back_to_local() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let result = model
            .complete(
                &[Message::user("hi")],
                &CompletionParams::default(),
                DispatchMode::RemoteFirst,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.content, "Echo: hi");
    }

    #[tokio::test]
    async fn test_remote_only_requires_token() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let err = model
            .complete(&[Message::user("hi")], &CompletionParams::default(), DispatchMode::Remote, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Remote(RemoteError::NotConfigured)));
        assert!(engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_callback_receives_tokens() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let collected = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&collected);
        let on_token: TokenCallback = Arc::new(move |t| sink.lock().unwrap().push_str(t));

        model
            .complete(
                &[Message::user("stream me")],
                &CompletionParams::default(),
                DispatchMode::Local,
                Some(on_token),
            )
            .await
            .unwrap();
        assert_eq!(*collected.lock().unwrap(), "Echo: stream me");
    }

    #[tokio::test]
    async fn test_embed_local_and_remote_fallback() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let params = EmbeddingParams::default();

        let local = model.embed("abcd", &params, DispatchMode::Local).await.unwrap();
        assert_eq!(local.embedding[0], 4.0);

        let rescued = model
            .embed("abc", &params, DispatchMode::RemoteFirst)
            .await
            .unwrap();
        assert_eq!(rescued.embedding[0], 3.0);

        engine.set_embedding_error(Some(EngineError::Failed("no embeddings".into())));
        let err = model
            .embed("abc", &params, DispatchMode::LocalFirst)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Engine error: no embeddings");
    }

    #[tokio::test]
    async fn test_rewind_clears_history() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        local(&model, &[Message::user("Hello")]).await.unwrap();
        model.rewind().await.unwrap();
        assert!(model.history().await.is_empty());
        assert_eq!(engine.rewinds(), 1);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_lock() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        let _held = model.state.lock().await;
        model.stop_completion().await.unwrap();
        assert_eq!(engine.stops(), 1);
    }

    #[tokio::test]
    async fn test_release_twice() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        model.release().await.unwrap();
        model.release().await.unwrap();
        assert_eq!(engine.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_tokenize_recovers_lost_session() {
        let engine = Arc::new(MockEngine::new());
        let model = model(&engine).await;
        engine.invalidate_sessions();
        let tokens = model.tokenize("one two").await.unwrap();
        assert_eq!(tokens.tokens, vec![0, 1]);
        assert_eq!(engine.init_calls().len(), 2);
    }
}

//! 模型加载：分阶段降级 + 指数退避重试 + 并发去重（single-flight）
//!
//! 计划依次尝试请求的配置与关闭加速器卸载的配置，每个配置最多 max_retries 次，
//! 两次尝试之间等待 delay_ms * 2^(attempt-1)。相同指纹（配置、凭证、重试策略）的并发请求
//! 只跑一遍计划，所有等待者拿到同一个结果；结果落定后立即注销，不缓存给之后的请求。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

use crate::config::RemoteSection;
use crate::core::session_supervisor::{open_session, SessionHandle};
use crate::core::{EngineError, InitError, LanguageModel};
use crate::llm::remote::{Credential, RemoteClient};
use crate::llm::types::{ContextParams, ProgressCallback};
use crate::llm::InferenceEngine;
use crate::observability::{InitFailureContext, Telemetry, TracingTelemetry};

/// 初始化重试策略
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 每个配置的最大尝试次数
    pub max_retries: u32,
    /// 退避基数（毫秒）
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次（从 1 开始）失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }
}

/// 有序的配置变体：请求的配置在前，关闭加速器卸载的降级配置在后
#[derive(Clone, Debug, PartialEq)]
pub struct InitAttemptPlan {
    variants: Vec<ContextParams>,
}

impl InitAttemptPlan {
    pub fn for_params(params: &ContextParams) -> Self {
        let mut variants = vec![params.clone()];
        let degraded = params.cpu_only();
        if degraded != *params {
            variants.push(degraded);
        }
        Self { variants }
    }

    pub fn variants(&self) -> &[ContextParams] {
        &self.variants
    }
}

type InitOutcome = Result<LanguageModel, InitError>;
type PendingInit = Shared<BoxFuture<'static, InitOutcome>>;

/// 正在进行的初始化，按指纹索引
#[derive(Clone, Default)]
struct PendingInitRegistry {
    inner: Arc<Mutex<HashMap<u64, PendingInit>>>,
}

impl PendingInitRegistry {
    fn remove(&self, key: u64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// 任务结束（含 panic）时注销对应条目
struct Deregister {
    registry: PendingInitRegistry,
    key: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}

fn fingerprint(params: &ContextParams, credentials: Option<&str>, retry: &RetryConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    match serde_json::to_string(params) {
        Ok(encoded) => encoded.hash(&mut hasher),
        Err(_) => format!("{params:?}").hash(&mut hasher),
    }
    credentials.hash(&mut hasher);
    retry.hash(&mut hasher);
    hasher.finish()
}

/// 模型加载器：持有引擎、遥测、远程客户端与进行中的初始化表
#[derive(Clone)]
pub struct ModelLoader {
    engine: Arc<dyn InferenceEngine>,
    telemetry: Arc<dyn Telemetry>,
    remote: RemoteClient,
    pending: PendingInitRegistry,
}

impl std::fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoader")
            .field("remote", &self.remote)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ModelLoader {
    pub fn new(engine: Arc<dyn InferenceEngine>, remote: &RemoteSection) -> Self {
        Self::with_credential(engine, remote, Credential::new())
    }

    /// 与其他组件共享同一份凭证
    pub fn with_credential(
        engine: Arc<dyn InferenceEngine>,
        remote: &RemoteSection,
        credential: Credential,
    ) -> Self {
        Self {
            engine,
            telemetry: Arc::new(TracingTelemetry),
            remote: RemoteClient::new(remote, credential),
            pending: PendingInitRegistry::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn credential(&self) -> &Credential {
        self.remote.credential()
    }

    /// 进行中的初始化数量
    pub fn pending_inits(&self) -> usize {
        self.pending.len()
    }

    /// 初始化模型；相同指纹的并发调用共享一次计划执行与同一个句柄
    pub async fn init(
        &self,
        params: ContextParams,
        on_progress: Option<ProgressCallback>,
        credentials: Option<String>,
        retry: Option<RetryConfig>,
    ) -> Result<LanguageModel, InitError> {
        if let Some(token) = credentials.as_deref().filter(|t| !t.is_empty()) {
            self.remote.credential().set(token);
        }
        let retry = retry.unwrap_or_default();
        let key = fingerprint(&params, credentials.as_deref(), &retry);

        let pending = {
            let mut registry = self
                .pending
                .inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match registry.get(&key).cloned() {
                Some(existing) => {
                    tracing::debug!(model = %params.model, "joining in-flight initialization");
                    existing
                }
                None => {
                    let shared = self.spawn_plan(key, params, on_progress, retry);
                    registry.insert(key, shared.clone());
                    shared
                }
            }
        };
        pending.await
    }

    fn spawn_plan(
        &self,
        key: u64,
        params: ContextParams,
        on_progress: Option<ProgressCallback>,
        retry: RetryConfig,
    ) -> PendingInit {
        let loader = self.clone();
        let guard = Deregister {
            registry: self.pending.clone(),
            key,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            loader.run_plan(&params, on_progress, &retry).await
        });
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(InitError {
                    attempts: 0,
                    source: EngineError::Failed(format!("initialization task aborted: {e}")),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn run_plan(
        &self,
        params: &ContextParams,
        on_progress: Option<ProgressCallback>,
        retry: &RetryConfig,
    ) -> InitOutcome {
        let plan = InitAttemptPlan::for_params(params);
        let per_variant = retry.max_retries;
        let mut attempts = 0u32;
        let mut last_error = None;

        for variant in plan.variants() {
            for attempt in 1..=per_variant {
                attempts += 1;
                match open_session(self.engine.as_ref(), variant, on_progress.clone()).await {
                    Ok(id) => {
                        tracing::info!(
                            session = %id,
                            model = %variant.model,
                            n_gpu_layers = ?variant.n_gpu_layers,
                            attempts,
                            "model initialized"
                        );
                        let handle = SessionHandle {
                            id,
                            params: variant.clone(),
                        };
                        return Ok(LanguageModel::new(
                            Arc::clone(&self.engine),
                            handle,
                            self.remote.clone(),
                        ));
                    }
                    Err(e) => {
                        let context = InitFailureContext {
                            n_gpu_layers: variant.n_gpu_layers,
                            n_ctx: variant.n_ctx,
                            model: variant.model.clone(),
                            attempt,
                        };
                        self.telemetry.init_failure(&e, &context);
                        last_error = Some(e);
                        if attempt < per_variant {
                            tokio::time::sleep(retry.delay_for(attempt)).await;
                        }
                    }
                }
            }
            tracing::warn!(
                model = %variant.model,
                n_gpu_layers = ?variant.n_gpu_layers,
                "configuration exhausted its retries"
            );
        }

        tracing::error!(model = %params.model, attempts, "every initialization attempt failed");
        Err(InitError {
            attempts,
            source: last_error
                .unwrap_or_else(|| EngineError::Failed("Failed to initialize after all retries".to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEngine;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingTelemetry {
        failures: Mutex<Vec<InitFailureContext>>,
    }

    impl Telemetry for RecordingTelemetry {
        fn init_failure(&self, _error: &EngineError, context: &InitFailureContext) {
            self.failures.lock().unwrap().push(context.clone());
        }
    }

    fn loader(engine: &Arc<MockEngine>) -> ModelLoader {
        let dyn_engine: Arc<dyn InferenceEngine> = engine.clone();
        ModelLoader::new(dyn_engine, &RemoteSection::default())
    }

    #[test]
    fn test_delay_doubles() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(2), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_plan_order() {
        let params = ContextParams::new("m.gguf").with_gpu_layers(99);
        let plan = InitAttemptPlan::for_params(&params);
        assert_eq!(plan.variants().len(), 2);
        assert_eq!(plan.variants()[0].n_gpu_layers, Some(99));
        assert_eq!(plan.variants()[1].n_gpu_layers, Some(0));

        let cpu = InitAttemptPlan::for_params(&params.cpu_only());
        assert_eq!(cpu.variants().len(), 1);
    }

    #[test]
    fn test_fingerprint_covers_credentials_and_retry() {
        let params = ContextParams::new("m.gguf");
        let base = fingerprint(&params, None, &RetryConfig::default());
        assert_eq!(base, fingerprint(&params, None, &RetryConfig::default()));
        assert_ne!(base, fingerprint(&params, Some("tok"), &RetryConfig::default()));
        let retry = RetryConfig {
            max_retries: 5,
            ..RetryConfig::default()
        };
        assert_ne!(base, fingerprint(&params, None, &retry));
        assert_ne!(base, fingerprint(&params.with_n_ctx(512), None, &RetryConfig::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_inits(2);
        let telemetry = Arc::new(RecordingTelemetry::default());
        let loader = loader(&engine).with_telemetry(telemetry.clone());

        let start = Instant::now();
        let model = loader
            .init(ContextParams::new("m.gguf"), None, None, None)
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
        assert_eq!(engine.init_calls().len(), 3);
        assert_eq!(model.params().await.model, "m.gguf");

        let failures = telemetry.failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].attempt, 1);
        assert_eq!(failures[1].attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_cpu_only() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_gpu_inits(true);
        let loader = loader(&engine);

        let start = Instant::now();
        let model = loader
            .init(ContextParams::new("m.gguf").with_gpu_layers(99), None, None, None)
            .await
            .unwrap();
        // 1s + 2s between GPU attempts, then straight to the CPU variant
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
        let calls = engine.init_calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3].n_gpu_layers, Some(0));
        assert_eq!(model.params().await.n_gpu_layers, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_reports_last_error() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_inits(usize::MAX);
        let loader = loader(&engine);

        let err = loader
            .init(
                ContextParams::new("m.gguf").with_gpu_layers(32),
                None,
                None,
                Some(RetryConfig {
                    max_retries: 2,
                    delay_ms: 10,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.source, EngineError::Failed("Failed to load model".into()));
        assert_eq!(loader.pending_inits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_makes_no_attempts() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_next_inits(usize::MAX);
        let telemetry = Arc::new(RecordingTelemetry::default());
        let loader = loader(&engine).with_telemetry(telemetry.clone());

        let start = Instant::now();
        let err = loader
            .init(
                ContextParams::new("m.gguf").with_gpu_layers(32),
                None,
                None,
                Some(RetryConfig {
                    max_retries: 0,
                    delay_ms: 10,
                }),
            )
            .await
            .unwrap_err();
        assert!(engine.init_calls().is_empty());
        assert_eq!(err.attempts, 0);
        assert_eq!(
            err.source,
            EngineError::Failed("Failed to initialize after all retries".into())
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(telemetry.failures.lock().unwrap().is_empty());
        assert_eq!(loader.pending_inits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_inits_share_one_attempt() {
        let engine = Arc::new(MockEngine::new());
        engine.set_init_delay(Duration::from_millis(100));
        let loader = loader(&engine);
        let params = ContextParams::new("m.gguf");

        let (a, b) = tokio::join!(
            loader.init(params.clone(), None, None, None),
            loader.init(params.clone(), None, None, None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(engine.init_calls().len(), 1);
        assert_eq!(a.session_id().await, b.session_id().await);
        assert_eq!(loader.pending_inits(), 0);

        // settled results are not reused
        let c = loader.init(params, None, None, None).await.unwrap();
        assert_eq!(engine.init_calls().len(), 2);
        assert_ne!(c.session_id().await, a.session_id().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_fingerprints_run_separately() {
        let engine = Arc::new(MockEngine::new());
        engine.set_init_delay(Duration::from_millis(100));
        let loader = loader(&engine);

        let (a, b) = tokio::join!(
            loader.init(ContextParams::new("m.gguf"), None, None, None),
            loader.init(ContextParams::new("m.gguf"), None, Some("tok".into()), None)
        );
        assert_ne!(a.unwrap().session_id().await, b.unwrap().session_id().await);
        assert_eq!(engine.init_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_init_stores_credential() {
        let engine = Arc::new(MockEngine::new());
        let loader = loader(&engine);
        loader
            .init(ContextParams::new("m.gguf"), None, Some("secret".into()), None)
            .await
            .unwrap();
        assert_eq!(loader.credential().token().unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_progress_callback_forwarded() {
        use std::sync::atomic::{AtomicU8, Ordering};

        let engine = Arc::new(MockEngine::new());
        let loader = loader(&engine);
        let seen = Arc::new(AtomicU8::new(0));
        let sink = Arc::clone(&seen);
        let progress: ProgressCallback = Arc::new(move |p| sink.store(p, Ordering::SeqCst));
        loader
            .init(ContextParams::new("m.gguf"), Some(progress), None, None)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }
}

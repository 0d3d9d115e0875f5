//! 可观测性：日志初始化与初始化失败的遥测上报

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::core::EngineError;

/// 日志：默认 info，可通过 RUST_LOG 覆盖；重复调用时忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 一次失败初始化的上下文字段
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InitFailureContext {
    pub n_gpu_layers: Option<u32>,
    pub n_ctx: Option<u32>,
    pub model: String,
    pub attempt: u32,
}

/// 遥测协作方：每次初始化尝试失败时调用；不得阻塞，也不影响控制流
pub trait Telemetry: Send + Sync {
    fn init_failure(&self, error: &EngineError, context: &InitFailureContext);
}

/// 以 tracing 事件的形式上报
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn init_failure(&self, error: &EngineError, context: &InitFailureContext) {
        tracing::warn!(
            target: "lmrelay::telemetry",
            error = %error,
            n_gpu_layers = ?context.n_gpu_layers,
            n_ctx = ?context.n_ctx,
            model = %context.model,
            attempt = context.attempt,
            "init attempt failed"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn init_failure(&self, _error: &EngineError, _context: &InitFailureContext) {}
}

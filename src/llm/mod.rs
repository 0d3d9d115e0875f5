//! 推理层：引擎契约与数据类型、模型加载、远程端点、后端路由、Mock 引擎

pub mod loader;
pub mod mock;
pub mod remote;
pub mod router;
pub mod traits;
pub mod types;

pub use loader::{InitAttemptPlan, ModelLoader, RetryConfig};
pub use mock::MockEngine;
pub use remote::{Credential, CredentialState, ImageAttachment, RemoteClient, RemoteError};
pub use router::{Backend, DispatchMode};
pub use traits::InferenceEngine;
pub use types::{
    CompletionParams, CompletionRequest, CompletionResult, ContextParams, EmbeddingParams,
    EmbeddingResult, ProgressCallback, SessionId, Timings, TokenCallback, TokenizeResult,
};

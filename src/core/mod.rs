//! 核心层：错误与恢复、会话监管、后端编排

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;

pub use error::{EngineError, InitError, RelayError};
pub use orchestrator::LanguageModel;
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use session_supervisor::{open_session, Attempt, SessionHandle, SessionSupervisor, StopHandle};

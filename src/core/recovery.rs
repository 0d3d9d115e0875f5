//! 错误恢复引擎
//!
//! 根据 EngineError 类型返回 RecoveryAction：会话丢失时重建会话并重试一次，其余错误原样传播。

use crate::core::EngineError;

/// 恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 用最近一次的配置重建会话，清空已跟踪历史后重试一次
    Reinitialize,
    /// 交给调用方
    Propagate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &EngineError) -> RecoveryAction {
        if err.is_session_lost() {
            RecoveryAction::Reinitialize
        } else {
            RecoveryAction::Propagate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lost_reinitializes() {
        let engine = RecoveryEngine::new();
        let err = EngineError::SessionLost("evicted".into());
        assert_eq!(engine.handle(&err), RecoveryAction::Reinitialize);
    }

    #[test]
    fn test_other_errors_propagate() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&EngineError::Failed("decode failed".into())),
            RecoveryAction::Propagate
        );
        assert_eq!(
            engine.handle(&EngineError::Unsupported("multimodal")),
            RecoveryAction::Propagate
        );
    }
}

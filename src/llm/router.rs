//! 后端路由：本地 / 远程 / 本地优先 / 远程优先
//!
//! 双后端模式只做一次回退：首选后端失败后尝试另一后端，若也失败则返回首选后端的原始错误，
//! 保证错误信息对应主路径。

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::RelayError;

/// 调度模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// 只走本地引擎
    #[default]
    Local,
    /// 只走远程端点
    Remote,
    /// 先本地，失败后远程
    #[serde(alias = "localfirst")]
    LocalFirst,
    /// 先远程，失败后本地
    #[serde(alias = "remotefirst")]
    RemoteFirst,
}

/// 参与调度的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Remote => write!(f, "remote"),
        }
    }
}

impl DispatchMode {
    /// 首选后端与（可选）回退后端
    pub fn plan(self) -> (Backend, Option<Backend>) {
        match self {
            DispatchMode::Local => (Backend::Local, None),
            DispatchMode::Remote => (Backend::Remote, None),
            DispatchMode::LocalFirst => (Backend::Local, Some(Backend::Remote)),
            DispatchMode::RemoteFirst => (Backend::Remote, Some(Backend::Local)),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "local-first" | "localfirst" => Ok(Self::LocalFirst),
            "remote-first" | "remotefirst" => Ok(Self::RemoteFirst),
            _ => Err(RelayError::InvalidDispatchMode(s.to_string())),
        }
    }
}

/// 首选结果失败时尝试一次回退；回退也失败则返回首选错误
pub async fn with_fallback<T, F, Fut>(
    primary: Backend,
    first: Result<T, RelayError>,
    fallback: Option<(Backend, F)>,
) -> Result<T, RelayError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let primary_err = match first {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    let Some((secondary, run)) = fallback else {
        return Err(primary_err);
    };

    tracing::warn!(
        primary = %primary,
        fallback = %secondary,
        error = %primary_err,
        "primary backend failed, trying fallback"
    );
    match run().await {
        Ok(value) => Ok(value),
        Err(fallback_err) => {
            tracing::warn!(
                fallback = %secondary,
                error = %fallback_err,
                "fallback backend failed too, surfacing primary error"
            );
            Err(primary_err)
        }
    }
}

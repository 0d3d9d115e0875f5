//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LMRELAY__*` 覆盖（双下划线表示嵌套，如 `LMRELAY__REMOTE__MODEL=...`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::{ContextParams, DispatchMode, RetryConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// [model] 段：本地会话参数
    pub model: ContextParams,
    /// [init] 段：初始化重试策略
    pub init: RetryConfig,
    pub remote: RemoteSection,
    pub dispatch: DispatchSection,
}

/// [remote] 段：OpenAI 兼容的远程端点
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    /// 未设置时远程嵌入不可用
    pub embedding_endpoint: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// 初始 Token；也可在初始化模型时传入
    pub token: Option<String>,
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_remote_model() -> String {
    "google/gemini-2.5-flash-lite".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_remote_model(),
            embedding_endpoint: None,
            embedding_model: default_embedding_model(),
            token: None,
        }
    }
}

/// [dispatch] 段：默认调度模式与工具循环上限
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_tool_recursion_limit")]
    pub tool_recursion_limit: u32,
}

fn default_tool_recursion_limit() -> u32 {
    3
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            tool_recursion_limit: default_tool_recursion_limit(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 LMRELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LMRELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LMRELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建 ModelLoader）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.init.max_retries, 3);
        assert_eq!(cfg.init.delay_ms, 1000);
        assert_eq!(cfg.dispatch.mode, DispatchMode::Local);
        assert_eq!(cfg.dispatch.tool_recursion_limit, 3);
        assert_eq!(cfg.remote.model, "google/gemini-2.5-flash-lite");
        assert!(cfg.remote.embedding_endpoint.is_none());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[model]
model = "models/qwen.gguf"
n_ctx = 4096
n_gpu_layers = 99
mmproj = "models/mmproj.gguf"

[remote]
endpoint = "http://127.0.0.1:9/v1/chat/completions"

[dispatch]
mode = "remote-first"
tool_recursion_limit = 5
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.model.model, "models/qwen.gguf");
        assert_eq!(cfg.model.n_ctx, Some(4096));
        assert_eq!(cfg.model.n_gpu_layers, Some(99));
        assert_eq!(cfg.model.mmproj.as_deref(), Some("models/mmproj.gguf"));
        assert_eq!(cfg.remote.endpoint, "http://127.0.0.1:9/v1/chat/completions");
        assert_eq!(cfg.remote.model, "google/gemini-2.5-flash-lite");
        assert_eq!(cfg.dispatch.mode, DispatchMode::RemoteFirst);
        assert_eq!(cfg.dispatch.tool_recursion_limit, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/lmrelay.toml"))).unwrap();
        assert_eq!(cfg.dispatch.tool_recursion_limit, 3);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("LMRELAY__INIT__DELAY_MS", "250");
        let cfg = reload_config().unwrap();
        std::env::remove_var("LMRELAY__INIT__DELAY_MS");
        assert_eq!(cfg.init.delay_ms, 250);
    }
}

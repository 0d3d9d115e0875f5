//! 引擎契约使用的数据类型：会话 ID、上下文参数、补全请求与结果、嵌入、分词

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memory::{Message, ToolCall};
use crate::tools::ToolSchema;

/// 引擎侧会话标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 加载进度回调（0-100）
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// 流式 Token 回调
pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// 会话初始化参数（模型路径、上下文长度、GPU/CPU 层划分等）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_batch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
    /// 卸载到加速器的层数；降级配置中为 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<u32>,
    #[serde(default)]
    pub embedding: bool,
    /// 多模态投影模型；设置后打开会话时同时初始化多模态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
}

impl ContextParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            n_ctx: None,
            n_batch: None,
            n_threads: None,
            n_gpu_layers: None,
            embedding: false,
            mmproj: None,
            chat_template: None,
        }
    }

    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = Some(n_ctx);
        self
    }

    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.n_gpu_layers = Some(layers);
        self
    }

    pub fn with_mmproj(mut self, mmproj: impl Into<String>) -> Self {
        self.mmproj = Some(mmproj.into());
        self
    }

    /// 关闭加速器卸载的降级配置
    pub fn cpu_only(&self) -> Self {
        Self {
            n_gpu_layers: Some(0),
            ..self.clone()
        }
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        Self::new("")
    }
}

/// 采样与生成参数
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// 使用 Jinja 模板格式化（带工具 schema 时需要）
    #[serde(default)]
    pub jinja: bool,
    /// 图片路径；本地走多模态补全，远程只附带第一张
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// 发往引擎的一次补全请求
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub params: CompletionParams,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSchema>,
}

/// 耗时统计；远程结果中耗时字段为 0
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub prompt_n: u32,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: u32,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

/// 补全结果；两种后端产出同一形状
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub content: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub tokens_predicted: u32,
    pub tokens_evaluated: u32,
    #[serde(default)]
    pub tokens_cached: u32,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub stopped_eos: bool,
    #[serde(default)]
    pub stopped_word: String,
    #[serde(default)]
    pub stopped_limit: u32,
    #[serde(default)]
    pub stopping_word: String,
    #[serde(default)]
    pub timings: Timings,
}

impl CompletionResult {
    /// 仅含文本的结果（正常以 EOS 结束）
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            content: text.clone(),
            text,
            stopped_eos: true,
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// 由远程纯文本响应合成：token 数按空格切分近似，耗时为 0
    pub fn synthesized(prompt: &str, response: &str) -> Self {
        let prompt_n = word_count(prompt);
        let predicted_n = word_count(response);
        Self {
            tokens_predicted: predicted_n,
            tokens_evaluated: prompt_n,
            timings: Timings {
                prompt_n,
                predicted_n,
                ..Timings::default()
            },
            ..Self::from_text(response)
        }
    }
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split(' ').count()).unwrap_or(u32::MAX)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embd_normalize: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub tokens: Vec<i32>,
}

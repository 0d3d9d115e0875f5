//! 远程补全端点（OpenAI 兼容 Chat Completions）
//!
//! 以 Bearer Token 鉴权，POST `{model, messages}`，取 `choices[0].message.content` 作为纯文本，
//! 再合成为与本地引擎相同形状的 CompletionResult。可选附带一张图片（data URL，挂在末尾 user 消息上）。
//! 401 会使凭证失效，此后的调用直接要求重新鉴权，不再发出注定失败的请求。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::RemoteSection;
use crate::llm::types::{CompletionResult, EmbeddingResult, TokenCallback};
use crate::memory::{ContentPart, Message, MessageContent, Role};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Remote token not set. Pass a token when initializing the model")]
    NotConfigured,

    #[error("Remote token was rejected earlier; re-authentication required")]
    ReauthenticationRequired,

    #[error("Authentication failed. Please update your token")]
    Unauthorized,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to read image: {0}")]
    Image(#[from] std::io::Error),

    #[error("Remote embedding is not configured")]
    EmbeddingUnsupported,
}

/// 凭证生命周期：未设置 → 已设置 → （401 后）失效
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum CredentialState {
    #[default]
    Unset,
    Set(String),
    Invalidated,
}

/// 远程调用共享的凭证；克隆后指向同一份状态
#[derive(Clone, Default)]
pub struct Credential {
    state: Arc<RwLock<CredentialState>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.state() {
            CredentialState::Unset => "unset",
            CredentialState::Set(_) => "set",
            CredentialState::Invalidated => "invalidated",
        };
        f.debug_tuple("Credential").field(&label).finish()
    }
}

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let credential = Self::new();
        credential.set(token);
        credential
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) =
            CredentialState::Set(token.into());
    }

    /// 收到 401 后调用
    pub fn invalidate(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = CredentialState::Invalidated;
    }

    pub fn state(&self) -> CredentialState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn token(&self) -> Result<String, RemoteError> {
        match self.state() {
            CredentialState::Set(token) => Ok(token),
            CredentialState::Unset => Err(RemoteError::NotConfigured),
            CredentialState::Invalidated => Err(RemoteError::ReauthenticationRequired),
        }
    }
}

/// 附带的图片：文件路径或原始字节
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageAttachment {
    Path(PathBuf),
    Data { bytes: Vec<u8>, mime_type: String },
}

impl ImageAttachment {
    /// 编码为 data URL；路径形式按扩展名推断 MIME
    pub async fn to_data_url(&self) -> Result<String, RemoteError> {
        let (bytes, mime) = match self {
            Self::Path(path) => (tokio::fs::read(path).await?, detect_mime_type(path).to_string()),
            Self::Data { bytes, mime_type } => (bytes.clone(), mime_type.clone()),
        };
        Ok(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
    }
}

pub fn detect_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// 远程后端客户端：持有 HTTP Client、端点、模型名与共享凭证
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    embedding_endpoint: Option<String>,
    embedding_model: String,
    credential: Credential,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    pub fn new(section: &RemoteSection, credential: Credential) -> Self {
        if let Some(token) = section.token.as_deref().filter(|t| !t.is_empty()) {
            if credential.state() == CredentialState::Unset {
                credential.set(token);
            }
        }
        Self {
            http: reqwest::Client::new(),
            endpoint: section.endpoint.clone(),
            model: section.model.clone(),
            embedding_endpoint: section.embedding_endpoint.clone(),
            embedding_model: section.embedding_model.clone(),
            credential,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// 补全；image 存在时附在末尾 user 消息上，流式回调按字符重放
    pub async fn complete(
        &self,
        messages: &[Message],
        image: Option<&ImageAttachment>,
        on_token: Option<TokenCallback>,
    ) -> Result<CompletionResult, RemoteError> {
        let prompt = transcript(messages);
        let image_url = match image {
            Some(image) => Some(image.to_data_url().await?),
            None => None,
        };
        let body = chat_payload(&self.model, messages, image_url)?;
        let response: ChatResponse = serde_json::from_value(self.post_json(&self.endpoint, &body).await?)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        let text = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse("no choices in response".to_string()))?
            .message
            .content
            .unwrap_or_default();

        if let Some(cb) = on_token {
            let mut buf = [0u8; 4];
            for ch in text.chars() {
                cb(ch.encode_utf8(&mut buf));
            }
        }
        Ok(CompletionResult::synthesized(&prompt, &text))
    }

    pub async fn embed(&self, text: &str) -> Result<EmbeddingResult, RemoteError> {
        let endpoint = self
            .embedding_endpoint
            .as_deref()
            .ok_or(RemoteError::EmbeddingUnsupported)?;
        let body = json!({ "model": self.embedding_model, "input": text });
        let response: EmbeddingResponse = serde_json::from_value(self.post_json(endpoint, &body).await?)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| RemoteError::InvalidResponse("no embedding in response".to_string()))?;
        Ok(EmbeddingResult { embedding })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RemoteError> {
        let token = self.credential.token()?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.credential.invalidate();
            tracing::warn!(url, "remote endpoint rejected the token, credential invalidated");
            return Err(RemoteError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// `role: content` 逐行拼接，用于近似 token 计数
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "{}: {}",
                m.role.as_str(),
                m.flatten_content().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 构造请求体；图片只挂到末尾的 user 消息上，否则丢弃并告警
pub fn chat_payload(
    model: &str,
    messages: &[Message],
    image_url: Option<String>,
) -> Result<Value, RemoteError> {
    let mut messages = messages.to_vec();
    if let Some(url) = image_url {
        match messages.last_mut() {
            Some(last) if last.role == Role::User => {
                let text = last.flatten_content().unwrap_or_default();
                last.content = Some(MessageContent::Parts(vec![
                    ContentPart::text(text),
                    ContentPart::image_url(url),
                ]));
            }
            _ => tracing::warn!("image provided but the last message is not a user message, dropping image"),
        }
    }
    let messages =
        serde_json::to_value(&messages).map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
    Ok(json!({ "model": model, "messages": messages }))
}

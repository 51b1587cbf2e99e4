use async_trait::async_trait;
use qa_core::{LlmProvider, Settings};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub use qa_error::{QaError, Result};

/// 发给 LLM 的单轮消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// 单次生成调用的选项；超时由调用点决定（打分/生成/改写各不相同）
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
        }
    }
}

/// 生成结果与 token 计数
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, turns: &[ChatTurn], opts: &ChatOptions) -> Result<ChatCompletion>;

    fn model_name(&self) -> &str;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(QaError::EmbeddingService {
                message: "empty embedding response".to_string(),
                retry_after: None,
            });
        }
        Ok(vectors.swap_remove(0))
    }
}

// ========== OpenAI-compatible ==========

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(http: Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            http,
            base_url,
            api_key,
            model,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OaiChatReq<'a> {
    model: &'a str,
    messages: Vec<OaiChatReqMsg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize, Default)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

fn oai_role(role: TurnRole) -> &'static str {
    match role {
        TurnRole::System => "system",
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, turns, opts))]
    async fn chat(&self, turns: &[ChatTurn], opts: &ChatOptions) -> Result<ChatCompletion> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OaiChatReq {
            model: &self.model,
            messages: turns
                .iter()
                .map(|t| OaiChatReqMsg {
                    role: oai_role(t.role),
                    content: &t.content,
                })
                .collect(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(opts.timeout)
            .json(&body)
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::LlmService {
                provider: "openai".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_hint(status.as_u16()),
            });
        }

        let data: OaiChatResp = resp.json().await.map_err(QaError::from)?;
        let usage = data.usage.unwrap_or_default();
        let text = data
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(ChatCompletion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(http: Client, api_url: String, api_key: String, model: String) -> Self {
        Self {
            http,
            api_url,
            api_key,
            model,
        }
    }
}

#[derive(Serialize)]
struct AnthMessageReqMsg<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthMessageReq<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthMessageReqMsg<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct AnthUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
    #[serde(default)]
    usage: Option<AnthUsage>,
}

#[async_trait]
impl ChatModel for AnthropicClient {
    #[instrument(skip(self, turns, opts))]
    async fn chat(&self, turns: &[ChatTurn], opts: &ChatOptions) -> Result<ChatCompletion> {
        let url = format!("{}/v1/messages", self.api_url.trim_end_matches('/'));

        // system 轮合并进顶层 system 字段，其余走 messages
        let system: Vec<&str> = turns
            .iter()
            .filter(|t| t.role == TurnRole::System)
            .map(|t| t.content.as_str())
            .collect();
        let messages: Vec<AnthMessageReqMsg> = turns
            .iter()
            .filter(|t| t.role != TurnRole::System)
            .map(|t| AnthMessageReqMsg {
                role: if t.role == TurnRole::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                content: &t.content,
            })
            .collect();

        let body = AnthMessageReq {
            model: &self.model,
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            messages,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
        };

        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(opts.timeout)
            .json(&body)
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::LlmService {
                provider: "claude".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_hint(status.as_u16()),
            });
        }

        let data: AnthMessageResp = resp.json().await.map_err(QaError::from)?;
        let usage = data.usage.unwrap_or_default();
        let mut text = String::new();
        for c in data.content {
            if let Some(t) = c.text {
                text.push_str(&t);
            }
        }
        Ok(ChatCompletion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ========== Ollama ==========

#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(http: Client, base_url: String, model: String) -> Self {
        Self {
            http,
            base_url,
            model,
        }
    }
}

#[derive(Serialize)]
struct OllamaChatReq<'a> {
    model: &'a str,
    messages: Vec<OaiChatReqMsg<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChatRespMsg {
    content: String,
}

#[derive(Deserialize)]
struct OllamaChatResp {
    message: OllamaChatRespMsg,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[async_trait]
impl ChatModel for OllamaClient {
    #[instrument(skip(self, turns, opts))]
    async fn chat(&self, turns: &[ChatTurn], opts: &ChatOptions) -> Result<ChatCompletion> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = OllamaChatReq {
            model: &self.model,
            messages: turns
                .iter()
                .map(|t| OaiChatReqMsg {
                    role: oai_role(t.role),
                    content: &t.content,
                })
                .collect(),
            stream: false,
            options: OllamaOptions {
                temperature: opts.temperature,
                num_predict: opts.max_tokens,
            },
        };

        let resp = self
            .http
            .post(url)
            .timeout(opts.timeout)
            .json(&body)
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::LlmService {
                provider: "ollama".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: retry_hint(status.as_u16()),
            });
        }

        let data: OllamaChatResp = resp.json().await.map_err(QaError::from)?;
        Ok(ChatCompletion {
            text: data.message.content,
            input_tokens: data.prompt_eval_count,
            output_tokens: data.eval_count,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ========== 嵌入服务 (HTTP model server) ==========

#[derive(Clone)]
pub struct HttpEmbedClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEmbedClient {
    pub fn new(http: Client, base_url: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }
}

#[derive(Serialize)]
struct EmbedReq<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResp {
    vectors: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbedModel for HttpEmbedClient {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&EmbedReq { texts })
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::EmbeddingService {
                message: format!("status={} body={}", status, txt),
                retry_after: retry_hint(status.as_u16()),
            });
        }

        let data: EmbedResp = resp.json().await.map_err(QaError::from)?;
        if data.vectors.len() != texts.len() {
            return Err(QaError::EmbeddingService {
                message: format!(
                    "vector count mismatch: sent {} texts, got {} vectors",
                    texts.len(),
                    data.vectors.len()
                ),
                retry_after: None,
            });
        }
        Ok(data.vectors)
    }
}

// ========== Provider Factory ==========

pub struct Providers {
    pub chat: Arc<dyn ChatModel>,
    pub embed: Arc<dyn EmbedModel>,
}

/// 429/5xx 视为可在稍后重试
fn retry_hint(status: u16) -> Option<Duration> {
    if status == 429 || status >= 500 {
        Some(Duration::from_secs(30))
    } else {
        None
    }
}

/// 按配置组装生成与嵌入客户端；HTTP 连接池跨请求共享
pub fn make_providers(settings: &Settings) -> Result<Providers> {
    let http = Client::builder()
        .pool_max_idle_per_host(settings.http_pool_size)
        .build()
        .map_err(|e| QaError::Internal {
            message: format!("failed to build http client: {}", e),
            details: None,
        })?;

    let chat: Arc<dyn ChatModel> = match settings.llm_provider {
        LlmProvider::Claude => {
            if settings.anthropic_api_key.is_empty() {
                return Err(QaError::Configuration {
                    key: "ANTHROPIC_API_KEY".to_string(),
                    reason: "required when LLM_PROVIDER=claude".to_string(),
                });
            }
            Arc::new(AnthropicClient::new(
                http.clone(),
                "https://api.anthropic.com".to_string(),
                settings.anthropic_api_key.clone(),
                settings.claude_model.clone(),
            ))
        }
        LlmProvider::Openai => {
            if settings.openai_api_key.is_empty() {
                return Err(QaError::Configuration {
                    key: "OPENAI_API_KEY".to_string(),
                    reason: "required when LLM_PROVIDER=openai".to_string(),
                });
            }
            Arc::new(OpenAiCompatClient::new(
                http.clone(),
                settings.openai_base_url.clone(),
                settings.openai_api_key.clone(),
                settings.openai_model.clone(),
            ))
        }
        LlmProvider::Ollama => Arc::new(OllamaClient::new(
            http.clone(),
            settings.ollama_base_url.clone(),
            settings.ollama_model.clone(),
        )),
    };

    let embed: Arc<dyn EmbedModel> = Arc::new(HttpEmbedClient::new(
        http,
        settings.embedding_url.clone(),
        Duration::from_secs(settings.embed_timeout_secs),
    ));

    Ok(Providers { chat, embed })
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 查询语言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ru,
    Uz,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ru => "ru",
            Language::Uz => "uz",
            Language::Unknown => "unknown",
        }
    }

    /// 下游统一把 unknown 当作英文处理
    pub fn or_english(self) -> Language {
        match self {
            Language::Unknown => Language::En,
            other => other,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户语言偏好
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguagePreference {
    #[default]
    Auto,
    En,
    Ru,
    Uz,
}

impl LanguagePreference {
    /// 显式偏好覆盖自动检测
    pub fn resolve(&self, detected: Language) -> Language {
        match self {
            LanguagePreference::Auto => detected,
            LanguagePreference::En => Language::En,
            LanguagePreference::Ru => Language::Ru,
            LanguagePreference::Uz => Language::Uz,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpertiseLevel {
    Beginner,
    Intermediate,
    Expert,
    #[default]
    General,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStyle {
    Concise,
    #[default]
    Balanced,
    Detailed,
}

fn default_true() -> bool {
    true
}

/// 每次调用的用户运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContext {
    #[serde(default)]
    pub language_preference: LanguagePreference,
    #[serde(default)]
    pub expertise_level: ExpertiseLevel,
    #[serde(default)]
    pub response_style: ResponseStyle,
    #[serde(default = "default_true")]
    pub enable_citations: bool,
    #[serde(default)]
    pub max_response_length: Option<u32>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            language_preference: LanguagePreference::default(),
            expertise_level: ExpertiseLevel::default(),
            response_style: ResponseStyle::default(),
            enable_citations: true,
            max_response_length: None,
        }
    }
}

/// 单次问答请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// 元数据过滤: 键 -> 值 或 {gte, lte} 范围
    #[serde(default)]
    pub filters: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub context: Option<RuntimeContext>,
    #[serde(default)]
    pub top_k: Option<u16>,
}

/// 检索到的文档片段，分数槽位沿流水线逐步填充
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub retrieval_score: Option<f32>,
    #[serde(default)]
    pub rerank_score: Option<f32>,
    #[serde(default)]
    pub combined_score: Option<f32>,
    #[serde(default)]
    pub grading_relevant: Option<bool>,
    #[serde(default)]
    pub grading_confidence: Option<f32>,
    #[serde(default)]
    pub grading_reason: Option<String>,
    #[serde(default)]
    pub language_match: bool,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: serde_json::Map::new(),
            retrieval_score: None,
            rerank_score: None,
            combined_score: None,
            grading_relevant: None,
            grading_confidence: None,
            grading_reason: None,
            language_match: false,
        }
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn source(&self) -> Option<&str> {
        self.meta_str("source")
    }

    pub fn language(&self) -> Option<&str> {
        self.meta_str("language")
    }

    pub fn document_id(&self) -> Option<&str> {
        self.meta_str("document_id")
    }

    pub fn file_hash(&self) -> Option<&str> {
        self.meta_str("file_hash")
    }

    pub fn page_number(&self) -> Option<i64> {
        self.metadata.get("page_number").and_then(|v| v.as_i64())
    }

    pub fn chunk_index(&self) -> Option<i64> {
        self.metadata.get("chunk_index").and_then(|v| v.as_i64())
    }

    /// 是否通过了打分筛选（relevant 且 confidence >= 阈值）
    pub fn passes_grading(&self, threshold: f32) -> bool {
        self.grading_relevant == Some(true)
            && self.grading_confidence.unwrap_or(0.0) >= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// 会话历史中的一条消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 会话状态，按 thread_id 保存为版本化 JSON 文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub thread_id: String,
    pub messages: Vec<StoredMessage>,
    pub retries: u32,
    #[serde(default)]
    pub last_query_language: Option<Language>,
    #[serde(default)]
    pub last_context_metadata: Option<ContextMetadata>,
    pub revision: u64,
}

pub const SESSION_SCHEMA_VERSION: u32 = 1;

impl SessionState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            version: SESSION_SCHEMA_VERSION,
            thread_id: thread_id.into(),
            messages: Vec::new(),
            retries: 0,
            last_query_language: None,
            last_context_metadata: None,
            revision: 0,
        }
    }
}

/// 随每次回答返回的上下文元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub model_name: String,
    pub context_window: u32,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub tokens_reserved: u32,
    pub context_usage_percent: f32,
    pub documents_retrieved: u32,
    pub documents_included: u32,
    pub confidence_score: f32,
    pub has_citations: bool,
    pub is_generic: bool,
    pub validation_passed: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// 非流式响应中的来源文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub text: String,
    pub score: Option<f32>,
    pub page_number: Option<i64>,
    pub source: Option<String>,
    pub language: Option<String>,
}

impl SourceDocument {
    /// 截取前 500 字符作为来源预览
    pub fn from_document(doc: &Document) -> Self {
        let text = if doc.text.chars().count() > 500 {
            doc.text.chars().take(500).collect::<String>()
        } else {
            doc.text.clone()
        };
        Self {
            text,
            score: doc.combined_score.or(doc.retrieval_score),
            page_number: doc.page_number(),
            source: doc.source().map(|s| s.to_string()),
            language: doc.language().map(|s| s.to_string()),
        }
    }
}

/// 非流式问答的最终响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub query: String,
    pub retries: u32,
    pub thread_id: String,
    #[serde(default)]
    pub context_metadata: Option<ContextMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Warning,
    Error,
    NodeStart,
    NodeEnd,
    ThreadCreated,
    Generation,
}

/// 流式事件，每帧一个 JSON 对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Event {
    fn new(event_type: EventType, node: Option<String>, data: Option<Value>) -> Self {
        Self {
            event_type,
            node,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn node_start(node: &str) -> Self {
        Self::new(EventType::NodeStart, Some(node.to_string()), None)
    }

    pub fn node_end(node: &str, summary: Value) -> Self {
        Self::new(EventType::NodeEnd, Some(node.to_string()), Some(summary))
    }

    pub fn warning(data: Value) -> Self {
        Self::new(EventType::Warning, None, Some(data))
    }

    pub fn error(category: &str, message: &str) -> Self {
        Self::new(
            EventType::Error,
            None,
            Some(serde_json::json!({ "category": category, "message": message })),
        )
    }

    pub fn thread_created(thread_id: &str) -> Self {
        Self::new(
            EventType::ThreadCreated,
            None,
            Some(serde_json::json!({ "thread_id": thread_id })),
        )
    }

    pub fn generation(data: Value) -> Self {
        Self::new(EventType::Generation, None, Some(data))
    }

    /// 终止事件：每次调用恰好一个
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Generation | EventType::Error)
    }
}

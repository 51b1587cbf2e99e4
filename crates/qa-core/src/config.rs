use qa_error::{QaError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// LLM 提供商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Claude,
    Openai,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = QaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(LlmProvider::Claude),
            "openai" => Ok(LlmProvider::Openai),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(QaError::Configuration {
                key: "LLM_PROVIDER".to_string(),
                reason: format!("unknown provider: {}", other),
            }),
        }
    }
}

/// 进程级不可变配置，启动时从环境变量构建一次
#[derive(Debug, Clone)]
pub struct Settings {
    // -- Server --
    pub host: String,
    pub port: u16,

    // -- LLM --
    pub llm_provider: LlmProvider,
    pub anthropic_api_key: String,
    pub claude_model: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub ollama_base_url: String,
    pub ollama_model: String,

    // -- Embedding --
    pub embedding_url: String,
    pub embedding_model_id: String,
    pub embedding_dim: usize,

    // -- Qdrant --
    pub qdrant_url: String,
    pub qdrant_collection: String,

    // -- Reranker --
    pub reranker_url: String,

    // -- Session / checkpoint --
    pub redis_url: Option<String>,
    pub session_ttl_secs: u64,

    // -- Object store (仅健康探测) --
    pub object_store_url: Option<String>,

    // -- Retrieval --
    pub retrieval_top_k: u16,
    pub retrieval_prefetch_limit: u16,
    pub rerank_top_k: usize,
    pub rrf_k: f32,

    // -- Ingestion 参数（核心不消费，仅为部署对齐而透出） --
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // -- Agent --
    pub max_retries: u32,
    pub max_query_length: usize,
    pub strict_output_guardrails: bool,

    // -- HTTP / 超时 --
    pub http_pool_size: usize,
    pub embed_timeout_secs: u64,
    pub vector_timeout_secs: u64,
    pub rerank_timeout_secs: u64,
    pub grade_timeout_secs: u64,
    pub generate_timeout_secs: u64,
    pub rewrite_timeout_secs: u64,
    pub request_deadline_secs: u64,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

/// 缺省时取默认值；设置了但无法解析则视为配置错误
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|_| QaError::Configuration {
            key: key.to_string(),
            reason: format!("invalid value: {}", raw),
        }),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let llm_provider = env_string("LLM_PROVIDER", "ollama").parse::<LlmProvider>()?;

        Ok(Self {
            host: env_string("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8000u16)?,

            llm_provider,
            anthropic_api_key: env_string("ANTHROPIC_API_KEY", ""),
            claude_model: env_string("CLAUDE_MODEL", "claude-sonnet-4-20250514"),
            openai_api_key: env_string("OPENAI_API_KEY", ""),
            openai_base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com"),
            openai_model: env_string("OPENAI_MODEL", "gpt-4o"),
            ollama_base_url: env_string("OLLAMA_BASE_URL", "http://localhost:11434"),
            ollama_model: env_string("OLLAMA_MODEL", "llama3.1"),

            embedding_url: env_string("EMBEDDING_URL", "http://localhost:8080"),
            embedding_model_id: env_string("EMBEDDING_MODEL_ID", "nomic-embed-text"),
            embedding_dim: env_parse("EMBEDDING_DIM", 768usize)?,

            qdrant_url: env_string("QDRANT_URL", "http://localhost:6334"),
            qdrant_collection: env_string("QDRANT_COLLECTION", "documents"),

            reranker_url: env_string("RERANKER_URL", "http://localhost:8080"),

            redis_url: env_opt("REDIS_URL"),
            session_ttl_secs: env_parse("SESS_TTL_SECS", 3600u64)?,

            object_store_url: env_opt("OBJECT_STORE_URL"),

            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", 10u16)?,
            retrieval_prefetch_limit: env_parse("RETRIEVAL_PREFETCH_LIMIT", 20u16)?,
            rerank_top_k: env_parse("RERANK_TOP_K", 5usize)?,
            rrf_k: env_parse("RRF_K", 60.0f32)?,

            chunk_size: env_parse("CHUNK_SIZE", 500usize)?,
            chunk_overlap: env_parse("CHUNK_OVERLAP", 100usize)?,

            max_retries: env_parse("MAX_RETRIES", 3u32)?,
            max_query_length: env_parse("MAX_QUERY_LENGTH", 2000usize)?,
            strict_output_guardrails: env_parse("STRICT_OUTPUT_GUARDRAILS", false)?,

            http_pool_size: env_parse("HTTP_POOL_SIZE", 32usize)?,
            embed_timeout_secs: env_parse("EMBED_TIMEOUT_SECS", 30u64)?,
            vector_timeout_secs: env_parse("VECTOR_TIMEOUT_SECS", 10u64)?,
            rerank_timeout_secs: env_parse("RERANK_TIMEOUT_SECS", 30u64)?,
            grade_timeout_secs: env_parse("GRADE_TIMEOUT_SECS", 120u64)?,
            generate_timeout_secs: env_parse("GENERATE_TIMEOUT_SECS", 180u64)?,
            rewrite_timeout_secs: env_parse("REWRITE_TIMEOUT_SECS", 60u64)?,
            request_deadline_secs: env_parse("REQUEST_DEADLINE_SECS", 240u64)?,
        })
    }

    /// 当前提供商对应的生成模型名
    pub fn chat_model_name(&self) -> &str {
        match self.llm_provider {
            LlmProvider::Claude => &self.claude_model,
            LlmProvider::Openai => &self.openai_model,
            LlmProvider::Ollama => &self.ollama_model,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            llm_provider: LlmProvider::Ollama,
            anthropic_api_key: String::new(),
            claude_model: "claude-sonnet-4-20250514".into(),
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com".into(),
            openai_model: "gpt-4o".into(),
            ollama_base_url: "http://localhost:11434".into(),
            ollama_model: "llama3.1".into(),
            embedding_url: "http://localhost:8080".into(),
            embedding_model_id: "nomic-embed-text".into(),
            embedding_dim: 768,
            qdrant_url: "http://localhost:6334".into(),
            qdrant_collection: "documents".into(),
            reranker_url: "http://localhost:8080".into(),
            redis_url: None,
            session_ttl_secs: 3600,
            object_store_url: None,
            retrieval_top_k: 10,
            retrieval_prefetch_limit: 20,
            rerank_top_k: 5,
            rrf_k: 60.0,
            chunk_size: 500,
            chunk_overlap: 100,
            max_retries: 3,
            max_query_length: 2000,
            strict_output_guardrails: false,
            http_pool_size: 32,
            embed_timeout_secs: 30,
            vector_timeout_secs: 10,
            rerank_timeout_secs: 30,
            grade_timeout_secs: 120,
            generate_timeout_secs: 180,
            rewrite_timeout_secs: 60,
            request_deadline_secs: 240,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("claude".parse::<LlmProvider>().unwrap(), LlmProvider::Claude);
        assert_eq!("OpenAI".parse::<LlmProvider>().unwrap(), LlmProvider::Openai);
        assert!("gemini".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_defaults_match_contract() {
        let s = Settings::default();
        assert_eq!(s.retrieval_top_k, 10);
        assert_eq!(s.retrieval_prefetch_limit, 20);
        assert_eq!(s.rerank_top_k, 5);
        assert_eq!(s.rrf_k, 60.0);
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.max_query_length, 2000);
        assert!(!s.strict_output_guardrails);
        assert_eq!(s.request_deadline_secs, 240);
    }

    #[test]
    fn test_chat_model_name_follows_provider() {
        let mut s = Settings::default();
        s.llm_provider = LlmProvider::Claude;
        assert_eq!(s.chat_model_name(), s.claude_model);
        s.llm_provider = LlmProvider::Openai;
        assert_eq!(s.chat_model_name(), s.openai_model);
    }
}

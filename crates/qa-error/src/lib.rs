use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum QaError {
    // === 守卫错误 ===
    #[error("输入被拒绝: {reason}")]
    GuardrailInput { reason: String },

    #[error("输出校验失败: {reason}")]
    GuardrailOutput { reason: String },

    // === 外部服务错误 ===
    #[error("向量后端错误: {operation}")]
    VectorStore { operation: String, message: String },

    #[error("嵌入服务错误: {message}")]
    EmbeddingService {
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("重排服务错误: {message}")]
    RerankerService { message: String },

    #[error("LLM 服务错误 ({provider})")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("会话存储错误: {operation}")]
    SessionStore { operation: String, message: String },

    // === 系统错误 ===
    #[error("请求已取消")]
    Cancelled,

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("并发错误: {operation}")]
    Concurrency { operation: String, message: String },

    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

impl QaError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            QaError::GuardrailInput { .. }
            | QaError::GuardrailOutput { .. }
            | QaError::InvalidRequest { .. }
            | QaError::Cancelled => ErrorSeverity::Low,
            QaError::EmbeddingService { .. }
            | QaError::RerankerService { .. }
            | QaError::LlmService { .. }
            | QaError::Network { .. }
            | QaError::Timeout { .. } => ErrorSeverity::Medium,
            QaError::VectorStore { .. }
            | QaError::SessionStore { .. }
            | QaError::Serialization { .. }
            | QaError::Concurrency { .. } => ErrorSeverity::High,
            QaError::Internal { .. } | QaError::Configuration { .. } => ErrorSeverity::Critical,
        }
    }

    /// 对外暴露的错误类别（流式 error 事件中的 category 字段）
    pub fn category(&self) -> &'static str {
        match self {
            QaError::GuardrailInput { .. } | QaError::InvalidRequest { .. } => "guardrail_input",
            QaError::GuardrailOutput { .. } => "guardrail_output",
            QaError::VectorStore { .. } | QaError::EmbeddingService { .. } => {
                "retrieval_unavailable"
            }
            QaError::RerankerService { .. } => "reranker_unavailable",
            QaError::LlmService { .. } => "llm_unavailable",
            QaError::Cancelled | QaError::Timeout { .. } => "cancelled",
            _ => "internal",
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            QaError::Network { .. } | QaError::Timeout { .. } => true,
            QaError::LlmService { retry_after, .. }
            | QaError::EmbeddingService { retry_after, .. } => retry_after.is_some(),
            QaError::VectorStore { .. } | QaError::RerankerService { .. } => true,
            QaError::Concurrency { .. } => true,
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            QaError::LlmService { retry_after, .. }
            | QaError::EmbeddingService { retry_after, .. } => *retry_after,
            QaError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            QaError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            QaError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            QaError::GuardrailInput { .. } | QaError::InvalidRequest { .. } => 400,
            QaError::GuardrailOutput { .. } => 422,
            QaError::Timeout { .. } => 408,
            QaError::Cancelled => 499,
            QaError::VectorStore { .. }
            | QaError::EmbeddingService { .. }
            | QaError::RerankerService { .. }
            | QaError::LlmService { .. } => 503,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            QaError::GuardrailInput { reason } => {
                format!("Request rejected by input guardrails: {}", reason)
            }
            QaError::GuardrailOutput { .. } => {
                "The generated answer failed output validation.".to_string()
            }
            QaError::VectorStore { .. } | QaError::EmbeddingService { .. } => {
                "Document retrieval is temporarily unavailable. Please retry later.".to_string()
            }
            QaError::LlmService { .. } => {
                "The language model is temporarily unavailable. Please retry later.".to_string()
            }
            QaError::Cancelled => "The request was cancelled.".to_string(),
            QaError::InvalidRequest { reason } => format!("Invalid request: {}", reason),
            QaError::Timeout { .. } => "The request timed out. Please retry.".to_string(),
            _ => "Internal error. Please contact the administrator.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QaError>;

// === 转换实现 ===

impl From<serde_json::Error> for QaError {
    fn from(err: serde_json::Error) -> Self {
        QaError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for QaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            QaError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000,
            }
        } else if err.is_connect() {
            QaError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            QaError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<qdrant_client::QdrantError> for QaError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        QaError::VectorStore {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for QaError {
    fn from(err: tokio::task::JoinError) -> Self {
        QaError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for QaError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.to_string(),
            "category": self.category(),
            "message": self.user_message(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        let err = QaError::GuardrailInput {
            reason: "injection".into(),
        };
        assert_eq!(err.category(), "guardrail_input");

        let err = QaError::VectorStore {
            operation: "search".into(),
            message: "unreachable".into(),
        };
        assert_eq!(err.category(), "retrieval_unavailable");

        let err = QaError::LlmService {
            provider: "claude".into(),
            message: "503".into(),
            retry_after: None,
        };
        assert_eq!(err.category(), "llm_unavailable");

        assert_eq!(QaError::Cancelled.category(), "cancelled");
    }

    #[test]
    fn test_guardrail_errors_never_retryable() {
        let err = QaError::GuardrailInput {
            reason: "injection".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn test_transient_errors_retryable() {
        let err = QaError::Network {
            operation: "connect".into(),
            message: "refused".into(),
        };
        assert!(err.is_retryable());
        assert!(err.retry_after().is_some());

        let err = QaError::Timeout {
            operation: "rerank".into(),
            timeout_ms: 30000,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            QaError::GuardrailInput {
                reason: "too long".into()
            }
            .to_http_status(),
            400
        );
        assert_eq!(
            QaError::RerankerService {
                message: "down".into()
            }
            .to_http_status(),
            503
        );
    }
}

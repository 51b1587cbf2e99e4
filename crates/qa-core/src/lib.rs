pub mod cancel;
pub mod config;
pub mod retry;
pub mod types;

pub use cancel::CancelToken;
pub use config::{LlmProvider, Settings};
pub use retry::{retry_with_backoff, BackoffPolicy};
pub use types::{
    ChatRole, ContextMetadata, Document, Event, EventType, ExpertiseLevel, Language,
    LanguagePreference, QueryRequest, QueryResponse, ResponseStyle, RuntimeContext, SessionState,
    SourceDocument, StoredMessage, SESSION_SCHEMA_VERSION,
};

pub use qa_error::{QaError, Result};

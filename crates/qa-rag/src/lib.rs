pub mod language;
pub mod rerank;
pub mod retriever;
pub mod vector;

pub use language::detect_language;
pub use rerank::{HttpReranker, RerankAdapter, RerankHit, Reranker};
pub use retriever::{RetrievalOutcome, Retriever};
pub use vector::{HybridResult, QdrantVectorIndex, SearchHit, VectorIndex};

pub use qa_error::{QaError, Result};

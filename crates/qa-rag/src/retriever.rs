use crate::vector::VectorIndex;
use qa_core::{retry_with_backoff, BackoffPolicy, Document, Language};
use qa_error::Result;
use qa_llm::EmbedModel;
use serde_json::Map;
use std::sync::Arc;
use tracing::{debug, instrument};

/// 同语言文档的加权系数
const LANGUAGE_BOOST: f32 = 1.10;

/// 检索结果与伴随的警告
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub documents: Vec<Document>,
    pub warnings: Vec<String>,
}

/// 检索适配器：嵌入查询、混合检索、同语言加权
pub struct Retriever {
    embed: Arc<dyn EmbedModel>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    prefetch: usize,
}

impl Retriever {
    pub fn new(
        embed: Arc<dyn EmbedModel>,
        index: Arc<dyn VectorIndex>,
        top_k: usize,
        prefetch: usize,
    ) -> Self {
        Self {
            embed,
            index,
            top_k,
            prefetch,
        }
    }

    #[instrument(skip(self, filters), fields(query_len = query.len()))]
    pub async fn retrieve(
        &self,
        query: &str,
        filters: Option<&Map<String, serde_json::Value>>,
        top_k_override: Option<usize>,
        query_language: Language,
    ) -> Result<RetrievalOutcome> {
        let top_k = top_k_override.unwrap_or(self.top_k);

        let query_vector = retry_with_backoff(BackoffPolicy::default(), "embed_query", || {
            self.embed.embed_one(query)
        })
        .await?;

        let result = retry_with_backoff(BackoffPolicy::default(), "hybrid_query", || {
            self.index
                .hybrid_query(query_vector.clone(), query, filters, top_k, self.prefetch)
        })
        .await?;

        let mut warnings = Vec::new();
        if !result.lexical_available {
            warnings.push("lexical_index_missing".to_string());
        }

        let mut documents: Vec<Document> = result
            .hits
            .into_iter()
            .map(|hit| {
                let mut metadata = hit.payload;
                let text = metadata
                    .remove("text")
                    .and_then(|v| v.as_str().map(|s| s.to_string()))
                    .unwrap_or_default();
                let mut doc = Document::new(hit.id, text);
                doc.metadata = metadata;
                doc.retrieval_score = Some(hit.score);
                doc
            })
            .collect();

        // 同语言文档加权后稳定重排；缺失 language 元数据的文档不加权
        if query_language != Language::Unknown {
            for doc in &mut documents {
                if doc.language() == Some(query_language.as_str()) {
                    doc.retrieval_score = doc.retrieval_score.map(|s| s * LANGUAGE_BOOST);
                    doc.language_match = true;
                }
            }
            documents.sort_by(|a, b| {
                b.retrieval_score
                    .partial_cmp(&a.retrieval_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        debug!(
            documents = documents.len(),
            language = %query_language,
            "retrieval completed"
        );

        Ok(RetrievalOutcome {
            documents,
            warnings,
        })
    }
}

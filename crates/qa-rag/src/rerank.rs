use async_trait::async_trait;
use qa_core::{retry_with_backoff, BackoffPolicy, Document};
use qa_error::{QaError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// 重排器单条结果
#[derive(Debug, Clone, Deserialize)]
pub struct RerankHit {
    pub index: usize,
    pub score: f32,
}

/// 交叉编码器重排抽象
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String], top_k: usize)
        -> Result<Vec<RerankHit>>;
}

/// HTTP 重排服务客户端 (cross-encoder model server)
pub struct HttpReranker {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpReranker {
    pub fn new(http: Client, base_url: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }
}

#[derive(Serialize)]
struct RerankReq<'a> {
    query: &'a str,
    documents: &'a [String],
    top_k: usize,
}

#[async_trait]
impl Reranker for HttpReranker {
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankHit>> {
        let url = format!("{}/rerank", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&RerankReq {
                query,
                documents,
                top_k,
            })
            .send()
            .await
            .map_err(QaError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(QaError::RerankerService {
                message: format!("status={} body={}", status, txt),
            });
        }

        let hits: Vec<RerankHit> = resp.json().await.map_err(QaError::from)?;
        Ok(hits)
    }
}

/// 重排阶段：保留检索分并计算组合分；服务不可用时降级为按检索分透传
pub struct RerankAdapter {
    reranker: Arc<dyn Reranker>,
    top_k: usize,
}

impl RerankAdapter {
    pub fn new(reranker: Arc<dyn Reranker>, top_k: usize) -> Self {
        Self { reranker, top_k }
    }

    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn rerank_documents(
        &self,
        query: &str,
        documents: Vec<Document>,
    ) -> (Vec<Document>, Vec<String>) {
        if documents.is_empty() {
            return (documents, Vec::new());
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let result = retry_with_backoff(BackoffPolicy::default(), "rerank", || {
            self.reranker.rerank(query, &texts, self.top_k)
        })
        .await;

        match result {
            Ok(hits) => {
                let mut reranked = Vec::with_capacity(hits.len());
                for hit in hits {
                    let Some(original) = documents.get(hit.index) else {
                        warn!(index = hit.index, "reranker returned out-of-range index");
                        continue;
                    };
                    let mut doc = original.clone();
                    let retrieval = doc.retrieval_score.unwrap_or(0.0);
                    doc.rerank_score = Some(hit.score);
                    doc.combined_score = Some((retrieval + hit.score) / 2.0);
                    reranked.push(doc);
                }
                reranked.sort_by(|a, b| {
                    b.rerank_score
                        .partial_cmp(&a.rerank_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                reranked.truncate(self.top_k);
                (reranked, Vec::new())
            }
            Err(e) => {
                // 降级：按检索分取前 top_k，重排分复用检索分
                warn!(error = %e, "reranker unavailable, passing through by retrieval score");
                let mut fallback = documents;
                fallback.sort_by(|a, b| {
                    b.retrieval_score
                        .partial_cmp(&a.retrieval_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                fallback.truncate(self.top_k);
                for doc in &mut fallback {
                    let retrieval = doc.retrieval_score.unwrap_or(0.0);
                    doc.rerank_score = Some(retrieval);
                    doc.combined_score = Some(retrieval);
                }
                (fallback, vec!["reranker_unavailable".to_string()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReranker {
        hits: Vec<RerankHit>,
    }

    #[async_trait]
    impl Reranker for FixedReranker {
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_k: usize,
        ) -> Result<Vec<RerankHit>> {
            Ok(self.hits.clone())
        }
    }

    struct DownReranker;

    #[async_trait]
    impl Reranker for DownReranker {
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_k: usize,
        ) -> Result<Vec<RerankHit>> {
            Err(QaError::RerankerService {
                message: "connection refused".into(),
            })
        }
    }

    fn doc(id: &str, retrieval: f32) -> Document {
        let mut d = Document::new(id, format!("text {}", id));
        d.retrieval_score = Some(retrieval);
        d
    }

    #[tokio::test]
    async fn test_rerank_assigns_scores_and_sorts() {
        let reranker = FixedReranker {
            hits: vec![
                RerankHit { index: 1, score: 0.9 },
                RerankHit { index: 0, score: 0.4 },
            ],
        };
        let adapter = RerankAdapter::new(Arc::new(reranker), 5);
        let (docs, warnings) = adapter
            .rerank_documents("q", vec![doc("a", 0.6), doc("b", 0.5)])
            .await;
        assert!(warnings.is_empty());
        assert_eq!(docs[0].id, "b");
        assert_eq!(docs[0].rerank_score, Some(0.9));
        assert!((docs[0].combined_score.unwrap() - (0.5 + 0.9) / 2.0).abs() < 1e-6);
        // 重排分单调不增
        assert!(docs[0].rerank_score >= docs[1].rerank_score);
    }

    #[tokio::test]
    async fn test_truncates_to_top_k() {
        let hits = (0..8).map(|i| RerankHit { index: i, score: 1.0 - i as f32 * 0.1 }).collect();
        let adapter = RerankAdapter::new(Arc::new(FixedReranker { hits }), 5);
        let documents = (0..8).map(|i| doc(&format!("d{}", i), 0.5)).collect();
        let (docs, _) = adapter.rerank_documents("q", documents).await;
        assert_eq!(docs.len(), 5);
    }

    #[tokio::test]
    async fn test_fallback_on_reranker_failure() {
        let adapter = RerankAdapter::new(Arc::new(DownReranker), 2);
        let (docs, warnings) = adapter
            .rerank_documents("q", vec![doc("a", 0.3), doc("b", 0.9), doc("c", 0.5)])
            .await;
        assert_eq!(warnings, vec!["reranker_unavailable".to_string()]);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "b");
        // 降级路径仍然填充两个分数槽位
        assert_eq!(docs[0].rerank_score, Some(0.9));
        assert_eq!(docs[0].combined_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_out_of_range_index_skipped() {
        let reranker = FixedReranker {
            hits: vec![
                RerankHit { index: 0, score: 0.8 },
                RerankHit { index: 7, score: 0.7 },
            ],
        };
        let adapter = RerankAdapter::new(Arc::new(reranker), 5);
        let (docs, _) = adapter.rerank_documents("q", vec![doc("a", 0.6)]).await;
        assert_eq!(docs.len(), 1);
    }
}

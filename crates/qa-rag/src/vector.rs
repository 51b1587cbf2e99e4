use async_trait::async_trait;
use qa_error::{QaError, Result};
use qdrant_client::{
    qdrant::{
        condition::ConditionOneOf, r#match::MatchValue, value::Kind, Condition,
        CreateFieldIndexCollection, FieldCondition, FieldType, Filter, Match, PointId, Range,
        RepeatedStrings, ScrollPoints, SearchPoints, Value, WithPayloadSelector,
        with_payload_selector::SelectorOptions,
    },
    Qdrant,
};
use serde_json::Map;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 融合后的单条命中
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, serde_json::Value>,
}

/// 混合检索结果；词法索引缺失时降级为纯稠密检索
#[derive(Debug, Clone)]
pub struct HybridResult {
    pub hits: Vec<SearchHit>,
    pub lexical_available: bool,
}

/// 向量后端抽象：稠密 + 全文混合查询，RRF 融合
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn hybrid_query(
        &self,
        dense_vector: Vec<f32>,
        text_query: &str,
        filter: Option<&Map<String, serde_json::Value>>,
        top_k: usize,
        prefetch: usize,
    ) -> Result<HybridResult>;

    /// 幂等地创建全文与过滤所需的 payload 索引
    async fn ensure_text_index(&self) -> Result<()>;

    async fn health_check(&self) -> bool;

    async fn collection_info(&self) -> Result<serde_json::Value>;
}

/// 基于 Qdrant 的混合检索实现
pub struct QdrantVectorIndex {
    client: Qdrant,
    collection: String,
    rrf_k: f32,
}

impl QdrantVectorIndex {
    pub fn new(url: &str, collection: String, rrf_k: f32, timeout: Duration) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .timeout(timeout)
            .build()
            .map_err(|e| QaError::VectorStore {
                operation: "connect".to_string(),
                message: format!("failed to connect to Qdrant: {}", e),
            })?;
        Ok(Self {
            client,
            collection,
            rrf_k,
        })
    }

    fn payload_selector() -> WithPayloadSelector {
        WithPayloadSelector {
            selector_options: Some(SelectorOptions::Enable(true)),
        }
    }

    /// 将请求过滤条件翻译为 Qdrant 谓词：等值、in 列表、{gte,lte} 范围，键间取合取
    fn build_filter(filters: &Map<String, serde_json::Value>) -> Result<Filter> {
        let mut conditions = Vec::new();

        for (key, value) in filters {
            let condition = match value {
                serde_json::Value::Object(range) => {
                    let r = Range {
                        gte: range.get("gte").and_then(|v| v.as_f64()),
                        lte: range.get("lte").and_then(|v| v.as_f64()),
                        gt: range.get("gt").and_then(|v| v.as_f64()),
                        lt: range.get("lt").and_then(|v| v.as_f64()),
                    };
                    if r.gte.is_none() && r.lte.is_none() && r.gt.is_none() && r.lt.is_none() {
                        return Err(QaError::InvalidRequest {
                            reason: format!("filter '{}' has no gte/lte bounds", key),
                        });
                    }
                    field_condition(key, FieldConditionKind::Range(r))
                }
                serde_json::Value::Array(values) => {
                    let strings: Vec<String> = values
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect();
                    if strings.len() != values.len() {
                        return Err(QaError::InvalidRequest {
                            reason: format!("filter '{}' list must contain strings", key),
                        });
                    }
                    field_condition(
                        key,
                        FieldConditionKind::Match(MatchValue::Keywords(RepeatedStrings {
                            strings,
                        })),
                    )
                }
                serde_json::Value::String(s) => field_condition(
                    key,
                    FieldConditionKind::Match(MatchValue::Keyword(s.clone())),
                ),
                serde_json::Value::Bool(b) => {
                    field_condition(key, FieldConditionKind::Match(MatchValue::Boolean(*b)))
                }
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        field_condition(key, FieldConditionKind::Match(MatchValue::Integer(i)))
                    } else {
                        return Err(QaError::InvalidRequest {
                            reason: format!("filter '{}' must be an integer or range", key),
                        });
                    }
                }
                other => {
                    return Err(QaError::InvalidRequest {
                        reason: format!("unsupported filter value for '{}': {}", key, other),
                    })
                }
            };
            conditions.push(condition);
        }

        Ok(Filter {
            must: conditions,
            ..Default::default()
        })
    }

    /// 按排名做 Reciprocal Rank Fusion
    fn rrf_fuse(
        &self,
        dense: Vec<(String, Map<String, serde_json::Value>)>,
        lexical: Vec<(String, Map<String, serde_json::Value>)>,
        top_k: usize,
    ) -> Vec<SearchHit> {
        let mut scores: HashMap<String, f32> = HashMap::new();
        let mut payloads: HashMap<String, Map<String, serde_json::Value>> = HashMap::new();

        for ranked in [dense, lexical] {
            for (rank, (id, payload)) in ranked.into_iter().enumerate() {
                *scores.entry(id.clone()).or_insert(0.0) +=
                    1.0 / (self.rrf_k + rank as f32 + 1.0);
                payloads.entry(id).or_insert(payload);
            }
        }

        let mut fused: Vec<SearchHit> = scores
            .into_iter()
            .map(|(id, score)| SearchHit {
                payload: payloads.remove(&id).unwrap_or_default(),
                id,
                score,
            })
            .collect();
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        fused.truncate(top_k);
        fused
    }
}

enum FieldConditionKind {
    Match(MatchValue),
    Range(Range),
}

fn field_condition(key: &str, kind: FieldConditionKind) -> Condition {
    let mut fc = FieldCondition {
        key: key.to_string(),
        ..Default::default()
    };
    match kind {
        FieldConditionKind::Match(value) => {
            fc.r#match = Some(Match {
                match_value: Some(value),
            });
        }
        FieldConditionKind::Range(range) => fc.range = Some(range),
    }
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(fc)),
    }
}

fn point_id_to_string(id: Option<&PointId>) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.and_then(|p| p.point_id_options.as_ref()) {
        Some(PointIdOptions::Num(n)) => n.to_string(),
        Some(PointIdOptions::Uuid(u)) => u.clone(),
        None => String::new(),
    }
}

/// Qdrant payload 值转 JSON
fn qdrant_value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::IntegerValue(i)) => serde_json::Value::Number(i.into()),
        Some(Kind::DoubleValue(f)) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(
            list.values.into_iter().map(qdrant_value_to_json).collect(),
        ),
        Some(Kind::StructValue(st)) => serde_json::Value::Object(
            st.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}

fn payload_to_json(payload: HashMap<String, Value>) -> Map<String, serde_json::Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, qdrant_value_to_json(v)))
        .collect()
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    #[instrument(skip(self, dense_vector, filter))]
    async fn hybrid_query(
        &self,
        dense_vector: Vec<f32>,
        text_query: &str,
        filter: Option<&Map<String, serde_json::Value>>,
        top_k: usize,
        prefetch: usize,
    ) -> Result<HybridResult> {
        let query_filter = filter.map(Self::build_filter).transpose()?;

        let search = SearchPoints {
            collection_name: self.collection.clone(),
            vector: dense_vector,
            limit: prefetch as u64,
            filter: query_filter.clone(),
            with_payload: Some(Self::payload_selector()),
            ..Default::default()
        };

        // 全文 prefetch：text 字段 MatchText 条件与用户过滤取合取
        let mut text_conditions = vec![field_condition(
            "text",
            FieldConditionKind::Match(MatchValue::Text(text_query.to_string())),
        )];
        if let Some(f) = &query_filter {
            text_conditions.extend(f.must.iter().cloned());
        }
        let scroll = ScrollPoints {
            collection_name: self.collection.clone(),
            filter: Some(Filter {
                must: text_conditions,
                ..Default::default()
            }),
            limit: Some(prefetch as u32),
            with_payload: Some(Self::payload_selector()),
            ..Default::default()
        };

        let (dense_resp, lexical_resp) =
            futures::join!(self.client.search_points(search), self.client.scroll(scroll));

        let dense_ranked: Vec<(String, Map<String, serde_json::Value>)> = dense_resp
            .map_err(|e| QaError::VectorStore {
                operation: "search".to_string(),
                message: e.to_string(),
            })?
            .result
            .into_iter()
            .map(|p| (point_id_to_string(p.id.as_ref()), payload_to_json(p.payload)))
            .collect();

        // 词法索引缺失时静默降级；上层负责发 warning 事件
        let (lexical_ranked, lexical_available) = match lexical_resp {
            Ok(resp) => (
                resp.result
                    .into_iter()
                    .map(|p| (point_id_to_string(p.id.as_ref()), payload_to_json(p.payload)))
                    .collect(),
                true,
            ),
            Err(e) => {
                warn!(error = %e, "full-text prefetch failed, falling back to dense-only");
                (Vec::new(), false)
            }
        };

        let hits = self.rrf_fuse(dense_ranked, lexical_ranked, top_k);
        debug!(hits = hits.len(), lexical_available, "hybrid query fused");

        Ok(HybridResult {
            hits,
            lexical_available,
        })
    }

    async fn ensure_text_index(&self) -> Result<()> {
        let indexes: &[(&str, FieldType)] = &[
            ("text", FieldType::Text),
            ("document_id", FieldType::Keyword),
            ("source", FieldType::Keyword),
            ("language", FieldType::Keyword),
            ("file_hash", FieldType::Keyword),
            ("page_number", FieldType::Integer),
            ("chunk_index", FieldType::Integer),
        ];

        for (field, field_type) in indexes {
            let request = CreateFieldIndexCollection {
                collection_name: self.collection.clone(),
                field_name: field.to_string(),
                field_type: Some(*field_type as i32),
                ..Default::default()
            };
            // 已存在的索引报错可忽略
            if let Err(e) = self.client.create_field_index(request).await {
                debug!(field, error = %e, "payload index creation skipped");
            }
        }
        info!(collection = %self.collection, "payload indexes ensured");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await.is_ok()
    }

    async fn collection_info(&self) -> Result<serde_json::Value> {
        let resp = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| QaError::VectorStore {
                operation: "collection_info".to_string(),
                message: e.to_string(),
            })?;
        let info = resp.result.ok_or_else(|| QaError::VectorStore {
            operation: "collection_info".to_string(),
            message: "empty response".to_string(),
        })?;
        Ok(serde_json::json!({
            "name": self.collection,
            "points_count": info.points_count,
            "status": info.status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_for_test() -> QdrantVectorIndex {
        QdrantVectorIndex::new(
            "http://localhost:6334",
            "test".to_string(),
            60.0,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn payload(key: &str, value: &str) -> Map<String, serde_json::Value> {
        let mut m = Map::new();
        m.insert(key.to_string(), serde_json::Value::String(value.into()));
        m
    }

    #[test]
    fn test_rrf_fusion_prefers_agreement() {
        let index = index_for_test();
        let dense = vec![
            ("a".to_string(), payload("text", "A")),
            ("b".to_string(), payload("text", "B")),
        ];
        let lexical = vec![
            ("b".to_string(), payload("text", "B")),
            ("c".to_string(), payload("text", "C")),
        ];
        let fused = index.rrf_fuse(dense, lexical, 10);
        // b 出现在两个列表中，融合分最高
        assert_eq!(fused[0].id, "b");
        assert_eq!(fused.len(), 3);
        let score_b = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - score_b).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_fusion_truncates_to_top_k() {
        let index = index_for_test();
        let dense: Vec<_> = (0..10)
            .map(|i| (format!("d{}", i), Map::new()))
            .collect();
        let fused = index.rrf_fuse(dense, vec![], 3);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].id, "d0");
    }

    #[test]
    fn test_filter_translation() {
        let mut filters = Map::new();
        filters.insert("language".into(), serde_json::Value::String("ru".into()));
        filters.insert(
            "page_number".into(),
            serde_json::json!({ "gte": 2, "lte": 10 }),
        );
        filters.insert(
            "source".into(),
            serde_json::json!(["a.pdf", "b.pdf"]),
        );
        let filter = QdrantVectorIndex::build_filter(&filters).unwrap();
        assert_eq!(filter.must.len(), 3);
    }

    #[test]
    fn test_filter_rejects_empty_range() {
        let mut filters = Map::new();
        filters.insert("page_number".into(), serde_json::json!({}));
        assert!(QdrantVectorIndex::build_filter(&filters).is_err());
    }

    #[test]
    fn test_qdrant_value_conversion() {
        let v = Value {
            kind: Some(Kind::StringValue("hello".into())),
        };
        assert_eq!(qdrant_value_to_json(v), serde_json::json!("hello"));
        let v = Value {
            kind: Some(Kind::IntegerValue(3)),
        };
        assert_eq!(qdrant_value_to_json(v), serde_json::json!(3));
    }
}

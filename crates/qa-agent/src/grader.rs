use crate::prompts::{grading_human, GRADING_SYSTEM};
use once_cell::sync::Lazy;
use qa_core::{retry_with_backoff, BackoffPolicy, Document};
use qa_error::Result;
use qa_llm::{ChatModel, ChatOptions, ChatTurn};
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

/// 打分保留阈值
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// 批量打分结果：所有文档都带打分注记
#[derive(Debug, Clone)]
pub struct GradeOutcome {
    pub documents: Vec<Document>,
    pub kept: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GradeEntry {
    #[serde(default = "missing_doc_id")]
    doc_id: i64,
    #[serde(default)]
    relevant: bool,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reason: String,
}

fn missing_doc_id() -> i64 {
    -1
}

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\[.*?\])\s*```").expect("static pattern"));

/// 容忍 markdown 代码块包裹的 JSON 数组抽取
fn extract_json_array(content: &str) -> Option<&str> {
    let trimmed = content.trim();
    if let Some(captures) = FENCED_JSON.captures(trimmed) {
        return captures.get(1).map(|m| m.as_str());
    }
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end > start {
        Some(&trimmed[start..=end])
    } else {
        None
    }
}

/// 批量 LLM 相关性打分：所有文档一次往返（禁止逐文档循环）
pub struct Grader {
    chat: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl Grader {
    pub fn new(chat: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    #[instrument(skip(self, documents), fields(count = documents.len()))]
    pub async fn grade(&self, query: &str, mut documents: Vec<Document>) -> Result<GradeOutcome> {
        if documents.is_empty() {
            return Ok(GradeOutcome {
                documents,
                kept: 0,
                warnings: Vec::new(),
            });
        }

        let turns = vec![
            ChatTurn::system(GRADING_SYSTEM),
            ChatTurn::user(grading_human(query, &documents)),
        ];
        let opts = ChatOptions {
            temperature: 0.0,
            max_tokens: 2048,
            timeout: self.timeout,
        };

        let completion = retry_with_backoff(BackoffPolicy::default(), "grade_documents", || {
            self.chat.chat(&turns, &opts)
        })
        .await?;

        let mut warnings = Vec::new();

        match extract_json_array(&completion.text)
            .and_then(|raw| serde_json::from_str::<Vec<GradeEntry>>(raw).ok())
        {
            Some(entries) => {
                // 未被模型提及的文档按不相关处理
                for doc in documents.iter_mut() {
                    doc.grading_relevant = Some(false);
                    doc.grading_confidence = Some(0.0);
                    doc.grading_reason = Some("missing".to_string());
                }
                for entry in entries {
                    if entry.doc_id < 0 || entry.doc_id as usize >= documents.len() {
                        warn!(doc_id = entry.doc_id, "grader returned unknown doc_id");
                        continue;
                    }
                    let doc = &mut documents[entry.doc_id as usize];
                    doc.grading_relevant = Some(entry.relevant);
                    doc.grading_confidence = Some(entry.confidence.clamp(0.0, 1.0));
                    doc.grading_reason = Some(entry.reason);
                }
            }
            None => {
                // 解析失败走保召回回退：全部视为相关，置信度 0.5
                warn!("grader output was not valid JSON, keeping all documents");
                warnings.push("grader_parse_failure".to_string());
                for doc in documents.iter_mut() {
                    doc.grading_relevant = Some(true);
                    doc.grading_confidence = Some(0.5);
                    doc.grading_reason = Some("parse_fallback".to_string());
                }
            }
        }

        let kept = documents
            .iter()
            .filter(|d| d.passes_grading(CONFIDENCE_THRESHOLD))
            .count();

        Ok(GradeOutcome {
            documents,
            kept,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qa_error::QaError;
    use qa_llm::ChatCompletion;

    struct ScriptedChat {
        response: String,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn chat(&self, _turns: &[ChatTurn], _opts: &ChatOptions) -> Result<ChatCompletion> {
            Ok(ChatCompletion {
                text: self.response.clone(),
                input_tokens: 100,
                output_tokens: 50,
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct DownChat;

    #[async_trait]
    impl ChatModel for DownChat {
        async fn chat(&self, _turns: &[ChatTurn], _opts: &ChatOptions) -> Result<ChatCompletion> {
            Err(QaError::LlmService {
                provider: "test".into(),
                message: "unavailable".into(),
                retry_after: None,
            })
        }

        fn model_name(&self) -> &str {
            "down"
        }
    }

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| Document::new(format!("d{}", i), format!("document {}", i)))
            .collect()
    }

    fn grader(response: &str) -> Grader {
        Grader::new(
            Arc::new(ScriptedChat {
                response: response.to_string(),
            }),
            Duration::from_secs(120),
        )
    }

    #[tokio::test]
    async fn test_plain_json_array() {
        let g = grader(
            r#"[{"doc_id": 0, "relevant": true, "confidence": 0.9, "reason": "direct answer"},
                {"doc_id": 1, "relevant": false, "confidence": 0.8, "reason": "off-topic"}]"#,
        );
        let out = g.grade("q", docs(2)).await.unwrap();
        assert_eq!(out.kept, 1);
        assert_eq!(out.documents[0].grading_relevant, Some(true));
        assert_eq!(out.documents[1].grading_relevant, Some(false));
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_markdown_fenced_json() {
        let g = grader(
            "Here are the grades:\n```json\n[{\"doc_id\": 0, \"relevant\": true, \"confidence\": 0.7, \"reason\": \"ok\"}]\n```",
        );
        let out = g.grade("q", docs(1)).await.unwrap();
        assert_eq!(out.kept, 1);
    }

    #[tokio::test]
    async fn test_missing_doc_ids_default_irrelevant() {
        let g = grader(r#"[{"doc_id": 0, "relevant": true, "confidence": 0.9, "reason": "ok"}]"#);
        let out = g.grade("q", docs(3)).await.unwrap();
        assert_eq!(out.kept, 1);
        assert_eq!(out.documents[1].grading_relevant, Some(false));
        assert_eq!(out.documents[1].grading_reason.as_deref(), Some("missing"));
        assert_eq!(out.documents[2].grading_confidence, Some(0.0));
    }

    #[tokio::test]
    async fn test_out_of_range_doc_id_ignored() {
        let g = grader(r#"[{"doc_id": 9, "relevant": true, "confidence": 0.9, "reason": "ok"}]"#);
        let out = g.grade("q", docs(2)).await.unwrap();
        assert_eq!(out.kept, 0);
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_all() {
        let g = grader("The documents look relevant to me overall.");
        let out = g.grade("q", docs(3)).await.unwrap();
        assert_eq!(out.kept, 3);
        assert!(out.warnings.contains(&"grader_parse_failure".to_string()));
        for doc in &out.documents {
            assert_eq!(doc.grading_relevant, Some(true));
            assert_eq!(doc.grading_confidence, Some(0.5));
        }
    }

    #[tokio::test]
    async fn test_confidence_below_threshold_filtered() {
        let g = grader(
            r#"[{"doc_id": 0, "relevant": true, "confidence": 0.4, "reason": "weak match"}]"#,
        );
        let out = g.grade("q", docs(1)).await.unwrap();
        assert_eq!(out.kept, 0);
    }

    #[tokio::test]
    async fn test_empty_documents_no_llm_call() {
        let g = Grader::new(Arc::new(DownChat), Duration::from_secs(1));
        let out = g.grade("q", vec![]).await.unwrap();
        assert_eq!(out.kept, 0);
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let g = Grader::new(Arc::new(DownChat), Duration::from_secs(1));
        let err = g.grade("q", docs(1)).await.unwrap_err();
        assert_eq!(err.category(), "llm_unavailable");
    }

    #[test]
    fn test_extract_json_array_variants() {
        assert!(extract_json_array("[]").is_some());
        assert!(extract_json_array("prefix [1, 2] suffix").is_some());
        assert!(extract_json_array("```json\n[1]\n```").is_some());
        assert!(extract_json_array("no json here").is_none());
    }
}

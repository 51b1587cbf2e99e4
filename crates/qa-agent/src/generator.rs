use crate::budget::{estimate_tokens, fit_documents_to_budget};
use crate::guardrails::{validate_output, OutputValidation};
use crate::prompts::{build_system_prompt, length_hint, sources_message};
use qa_core::{
    retry_with_backoff, BackoffPolicy, ChatRole, ContextMetadata, Document, Language,
    RuntimeContext, StoredMessage,
};
use qa_error::Result;
use qa_llm::{ChatModel, ChatOptions, ChatTurn};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// 生成结果与完整观测元数据
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub answer: String,
    pub validation: OutputValidation,
    pub metadata: ContextMetadata,
}

/// 动态提示回答合成
pub struct Generator {
    chat: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl Generator {
    pub fn new(chat: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, documents, history, runtime_context), fields(docs = documents.len()))]
    pub async fn generate(
        &self,
        query: &str,
        documents: &[Document],
        history: &[StoredMessage],
        runtime_context: &RuntimeContext,
        language: Language,
        documents_retrieved: u32,
        strict: bool,
    ) -> Result<GenerationOutcome> {
        let mut system_prompt = build_system_prompt(query, documents, runtime_context, language);
        if let Some(hint) = length_hint(runtime_context.max_response_length) {
            system_prompt.push(' ');
            system_prompt.push_str(&hint);
        }

        let packed = fit_documents_to_budget(
            documents,
            query,
            history,
            self.chat.model_name(),
            &system_prompt,
        );

        let mut turns = Vec::with_capacity(history.len() + 3);
        turns.push(ChatTurn::system(&system_prompt));
        for message in history {
            turns.push(match message.role {
                ChatRole::User => ChatTurn::user(&message.text),
                ChatRole::Assistant => ChatTurn::assistant(&message.text),
            });
        }
        turns.push(ChatTurn::user(query));
        if !packed.context.is_empty() {
            turns.push(ChatTurn::user(sources_message(&packed.context)));
        }

        let opts = ChatOptions {
            temperature: 0.2,
            max_tokens: 4096,
            timeout: self.timeout,
        };

        let completion = retry_with_backoff(BackoffPolicy::default(), "generate_answer", || {
            self.chat.chat(&turns, &opts)
        })
        .await?;

        // 重叠度按实际打包进上下文的文档计算
        let included = &documents[..packed.metadata.documents_included as usize];
        let validation = validate_output(
            &completion.text,
            included,
            runtime_context.enable_citations,
            strict,
        )?;

        let tokens_output = if completion.output_tokens > 0 {
            completion.output_tokens
        } else {
            estimate_tokens(&completion.text)
        };
        let tokens_input = if completion.input_tokens > 0 {
            completion.input_tokens
        } else {
            packed.metadata.tokens_input
        };

        let mut warnings = Vec::new();
        if packed.metadata.truncated {
            warnings.push("truncated".to_string());
        }
        warnings.extend(validation.warnings.clone());

        let metadata = ContextMetadata {
            model_name: self.chat.model_name().to_string(),
            context_window: packed.metadata.context_window,
            tokens_input,
            tokens_output,
            tokens_reserved: packed.metadata.tokens_reserved,
            context_usage_percent: packed.metadata.context_usage_percent,
            documents_retrieved,
            documents_included: packed.metadata.documents_included,
            confidence_score: validation.confidence,
            has_citations: validation.has_citations,
            is_generic: validation.is_generic,
            validation_passed: validation.validation_passed,
            warnings,
        };

        Ok(GenerationOutcome {
            answer: validation.response.clone(),
            validation,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qa_llm::ChatCompletion;
    use std::sync::Mutex;

    struct RecordingChat {
        response: String,
        model: String,
        turns_seen: Mutex<Vec<Vec<ChatTurn>>>,
    }

    impl RecordingChat {
        fn new(response: &str, model: &str) -> Self {
            Self {
                response: response.to_string(),
                model: model.to_string(),
                turns_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for RecordingChat {
        async fn chat(&self, turns: &[ChatTurn], _opts: &ChatOptions) -> Result<ChatCompletion> {
            self.turns_seen.lock().unwrap().push(turns.to_vec());
            Ok(ChatCompletion {
                text: self.response.clone(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }

        fn model_name(&self) -> &str {
            &self.model
        }
    }

    fn doc(id: &str, text: &str) -> Document {
        Document::new(id, text)
    }

    #[tokio::test]
    async fn test_message_layout() {
        let chat = Arc::new(RecordingChat::new(
            "Retrieval-augmented generation combines retrieval and generation. [1]",
            "claude-sonnet-4",
        ));
        let generator = Generator::new(chat.clone(), Duration::from_secs(180));
        let history = vec![
            StoredMessage::user("What is RAG?"),
            StoredMessage::assistant("A retrieval pipeline."),
        ];
        let docs = vec![doc("a", "retrieval augmented generation combines retrieval with generation")];
        generator
            .generate(
                "Give an example.",
                &docs,
                &history,
                &RuntimeContext::default(),
                Language::En,
                1,
                false,
            )
            .await
            .unwrap();

        let seen = chat.turns_seen.lock().unwrap();
        let turns = &seen[0];
        // [system, history user, history assistant, user(query), user(sources)]
        assert_eq!(turns.len(), 5);
        assert_eq!(turns[0].role, qa_llm::TurnRole::System);
        assert_eq!(turns[1].content, "What is RAG?");
        assert_eq!(turns[2].role, qa_llm::TurnRole::Assistant);
        assert_eq!(turns[3].content, "Give an example.");
        assert!(turns[4].content.starts_with("Context documents:"));
    }

    #[tokio::test]
    async fn test_metadata_populated() {
        let chat = Arc::new(RecordingChat::new(
            "Employees receive twenty four days of annual leave according to page 3.",
            "gpt-4o",
        ));
        let generator = Generator::new(chat, Duration::from_secs(180));
        let docs = vec![doc(
            "a",
            "Employees receive twenty four days of annual leave each calendar year",
        )];
        let out = generator
            .generate(
                "How many days of leave?",
                &docs,
                &[],
                &RuntimeContext::default(),
                Language::En,
                7,
                false,
            )
            .await
            .unwrap();

        assert_eq!(out.metadata.model_name, "gpt-4o");
        assert_eq!(out.metadata.context_window, 128_000);
        assert_eq!(out.metadata.documents_retrieved, 7);
        assert_eq!(out.metadata.documents_included, 1);
        assert!(out.metadata.confidence_score >= 0.6);
        assert!(out.metadata.has_citations);
        assert!(out.metadata.tokens_output > 0);
        assert!(out.metadata.context_usage_percent <= 100.0);
    }

    #[tokio::test]
    async fn test_citations_disabled_in_metadata() {
        let chat = Arc::new(RecordingChat::new(
            "Employees receive twenty four days of annual leave according to page 3.",
            "gpt-4o",
        ));
        let generator = Generator::new(chat, Duration::from_secs(180));
        let docs = vec![doc("a", "Employees receive twenty four days of annual leave")];
        let mut ctx = RuntimeContext::default();
        ctx.enable_citations = false;
        let out = generator
            .generate("q", &docs, &[], &ctx, Language::En, 1, false)
            .await
            .unwrap();
        assert!(!out.metadata.has_citations);
    }

    #[tokio::test]
    async fn test_empty_documents_still_generates() {
        let chat = Arc::new(RecordingChat::new(
            "I could not find relevant information in the corpus.",
            "gpt-4o",
        ));
        let generator = Generator::new(chat.clone(), Duration::from_secs(180));
        let out = generator
            .generate(
                "q",
                &[],
                &[],
                &RuntimeContext::default(),
                Language::En,
                0,
                false,
            )
            .await
            .unwrap();
        // 无来源时不追加 sources 轮
        let seen = chat.turns_seen.lock().unwrap();
        assert_eq!(seen[0].len(), 2);
        assert_eq!(out.metadata.documents_included, 0);
        // 无文档 → 中性置信度
        assert!((out.metadata.confidence_score - 0.5).abs() < 1e-6);
    }
}

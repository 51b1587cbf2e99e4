use crate::prompts::{rewrite_human, REWRITE_SYSTEM};
use qa_core::{retry_with_backoff, BackoffPolicy};
use qa_error::Result;
use qa_llm::{ChatModel, ChatOptions, ChatTurn};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// 改写结果；校验不通过时退回原查询
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub query: String,
    pub changed: bool,
}

/// 打分失败后的 LLM 查询改写
pub struct Rewriter {
    chat: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl Rewriter {
    pub fn new(chat: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { chat, timeout }
    }

    /// 校验改写：非空、不超过原查询两倍长度、与原查询不同
    fn validate(original: &str, rewritten: &str) -> bool {
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return false;
        }
        if rewritten.chars().count() > original.chars().count() * 2 {
            return false;
        }
        if rewritten.eq_ignore_ascii_case(original.trim()) {
            return false;
        }
        true
    }

    #[instrument(skip(self), fields(query_len = query.len()))]
    pub async fn rewrite(&self, query: &str) -> Result<RewriteOutcome> {
        let turns = vec![
            ChatTurn::system(REWRITE_SYSTEM),
            ChatTurn::user(rewrite_human(query)),
        ];
        let opts = ChatOptions {
            temperature: 0.3,
            max_tokens: 256,
            timeout: self.timeout,
        };

        let completion = retry_with_backoff(BackoffPolicy::default(), "rewrite_query", || {
            self.chat.chat(&turns, &opts)
        })
        .await?;

        let candidate = completion
            .text
            .trim()
            .trim_matches('"')
            .trim()
            .to_string();

        if Self::validate(query, &candidate) {
            debug!(rewritten = %candidate, "query rewritten");
            Ok(RewriteOutcome {
                query: candidate,
                changed: true,
            })
        } else {
            debug!("rewrite rejected by validation, keeping original query");
            Ok(RewriteOutcome {
                query: query.to_string(),
                changed: false,
            })
        }
    }
}

use qa_core::{Document, StoredMessage};
use tracing::debug;

/// 截断后文档保留的最小 token 数
pub const MIN_DOC_TOKENS: u32 = 128;

/// 提示模板开销的固定预留
const TEMPLATE_OVERHEAD: u32 = 200;

// 各模型族的上下文窗口与输出预留
const CONTEXT_WINDOWS: &[(&str, u32)] = &[
    ("claude", 200_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("llama3.1", 128_000),
    ("llama-3.1", 128_000),
];

pub const RESERVE_OUTPUT: u32 = 4_000;

/// 按模型名前缀匹配上下文窗口；未知模型取保守默认值
pub fn context_window(model_name: &str) -> u32 {
    let lower = model_name.to_lowercase();
    for (key, window) in CONTEXT_WINDOWS {
        if lower.contains(key) {
            return *window;
        }
    }
    8_000
}

/// 轻量 token 估算：约 4 字符一个 token。
/// 不要求精确，但打包结果不得超过声明的窗口。
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32 / 4).max(1)
}

/// 打包结果的观测元数据
#[derive(Debug, Clone, Default)]
pub struct PackMetadata {
    pub documents_total: u32,
    pub documents_included: u32,
    pub documents_total_tokens: u32,
    pub tokens_input: u32,
    pub tokens_reserved: u32,
    pub context_window: u32,
    pub context_usage_percent: f32,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct PackedContext {
    pub context: String,
    pub metadata: PackMetadata,
}

/// 在句子边界截断到 max_chars 个字符以内
fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let head: String = chars[..max_chars].iter().collect();
    let boundary = head
        .rfind(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .filter(|idx| *idx > max_chars * 2 / 5);
    match boundary {
        Some(idx) => head[..=idx].to_string(),
        None => head,
    }
}

fn format_document(index: usize, doc: &Document) -> String {
    match doc.page_number() {
        Some(page) => format!("[{}] (page {}): {}", index + 1, page, doc.text),
        None => format!("[{}]: {}", index + 1, doc.text),
    }
}

/// 按打分顺序把文档装进模型预算：
/// 整篇能装则装；剩余预算不低于 MIN_DOC_TOKENS 时装句界截断的前缀；否则停止。
pub fn fit_documents_to_budget(
    documents: &[Document],
    query: &str,
    history: &[StoredMessage],
    model_name: &str,
    system_prompt: &str,
) -> PackedContext {
    let window = context_window(model_name);
    let budget = window.saturating_sub(RESERVE_OUTPUT);

    let system_tokens = estimate_tokens(system_prompt);
    let query_tokens = estimate_tokens(query);
    let history_tokens: u32 = history.iter().map(|m| estimate_tokens(&m.text)).sum();
    let fixed = system_tokens + query_tokens + history_tokens + TEMPLATE_OVERHEAD;

    let available_for_docs = budget.saturating_sub(fixed);

    let mut parts: Vec<String> = Vec::new();
    let mut used: u32 = 0;
    let mut included: u32 = 0;
    let mut truncated = false;

    for doc in documents {
        let formatted = format_document(included as usize, doc);
        let doc_tokens = estimate_tokens(&formatted);
        let remaining = available_for_docs.saturating_sub(used);

        if doc_tokens <= remaining {
            used += doc_tokens;
            parts.push(formatted);
            included += 1;
        } else if remaining >= MIN_DOC_TOKENS {
            let prefix = truncate_at_sentence(&formatted, remaining as usize * 4);
            used += estimate_tokens(&prefix);
            parts.push(prefix);
            included += 1;
            truncated = true;
            break;
        } else {
            truncated = true;
            break;
        }
    }

    if included < documents.len() as u32 {
        truncated = true;
    }

    let tokens_input = fixed + used;
    let usage = if budget > 0 {
        (tokens_input as f32 / budget as f32 * 100.0).min(100.0)
    } else {
        100.0
    };

    debug!(
        model = model_name,
        window,
        included,
        total = documents.len(),
        tokens_input,
        "context packed"
    );

    PackedContext {
        context: parts.join("\n\n"),
        metadata: PackMetadata {
            documents_total: documents.len() as u32,
            documents_included: included,
            documents_total_tokens: used,
            tokens_input,
            tokens_reserved: RESERVE_OUTPUT,
            context_window: window,
            context_usage_percent: usage,
            truncated,
        },
    }
}

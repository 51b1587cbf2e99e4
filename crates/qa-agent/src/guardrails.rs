use once_cell::sync::Lazy;
use qa_core::Document;
use qa_error::{QaError, Result};
use regex::Regex;

/// 输入校验结果
#[derive(Debug, Clone)]
pub struct InputValidation {
    pub masked_query: String,
    pub warnings: Vec<String>,
}

/// 输出校验结果
#[derive(Debug, Clone)]
pub struct OutputValidation {
    pub response: String,
    pub confidence: f32,
    pub has_citations: bool,
    pub is_generic: bool,
    pub validation_passed: bool,
    pub warnings: Vec<String>,
}

// 提示注入黑名单（大小写不敏感）
static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 指令覆盖
        r"(?i)ignore\s+(all\s+)?(previous|above|prior)\s+(instructions|prompts|commands)",
        r"(?i)disregard\s+(all\s+)?(previous|above|prior)",
        r"(?i)forget\s+(all\s+)?(previous|above|prior)",
        r"(?i)new\s+instructions?:",
        r"(?i)^\s*system\s*:",
        r"(?i)^\s*assistant\s*:",
        r"(?i)###\s*instruction",
        // 角色操控
        r"(?i)you\s+are\s+now",
        r"(?i)pretend\s+to\s+be",
        r"(?i)roleplay\s+as",
        // 越狱标记
        r"(?i)jailbreak",
        r"(?i)\bdan\s+mode\b",
        r"(?i)developer\s+mode",
        // 套取系统提示
        r"(?i)what\s+(are|is)\s+your\s+(system\s+)?(prompt|instructions)",
        r"(?i)show\s+me\s+your\s+(system\s+)?(prompt|instructions)",
        r"(?i)repeat\s+(your\s+)?(system\s+)?(prompt|instructions)",
        r"(?i)reveal\s+the\s+(system\s+)?prompt",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

// PII 掩码表：模式 -> 类型化替换符。基线集合，可按部署扩展。
static PII_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            "<EMAIL>",
        ),
        // 国际格式电话
        (r"\+\d{1,3}[\s-]?\(?\d{2,4}\)?[\s-]?\d{3}[\s-]?\d{2}[\s-]?\d{2,4}", "<PHONE>"),
        (r"\b\d{3}[-.]\d{3}[-.]\d{4}\b", "<PHONE>"),
        (r"\(\d{3}\)\s?\d{3}[-.]?\d{4}", "<PHONE>"),
        // 美式 SSN 形态的证件号
        (r"\b\d{3}-\d{2}-\d{4}\b", "<ID>"),
        // IPv4
        (r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "<IP>"),
    ]
    .iter()
    .map(|(p, token)| (Regex::new(p).expect("static pattern"), *token))
    .collect()
});

// 卡号候选：13-19 位数字（允许空格/连字符分隔），Luhn 校验通过才掩码
static CARD_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){13,19}\b").expect("static pattern"));

// 长度受限的政府证件号数字串
static GOV_ID_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{9,14}\b").expect("static pattern"));

// 恶意内容：SQL 片段与 shell 元字符簇（告警不拦截）
static MALICIOUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i);\s*drop\s+table",
        r"(?i);\s*delete\s+from",
        r"(?i)union\s+select",
        r"(?i)'\s*or\s*'1'\s*=\s*'1",
        r";\s*rm\s+-rf",
        r"&&\s*rm\s+",
        r"\|\s*bash",
        r"`[^`]+`",
        r"\$\([^)]+\)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

// 输出泄露：系统提示回显与密钥形态 token
static LEAKAGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)system\s+prompt",
        r"(?i)my\s+instructions\s+(are|were)",
        r"(?i)i\s+was\s+told\s+to",
        r"(?i)api[\s_-]?key",
        r"(?i)secret[\s_-]?key",
        r"sk-[A-Za-z0-9_-]{16,}",
        r"(?i)bearer\s+[A-Za-z0-9._-]{16,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

// 模板化拒答的检测子串
static GENERIC_PATTERNS: &[&str] = &[
    "i don't know",
    "i cannot answer",
    "no information",
    "not enough information",
    "unable to answer",
    "i don't have",
];

// 引用标记
static CITATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\[\d+\]",
        r"(?i)\(page \d+\)",
        r"(?i)\(pages \d+-\d+\)",
        r"(?i)according to",
        r"(?i)as stated in",
        r"(?i)page \d+",
        r"(?i)согласно",
        r"(?i)страниц",
        r"(?i)sahifa",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

fn luhn_valid(digits: &[u32]) -> bool {
    if digits.len() < 13 {
        return false;
    }
    let mut sum = 0u32;
    for (i, d) in digits.iter().rev().enumerate() {
        let mut v = *d;
        if i % 2 == 1 {
            v *= 2;
            if v > 9 {
                v -= 9;
            }
        }
        sum += v;
    }
    sum % 10 == 0
}

/// PII 掩码。幂等：已掩码文本再跑一遍是 no-op。
pub fn mask_pii(text: &str) -> (bool, String) {
    let mut masked = text.to_string();
    let mut found = false;

    // 先掩卡号（Luhn 通过者），避免被电话/证件模式截断
    let mut card_masked = String::with_capacity(masked.len());
    let mut last = 0;
    for m in CARD_CANDIDATE.find_iter(&masked) {
        let digits: Vec<u32> = m.as_str().chars().filter_map(|c| c.to_digit(10)).collect();
        if luhn_valid(&digits) {
            card_masked.push_str(&masked[last..m.start()]);
            card_masked.push_str("<CARD>");
            last = m.end();
            found = true;
        }
    }
    if found {
        card_masked.push_str(&masked[last..]);
        masked = card_masked;
    }

    for (pattern, token) in PII_PATTERNS.iter() {
        if pattern.is_match(&masked) {
            masked = pattern.replace_all(&masked, *token).to_string();
            found = true;
        }
    }

    // 裸数字证件号最后掩，避免吞掉上面结构化形态
    if GOV_ID_CANDIDATE.is_match(&masked) {
        masked = GOV_ID_CANDIDATE.replace_all(&masked, "<ID>").to_string();
        found = true;
    }

    (found, masked)
}

pub fn detect_prompt_injection(text: &str) -> bool {
    INJECTION_PATTERNS.iter().any(|p| p.is_match(text))
}

pub fn detect_malicious_patterns(text: &str) -> bool {
    MALICIOUS_PATTERNS.iter().any(|p| p.is_match(text))
}

pub fn detect_leakage(text: &str) -> bool {
    LEAKAGE_PATTERNS.iter().any(|p| p.is_match(text))
}

/// 输入守卫：长度、注入、PII 掩码、恶意内容
///
/// 注入与超长直接拒绝；PII 与恶意内容仅掩码/告警。
pub fn validate_input(query: &str, max_length: usize) -> Result<InputValidation> {
    let trimmed = query.trim();

    if trimmed.is_empty() {
        return Err(QaError::GuardrailInput {
            reason: "empty".to_string(),
        });
    }

    if trimmed.chars().count() > max_length {
        return Err(QaError::GuardrailInput {
            reason: format!(
                "query too long: {} chars (max {})",
                trimmed.chars().count(),
                max_length
            ),
        });
    }

    if detect_prompt_injection(trimmed) {
        return Err(QaError::GuardrailInput {
            reason: "injection".to_string(),
        });
    }

    let mut warnings = Vec::new();

    let (pii_found, masked_query) = mask_pii(trimmed);
    if pii_found {
        warnings.push("pii_masked".to_string());
    }

    if detect_malicious_patterns(trimmed) {
        warnings.push("malicious_pattern".to_string());
    }

    Ok(InputValidation {
        masked_query,
        warnings,
    })
}

/// 词重叠接地置信度：回答中长度>=4 的词落在来源文档中的占比，
/// 0.30 重叠线性映射到 0.70 置信度，截断到 [0,1]。
pub fn grounding_confidence(response: &str, documents: &[Document]) -> f32 {
    if documents.is_empty() {
        return 0.5;
    }

    let words = |text: &str| -> std::collections::HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 4)
            .map(|w| w.to_string())
            .collect()
    };

    let response_words = words(response);
    if response_words.is_empty() {
        return 0.0;
    }

    let doc_text: String = documents
        .iter()
        .map(|d| d.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let doc_words = words(&doc_text);
    if doc_words.is_empty() {
        return 0.0;
    }

    let overlap = response_words.intersection(&doc_words).count() as f32;
    let ratio = overlap / response_words.len() as f32;

    (ratio * (0.70 / 0.30)).clamp(0.0, 1.0)
}

pub fn is_generic_response(response: &str) -> bool {
    let lower = response.to_lowercase();
    GENERIC_PATTERNS.iter().any(|p| lower.contains(p))
}

pub fn has_citations(response: &str) -> bool {
    CITATION_PATTERNS.iter().any(|p| p.is_match(response))
}

/// 输出守卫：PII 复掩、泄露剔除、接地置信度、模板化拒答与引用检测
///
/// strict 模式下置信度过低或泄露无法清理时拒绝；默认仅降级并告警。
pub fn validate_output(
    response: &str,
    documents: &[Document],
    enable_citations: bool,
    strict: bool,
) -> Result<OutputValidation> {
    let mut warnings = Vec::new();
    let mut validation_passed = true;

    let (pii_found, mut cleaned) = mask_pii(response);
    if pii_found {
        warnings.push("pii_masked_in_response".to_string());
    }

    if detect_leakage(&cleaned) {
        if strict {
            return Err(QaError::GuardrailOutput {
                reason: "leakage".to_string(),
            });
        }
        // 逐条剔除泄露片段
        for pattern in LEAKAGE_PATTERNS.iter() {
            cleaned = pattern.replace_all(&cleaned, "<REDACTED>").to_string();
        }
        warnings.push("leakage_redacted".to_string());
        validation_passed = false;
    }

    let confidence = grounding_confidence(&cleaned, documents);
    if confidence < 0.3 {
        if strict {
            return Err(QaError::GuardrailOutput {
                reason: "low_confidence".to_string(),
            });
        }
        warnings.push("low_grounding_confidence".to_string());
    }

    let is_generic = is_generic_response(&cleaned);
    if is_generic {
        warnings.push("generic_response".to_string());
    }

    let cited = enable_citations && has_citations(&cleaned);

    if cleaned.trim().chars().count() < 10 {
        warnings.push("response_too_short".to_string());
        validation_passed = false;
    }

    Ok(OutputValidation {
        response: cleaned,
        confidence,
        has_citations: cited,
        is_generic,
        validation_passed,
        warnings,
    })
}

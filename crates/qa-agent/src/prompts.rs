use qa_core::{Document, ExpertiseLevel, Language, ResponseStyle, RuntimeContext};

/// 查询类型，用于自适应回答格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Definition,
    Comparison,
    HowTo,
    List,
    Analytical,
    Factual,
}

/// 关键词启发式查询分类
pub fn detect_query_class(query: &str) -> QueryClass {
    let lower = query.to_lowercase();

    let contains_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if contains_any(&["what is", "what are", "define", "meaning of", "что такое", "nima"]) {
        return QueryClass::Definition;
    }
    if contains_any(&[
        "compare",
        "difference between",
        " vs ",
        "versus",
        "разница",
        "сравн",
        "farqi",
    ]) {
        return QueryClass::Comparison;
    }
    if contains_any(&["how to", "how do", "how can", "steps to", "как ", "qanday"]) {
        return QueryClass::HowTo;
    }
    if contains_any(&["list", "enumerate", "give me all", "перечисл", "ro'yxat"]) {
        return QueryClass::List;
    }
    if contains_any(&["why", "analyze", "explain why", "почему", "nega", "sababi"]) {
        return QueryClass::Analytical;
    }
    QueryClass::Factual
}

fn base_prompt(lang: Language) -> &'static str {
    match lang {
        Language::Ru => "Вы полезный многоязычный ассистент по корпоративным документам.",
        Language::Uz => "Siz korporativ hujjatlar bo'yicha foydali ko'p tilli yordamchisiz.",
        _ => "You are a helpful multilingual assistant for a private document corpus.",
    }
}

fn class_instruction(lang: Language, class: QueryClass) -> &'static str {
    match (lang, class) {
        (Language::Ru, QueryClass::Definition) => {
            "Дайте четкое, краткое определение с последующими деталями."
        }
        (Language::Ru, QueryClass::Comparison) => {
            "Представьте сбалансированное сравнение с ключевыми различиями и сходствами."
        }
        (Language::Ru, QueryClass::HowTo) => {
            "Предоставьте пошаговые инструкции в виде нумерованного списка."
        }
        (Language::Ru, QueryClass::List) => {
            "Представьте информацию в виде маркированного или нумерованного списка."
        }
        (Language::Ru, QueryClass::Analytical) => {
            "Предоставьте детальный анализ с подтверждающими доказательствами из источников."
        }
        (Language::Ru, QueryClass::Factual) => {
            "Предоставьте точную, фактическую информацию, непосредственно отвечающую на вопрос."
        }
        (Language::Uz, QueryClass::Definition) => {
            "Aniq, qisqa ta'rif bering va keyin tafsilotlarni qo'shing."
        }
        (Language::Uz, QueryClass::Comparison) => {
            "Asosiy farqlar va o'xshashliklar bilan muvozanatli taqqoslash bering."
        }
        (Language::Uz, QueryClass::HowTo) => {
            "Raqamlangan ro'yxat shaklida qadam-baqadam ko'rsatmalar bering."
        }
        (Language::Uz, QueryClass::List) => {
            "Ma'lumotni belgilangan yoki raqamlangan ro'yxat sifatida taqdim eting."
        }
        (Language::Uz, QueryClass::Analytical) => {
            "Manbalardan dalillar bilan batafsil tahlil bering."
        }
        (Language::Uz, QueryClass::Factual) => {
            "Savolga to'g'ridan-to'g'ri javob beradigan aniq ma'lumot bering."
        }
        (_, QueryClass::Definition) => {
            "Provide a clear, concise definition followed by relevant details."
        }
        (_, QueryClass::Comparison) => {
            "Present a balanced comparison with key differences and similarities."
        }
        (_, QueryClass::HowTo) => {
            "Provide step-by-step instructions in a numbered list format."
        }
        (_, QueryClass::List) => "Present the information as a bulleted or numbered list.",
        (_, QueryClass::Analytical) => {
            "Provide a detailed analysis with supporting evidence from the sources."
        }
        (_, QueryClass::Factual) => {
            "Provide accurate, factual information directly answering the question."
        }
    }
}

fn expertise_instruction(lang: Language, level: ExpertiseLevel) -> Option<&'static str> {
    match (lang, level) {
        (Language::Ru, ExpertiseLevel::Expert) => Some(
            "Предоставляйте технические, подробные ответы со специализированной терминологией.",
        ),
        (Language::Ru, ExpertiseLevel::Beginner) => {
            Some("Объясняйте просто, избегайте жаргона и используйте понятные примеры.")
        }
        (Language::Uz, ExpertiseLevel::Expert) => Some(
            "Texnik, batafsil javoblar bering va maxsus terminologiyadan foydalaning.",
        ),
        (Language::Uz, ExpertiseLevel::Beginner) => Some(
            "Sodda tushuntiring, murakkab atamalardan qoching va aniq misollar keltiring.",
        ),
        (_, ExpertiseLevel::Expert) => {
            Some("Provide technical, detailed responses with domain-specific terminology.")
        }
        (_, ExpertiseLevel::Beginner) => {
            Some("Explain simply, avoid jargon, and use clear examples.")
        }
        _ => None,
    }
}

fn grounding_instruction(lang: Language) -> &'static str {
    match lang {
        Language::Ru => {
            "Отвечайте ТОЛЬКО на основе предоставленных контекстных документов. \
             Если контекста недостаточно, укажите это."
        }
        Language::Uz => {
            "FAQAT taqdim etilgan kontekst hujjatlari asosida javob bering. \
             Agar kontekst yetarli bo'lmasa, buni ayting."
        }
        _ => {
            "Answer based ONLY on the provided context documents. \
             If the context doesn't contain enough information, say so."
        }
    }
}

fn citation_instruction(lang: Language) -> &'static str {
    match lang {
        Language::Ru => {
            "Указывайте источник и страницу, когда они доступны (например, 'согласно странице 3...')."
        }
        Language::Uz => {
            "Mavjud bo'lganda manba va sahifani ko'rsating (masalan, '3-sahifaga ko'ra...')."
        }
        _ => "Cite the source and page when available (e.g., 'according to page 3...').",
    }
}

fn style_instruction(lang: Language, style: ResponseStyle) -> Option<&'static str> {
    match (lang, style) {
        (Language::Ru, ResponseStyle::Concise) => Some("Давайте краткие и точные ответы."),
        (Language::Ru, ResponseStyle::Detailed) => {
            Some("Предоставляйте всесторонние, подробные объяснения.")
        }
        (Language::Uz, ResponseStyle::Concise) => Some("Javoblarni qisqa va aniq bering."),
        (Language::Uz, ResponseStyle::Detailed) => {
            Some("Keng qamrovli, batafsil tushuntirishlar bering.")
        }
        (_, ResponseStyle::Concise) => Some("Keep responses brief and to the point."),
        (_, ResponseStyle::Detailed) => Some("Provide comprehensive, detailed explanations."),
        _ => None,
    }
}

fn language_instruction(lang: Language) -> &'static str {
    match lang {
        Language::Ru => "Отвечайте на русском языке.",
        Language::Uz => "O'zbek tilida javob bering.",
        _ => "Respond in English.",
    }
}

/// 提示工厂：语言 × 查询类型 × 专业程度 × 风格的单一组装点
///
/// 文档若全部为 PDF 来源，附加页码引用要求。
pub fn build_system_prompt(
    query: &str,
    documents: &[Document],
    runtime_context: &RuntimeContext,
    language: Language,
) -> String {
    let lang = language.or_english();
    let class = detect_query_class(query);

    let mut parts: Vec<&str> = vec![base_prompt(lang)];

    if let Some(instruction) = expertise_instruction(lang, runtime_context.expertise_level) {
        parts.push(instruction);
    }

    parts.push(class_instruction(lang, class));
    parts.push(grounding_instruction(lang));

    if runtime_context.enable_citations {
        parts.push(citation_instruction(lang));
    }

    if let Some(instruction) = style_instruction(lang, runtime_context.response_style) {
        parts.push(instruction);
    }

    let all_pdf = !documents.is_empty()
        && documents
            .iter()
            .all(|d| d.source().map(|s| s.ends_with(".pdf")).unwrap_or(false));
    if all_pdf {
        parts.push(match lang {
            Language::Ru => "Вы анализируете документы PDF. Указывайте точные номера страниц.",
            Language::Uz => "Siz PDF hujjatlarni tahlil qilyapsiz. Aniq sahifa raqamlarini bering.",
            _ => "You are analyzing PDF documents. Provide precise page numbers.",
        });
    }

    parts.push(language_instruction(lang));

    parts.join(" ")
}

/// 最大回答长度限制（字符数提示）
pub fn length_hint(max_response_length: Option<u32>) -> Option<String> {
    max_response_length.map(|n| format!("Keep the answer under {} characters.", n))
}

// --- 批量打分提示 ---

pub const GRADING_SYSTEM: &str = "You are a relevance grader for a document question-answering \
assistant. Given a user's question and multiple retrieved documents, determine which documents \
contain information relevant to answering the question.\n\n\
For each document, provide:\n\
1. Whether it is relevant (true/false)\n\
2. Confidence score (0.0 to 1.0)\n\
3. Brief reason for the decision\n\n\
Respond with a JSON array in this exact format:\n\
[\n  {\"doc_id\": 0, \"relevant\": true, \"confidence\": 0.95, \"reason\": \"Contains direct answer\"},\n\
  {\"doc_id\": 1, \"relevant\": false, \"confidence\": 0.8, \"reason\": \"Unrelated topic\"}\n]";

/// 打分用文档预览截断长度
pub const GRADING_PREVIEW_CHARS: usize = 500;

pub fn grading_human(query: &str, documents: &[Document]) -> String {
    let mut doc_list = Vec::with_capacity(documents.len());
    for (i, doc) in documents.iter().enumerate() {
        let preview: String = if doc.text.chars().count() > GRADING_PREVIEW_CHARS {
            let head: String = doc.text.chars().take(GRADING_PREVIEW_CHARS).collect();
            format!("{}...", head)
        } else {
            doc.text.clone()
        };
        doc_list.push(format!("[Doc {}]: {}", i, preview));
    }
    format!(
        "Question: {}\n\nDocuments to grade:\n{}\n\nGrade each document's relevance. \
         Return JSON array with doc_id, relevant (true/false), confidence (0.0-1.0), and reason.",
        query,
        doc_list.join("\n\n")
    )
}

// --- 查询改写提示 ---

pub const REWRITE_SYSTEM: &str = "You are a query rewriter for a document retrieval system. \
Reformulate the given question to improve retrieval from the document corpus: make it more \
specific, expand abbreviations, and use precise domain terminology while preserving the original \
intent and language.\n\nReturn ONLY the rewritten query, nothing else.";

pub fn rewrite_human(query: &str) -> String {
    format!(
        "Original question: {}\n\nRewrite this question to be more specific and improve search results:",
        query
    )
}

/// 打包后的来源作为独立 user 轮附加
pub fn sources_message(context: &str) -> String {
    format!("Context documents:\n{}", context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_core::LanguagePreference;

    fn ctx() -> RuntimeContext {
        RuntimeContext::default()
    }

    #[test]
    fn test_query_class_detection() {
        assert_eq!(detect_query_class("What is RAG?"), QueryClass::Definition);
        assert_eq!(
            detect_query_class("Compare annual leave and sick leave"),
            QueryClass::Comparison
        );
        assert_eq!(detect_query_class("How do I request leave?"), QueryClass::HowTo);
        assert_eq!(
            detect_query_class("List all types of leave"),
            QueryClass::List
        );
        assert_eq!(
            detect_query_class("Why was the policy changed?"),
            QueryClass::Analytical
        );
        assert_eq!(
            detect_query_class("Annual leave duration in 2024"),
            QueryClass::Factual
        );
    }

    #[test]
    fn test_query_class_multilingual() {
        assert_eq!(detect_query_class("Что такое RAG?"), QueryClass::Definition);
        assert_eq!(
            detect_query_class("Qanday qilib ta'til olsam bo'ladi?"),
            QueryClass::HowTo
        );
    }

    #[test]
    fn test_system_prompt_language() {
        let prompt = build_system_prompt("Что такое отпуск?", &[], &ctx(), Language::Ru);
        assert!(prompt.contains("русском"));
        let prompt = build_system_prompt("What is leave?", &[], &ctx(), Language::En);
        assert!(prompt.contains("Respond in English."));
        // unknown 按英文处理
        let prompt = build_system_prompt("...", &[], &ctx(), Language::Unknown);
        assert!(prompt.contains("Respond in English."));
    }

    #[test]
    fn test_citations_toggle() {
        let mut c = ctx();
        let with = build_system_prompt("q", &[], &c, Language::En);
        assert!(with.contains("according to page"));
        c.enable_citations = false;
        let without = build_system_prompt("q", &[], &c, Language::En);
        assert!(!without.contains("according to page"));
    }

    #[test]
    fn test_expertise_and_style_axes() {
        let mut c = ctx();
        c.expertise_level = qa_core::ExpertiseLevel::Beginner;
        c.response_style = qa_core::ResponseStyle::Concise;
        c.language_preference = LanguagePreference::En;
        let prompt = build_system_prompt("q", &[], &c, Language::En);
        assert!(prompt.contains("avoid jargon"));
        assert!(prompt.contains("brief"));
    }

    #[test]
    fn test_pdf_instruction_only_when_all_pdf() {
        let mut pdf_doc = Document::new("a", "text");
        pdf_doc
            .metadata
            .insert("source".into(), serde_json::json!("handbook.pdf"));
        let mut docx_doc = Document::new("b", "text");
        docx_doc
            .metadata
            .insert("source".into(), serde_json::json!("memo.docx"));

        let all_pdf = build_system_prompt("q", &[pdf_doc.clone()], &ctx(), Language::En);
        assert!(all_pdf.contains("PDF"));
        let mixed = build_system_prompt("q", &[pdf_doc, docx_doc], &ctx(), Language::En);
        assert!(!mixed.contains("analyzing PDF"));
    }

    #[test]
    fn test_grading_human_truncates_previews() {
        let long_doc = Document::new("d0", "x".repeat(2000));
        let msg = grading_human("q", &[long_doc]);
        assert!(msg.contains("[Doc 0]"));
        assert!(msg.contains("..."));
        assert!(msg.len() < 2000);
    }
}

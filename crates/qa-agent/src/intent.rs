use once_cell::sync::Lazy;
use qa_core::Language;
use regex::Regex;

/// 无需检索即可应答的意图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Thanks,
    Query,
}

// 三语问候模式
static GREETING_PATTERNS: &[&str] = &[
    // 乌兹别克语
    "salom",
    "assalomu alaykum",
    "assalom",
    "hayrli kun",
    "hayrli tong",
    "hayrli kech",
    "xayrli kun",
    "xayrli tong",
    "xayrli kech",
    // 俄语
    "привет",
    "здравствуйте",
    "здравствуй",
    "добрый день",
    "доброе утро",
    "добрый вечер",
    "приветствую",
    // 英语
    "hello",
    "hi",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "greetings",
];

static THANKS_PATTERNS: &[&str] = &[
    "rahmat", "raxmat", "tashakkur", "спасибо", "благодарю", "thanks", "thank you", "thx",
];

// 仅含 emoji 的消息按问候处理
static EMOJI_ONLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[\u{1F300}-\u{1FAFF}\u{2600}-\u{27B0}\u{FE00}-\u{FE0F}\u{200D}\u{2764}\s]+$",
    )
    .expect("static pattern")
});

/// 模式匹配意图分类，不调用 LLM
pub fn classify_intent(text: &str) -> Intent {
    let trimmed = text.trim();
    if EMOJI_ONLY.is_match(trimmed) {
        return Intent::Greeting;
    }

    let cleaned = trimmed
        .to_lowercase()
        .trim_end_matches(['!', '?', '.', ',', ':', ';'])
        .trim()
        .to_string();
    if cleaned.is_empty() {
        return Intent::Greeting;
    }

    if GREETING_PATTERNS.contains(&cleaned.as_str()) {
        return Intent::Greeting;
    }
    if THANKS_PATTERNS.contains(&cleaned.as_str()) {
        return Intent::Thanks;
    }

    // 短消息以问候词开头且没有后续问题的，按问候处理
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.len() <= 3 {
        let first = words[0];
        let starts_with_multiword = |patterns: &[&str]| {
            patterns
                .iter()
                .filter(|p| p.contains(' '))
                .any(|p| cleaned.starts_with(p))
        };
        if GREETING_PATTERNS.contains(&first) || starts_with_multiword(GREETING_PATTERNS) {
            // "salom, leave policy?" 这类伪装成问候的问题除外
            if !cleaned.contains([',', '?']) || words.len() <= 2 {
                return Intent::Greeting;
            }
        }
        if THANKS_PATTERNS.contains(&first) || starts_with_multiword(THANKS_PATTERNS) {
            return Intent::Thanks;
        }
    }

    Intent::Query
}

/// 问候/致谢的三语定型回复
pub fn canned_response(intent: Intent, language: Language) -> &'static str {
    match (intent, language) {
        (Intent::Thanks, Language::Uz) => {
            "Arzimaydi! Yana savollaringiz bo'lsa, bemalol murojaat qiling."
        }
        (Intent::Thanks, Language::Ru) => "Пожалуйста! Если у вас будут ещё вопросы, обращайтесь.",
        (Intent::Thanks, _) => "You're welcome! Feel free to ask if you have more questions.",
        (_, Language::Uz) => "Assalomu alaykum! Hujjatlar bo'yicha qanday yordam bera olaman?",
        (_, Language::Ru) => "Здравствуйте! Чем могу помочь по вашим документам?",
        (_, _) => "Hello! How can I help you with your documents?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greetings_all_languages() {
        assert_eq!(classify_intent("Salom!"), Intent::Greeting);
        assert_eq!(classify_intent("Здравствуйте"), Intent::Greeting);
        assert_eq!(classify_intent("hello"), Intent::Greeting);
        assert_eq!(classify_intent("Good morning"), Intent::Greeting);
    }

    #[test]
    fn test_thanks_all_languages() {
        assert_eq!(classify_intent("rahmat"), Intent::Thanks);
        assert_eq!(classify_intent("Спасибо!"), Intent::Thanks);
        assert_eq!(classify_intent("thank you"), Intent::Thanks);
    }

    #[test]
    fn test_emoji_only_is_greeting() {
        assert_eq!(classify_intent("👋"), Intent::Greeting);
        assert_eq!(classify_intent("🙂 🙂"), Intent::Greeting);
    }

    #[test]
    fn test_question_is_query() {
        assert_eq!(classify_intent("What is the leave policy?"), Intent::Query);
        assert_eq!(classify_intent("Какова политика отпусков?"), Intent::Query);
    }

    #[test]
    fn test_greeting_with_question_is_query() {
        assert_eq!(classify_intent("salom, leave policy?"), Intent::Query);
    }

    #[test]
    fn test_canned_response_language() {
        assert!(canned_response(Intent::Greeting, Language::Ru).contains("Здравствуйте"));
        assert!(canned_response(Intent::Thanks, Language::Uz).contains("Arzimaydi"));
        assert!(canned_response(Intent::Greeting, Language::Unknown).starts_with("Hello"));
    }
}

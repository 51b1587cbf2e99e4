use qa_core::Language;
use tracing::debug;

// 俄语高频停用词（与乌兹别克语西里尔文本区分）
const RU_STOPWORDS: &[&str] = &[
    "и", "в", "не", "на", "что", "как", "это", "для", "по", "или", "если", "чем", "где", "когда",
    "какой", "какие", "какова", "можно", "нужно", "есть",
];

// 英语高频停用词
const EN_STOPWORDS: &[&str] = &[
    "the", "is", "are", "what", "how", "of", "to", "in", "for", "and", "a", "an", "do", "does",
    "can", "my", "when", "where",
];

// 乌兹别克语（拉丁文）标志词与小品词
const UZ_MARKERS: &[&str] = &[
    "va", "uchun", "bilan", "qanday", "nima", "haqida", "kerak", "qilish", "bo'yicha", "boʻyicha",
    "qachon", "nechta", "tartibi", "mumkinmi", "ta'til", "maosh",
];

fn count_matches(text: &str, pred: impl Fn(char) -> bool) -> usize {
    text.chars().filter(|c| pred(*c)).count()
}

fn word_hits(words: &[&str], vocab: &[&str]) -> usize {
    words.iter().filter(|w| vocab.contains(*w)).count()
}

/// 多脚本启发式语言检测：纯函数，无外部调用
///
/// 优先级：乌兹别克语特有西里尔字母 > 西里尔为主(俄语) >
/// 拉丁文 + 乌兹别克语标志 > 拉丁文 + 英语停用词 > unknown。
pub fn detect_language(text: &str) -> Language {
    let lower = text.to_lowercase();

    let cyrillic = count_matches(&lower, |c| ('а'..='я').contains(&c) || c == 'ё');
    let latin = count_matches(&lower, |c| c.is_ascii_lowercase());
    let uzbek_cyrillic = count_matches(&lower, |c| matches!(c, 'ў' | 'қ' | 'ғ' | 'ҳ'));

    if cyrillic + latin + uzbek_cyrillic == 0 {
        return Language::Unknown;
    }

    // ў/қ/ғ/ҳ 只出现在乌兹别克语西里尔正写法中
    if uzbek_cyrillic > 0 {
        return Language::Uz;
    }

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'' && c != 'ʻ')
        .filter(|w| !w.is_empty())
        .collect();

    if cyrillic > latin {
        return Language::Ru;
    }

    // 拉丁文为主：乌兹别克语依靠 o'/g' 双字符与标志词
    let uz_hits = word_hits(&words, UZ_MARKERS)
        + lower.matches("o'").count()
        + lower.matches("g'").count()
        + lower.matches("oʻ").count()
        + lower.matches("gʻ").count();
    let en_hits = word_hits(&words, EN_STOPWORDS);

    if uz_hits > 0 && uz_hits >= en_hits {
        return Language::Uz;
    }
    if en_hits > 0 {
        return Language::En;
    }

    // 短拉丁文查询在 uz/en 之间不可靠：记录两个候选，下游按偏好覆盖
    if uz_hits > 0 {
        debug!(uz_hits, en_hits, "ambiguous latin query, candidates uz/en");
        return Language::Uz;
    }
    debug!(latin, "latin query without stopword evidence");
    Language::Unknown
}

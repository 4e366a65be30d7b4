//! Rule-based session names derived from the initial prompt.

use std::sync::LazyLock;

use regex::Regex;

/// Default maximum name length.
pub const DEFAULT_MAX_LEN: usize = 30;

const FALLBACK_NAME: &str = "Unnamed Session";

/// Filler words dropped from names.
const STRIP_WORDS: &[&str] = &[
    "please", "can", "you", "help", "me", "i", "want", "to", "need", "would", "like", "could",
    "should", "the", "a", "an", "this", "that", "it", "is", "are", "was", "were", "be",
];

/// Verbs always kept, even when short.
const ACTION_WORDS: &[&str] = &[
    "create", "add", "implement", "fix", "update", "delete", "remove", "refactor", "build",
    "make", "write", "design", "setup", "configure", "deploy", "test", "debug", "optimize",
];

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").expect("valid code block regex"));
static QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["`']+"#).expect("valid quote regex"));
static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w]").expect("valid non-word regex"));
static NON_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s\-]").expect("valid name filter regex"));

/// Build a short title-cased name from `prompt`, at most `max_len` chars.
pub fn generate_name(prompt: &str, max_len: usize) -> String {
    if prompt.trim().is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let text = prompt.to_lowercase();
    let text = CODE_BLOCK.replace_all(&text, "");
    let text = QUOTES.replace_all(&text, "");
    let words: Vec<&str> = text.split_whitespace().collect();

    let mut key_words: Vec<String> = Vec::new();
    for raw in &words {
        let word = NON_WORD.replace_all(raw, "").into_owned();
        if word.is_empty() {
            continue;
        }
        if ACTION_WORDS.contains(&word.as_str()) {
            key_words.push(word);
            continue;
        }
        if STRIP_WORDS.contains(&word.as_str()) {
            continue;
        }
        if word.chars().count() > 2 {
            key_words.push(word);
        }
        if key_words.len() >= 5 {
            break;
        }
    }

    if key_words.is_empty() {
        key_words = words.iter().take(5).map(|w| w.to_string()).collect();
    }

    let name = slugify(&key_words[..key_words.len().min(4)].join(" "), max_len);
    if name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        name
    }
}

/// Strip punctuation, title-case, and truncate at a word boundary when one
/// falls in the back half.
pub fn slugify(name: &str, max_len: usize) -> String {
    let cleaned = NON_NAME.replace_all(name, "");
    let titled: Vec<String> = cleaned.split_whitespace().map(title_case).collect();
    let name = titled.join(" ");

    if name.chars().count() <= max_len {
        return name;
    }

    let truncated: String = name.chars().take(max_len).collect();
    let cut = match truncated.rfind(' ') {
        Some(space) if space > max_len / 2 => &truncated[..space],
        _ => truncated.as_str(),
    };
    cut.trim().to_string()
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_filler_and_truncates_at_word_boundary() {
        let name = generate_name(
            "Please can you help me implement user authentication with JWT",
            DEFAULT_MAX_LEN,
        );
        assert_eq!(name, "Implement User Authentication");
    }

    #[test]
    fn keeps_short_action_words() {
        assert_eq!(generate_name("fix the login bug", DEFAULT_MAX_LEN), "Fix Login Bug");
    }

    #[test]
    fn ignores_code_blocks_and_quotes() {
        let name = generate_name(
            "refactor \"parser\" ```fn main() {}``` module",
            DEFAULT_MAX_LEN,
        );
        assert_eq!(name, "Refactor Parser Module");
    }

    #[test]
    fn empty_prompt_gets_fallback() {
        assert_eq!(generate_name("   ", DEFAULT_MAX_LEN), "Unnamed Session");
    }

    #[test]
    fn only_filler_words_fall_back_to_leading_words() {
        assert_eq!(generate_name("can you help me", DEFAULT_MAX_LEN), "Can You Help Me");
    }

    #[test]
    fn slugify_hard_cuts_without_late_space() {
        assert_eq!(slugify("abcdefghijklmnop qr", 10), "Abcdefghij");
    }
}

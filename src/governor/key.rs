use crate::upstream::ChatMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// Field separator for composite keys. Control characters are stripped during
// normalization, so it cannot appear in any field value.
const SEP: char = '\u{1f}';

/// Normalize a free-text query parameter for key derivation.
/// Lowercased, trimmed, inner whitespace collapsed, control chars stripped.
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text.chars().filter(|c| !c.is_control()).collect();
    WHITESPACE_RE
        .replace_all(cleaned.trim(), " ")
        .to_lowercase()
}

/// Cache key for a search request: equivalent parameter sets collide,
/// distinct ones never do.
pub fn search_key(topic: &str, category: Option<&str>, limit: u32, offset: u32) -> String {
    let category = category.map(normalize_text).unwrap_or_default();
    let input = format!(
        "search{SEP}{}{SEP}{category}{SEP}{limit}{SEP}{offset}",
        normalize_text(topic)
    );
    hash_key(&input)
}

/// Cache key for a raw chat request, derived from everything that affects
/// the completion.
pub fn chat_key(
    model: &str,
    messages: &[ChatMessage],
    temperature: Option<f32>,
    max_tokens: Option<u32>,
) -> String {
    let mut input = format!("chat{SEP}{}", normalize_text(model));
    for message in messages {
        input.push(SEP);
        input.push_str(&message.role);
        input.push(SEP);
        input.push_str(&normalize_text(&message.content));
    }
    input.push(SEP);
    input.push_str(&temperature.map(|t| t.to_string()).unwrap_or_default());
    input.push(SEP);
    input.push_str(&max_tokens.map(|t| t.to_string()).unwrap_or_default());
    hash_key(&input)
}

fn hash_key(input: &str) -> String {
    let hash = xxh3_64(input.as_bytes());
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Markets "), "markets");
        assert_eq!(normalize_text("Tech   Sector\tNews"), "tech sector news");
        assert_eq!(normalize_text("plain"), "plain");
    }

    #[test]
    fn test_equivalent_topics_collide() {
        let a = search_key(" Markets ", None, 10, 0);
        let b = search_key("markets", None, 10, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_limit_changes_key() {
        let a = search_key("markets", None, 10, 0);
        let b = search_key("markets", None, 20, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_offset_and_category_change_key() {
        let base = search_key("markets", Some("equities"), 10, 0);
        assert_ne!(base, search_key("markets", Some("equities"), 10, 10));
        assert_ne!(base, search_key("markets", Some("bonds"), 10, 0));
        assert_ne!(base, search_key("markets", None, 10, 0));
    }

    #[test]
    fn test_field_boundaries_do_not_merge() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = search_key("ab", Some("c"), 10, 0);
        let b = search_key("a", Some("bc"), 10, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_is_16_hex_chars() {
        let key = search_key("markets", None, 10, 0);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_chat_key_sensitive_to_messages() {
        let msgs_a = vec![ChatMessage {
            role: "user".to_string(),
            content: "What moved the S&P today?".to_string(),
        }];
        let msgs_b = vec![ChatMessage {
            role: "user".to_string(),
            content: "What moved the Nasdaq today?".to_string(),
        }];

        let a = chat_key("sonar", &msgs_a, Some(0.2), Some(512));
        let b = chat_key("sonar", &msgs_b, Some(0.2), Some(512));
        assert_ne!(a, b);

        let a2 = chat_key("sonar", &msgs_a, Some(0.2), Some(512));
        assert_eq!(a, a2, "identical requests derive the same key");
    }

    #[test]
    fn test_chat_key_sensitive_to_sampling_params() {
        let msgs = vec![ChatMessage {
            role: "user".to_string(),
            content: "summarize fed minutes".to_string(),
        }];
        let a = chat_key("sonar", &msgs, Some(0.2), Some(512));
        let b = chat_key("sonar", &msgs, Some(0.7), Some(512));
        let c = chat_key("sonar", &msgs, Some(0.2), None);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}

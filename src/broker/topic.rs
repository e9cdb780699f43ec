//! Topic-exchange routing: dot-separated words, `*` matches exactly one word
//! and `#` matches zero or more.

use super::error::BrokerError;

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &words)
}

fn matches_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| matches_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && matches_words(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && matches_words(rest, &words[1..])
        }
    }
}

pub(crate) fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    let invalid = |reason| BrokerError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    if pattern.is_empty() {
        return Err(invalid("pattern is empty"));
    }
    for word in pattern.split('.') {
        if word.is_empty() {
            return Err(invalid("pattern has an empty word"));
        }
        if word.len() > 1 && (word.contains('*') || word.contains('#')) {
            return Err(invalid("wildcards must stand alone as a word"));
        }
    }
    Ok(())
}

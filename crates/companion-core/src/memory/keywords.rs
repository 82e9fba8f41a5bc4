//! ============================================================================
//! Text Utilities - Keywords, normalization, hashing, similarity
//! ============================================================================
//! Shared by the store (content hashes, write-time dedup), the relevance
//! engine (keyword extraction) and maintenance (consolidation).
//! ============================================================================

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};

/// Shortest token kept as a retrieval keyword
pub const MIN_KEYWORD_LEN: usize = 3;

/// Words that carry no topical signal
fn is_stopword(token: &str) -> bool {
    matches!(
        token,
        "about"
            | "after"
            | "again"
            | "all"
            | "also"
            | "and"
            | "any"
            | "are"
            | "because"
            | "been"
            | "before"
            | "but"
            | "can"
            | "could"
            | "did"
            | "does"
            | "doing"
            | "don"
            | "for"
            | "from"
            | "had"
            | "has"
            | "have"
            | "her"
            | "here"
            | "him"
            | "his"
            | "how"
            | "into"
            | "its"
            | "just"
            | "let"
            | "like"
            | "more"
            | "not"
            | "now"
            | "our"
            | "out"
            | "please"
            | "really"
            | "she"
            | "should"
            | "some"
            | "tell"
            | "than"
            | "that"
            | "the"
            | "their"
            | "them"
            | "then"
            | "there"
            | "these"
            | "they"
            | "this"
            | "too"
            | "very"
            | "was"
            | "were"
            | "what"
            | "whats"
            | "when"
            | "where"
            | "which"
            | "who"
            | "why"
            | "will"
            | "with"
            | "would"
            | "yes"
            | "you"
            | "your"
    )
}

/// Lowercased alphanumeric tokens, in order
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Remove straight and curly apostrophes so "can't" reads "cant"
pub fn fold_apostrophes(text: &str) -> String {
    text.chars().filter(|c| *c != '\'' && *c != '’').collect()
}

/// Keyword set for a message: lowercase, split on non-alphanumerics,
/// drop stopwords and tokens shorter than three characters.
///
/// Apostrophes are removed before splitting so "what's" becomes "whats"
/// rather than leaving a stray "what".
pub fn extract_keywords(message: &str) -> BTreeSet<String> {
    let joined = fold_apostrophes(message);
    tokens(&joined)
        .filter(|t| t.chars().count() >= MIN_KEYWORD_LEN)
        .filter(|t| !is_stopword(t))
        .collect()
}

/// Collapse text to lowercase tokens joined by single spaces
pub fn normalize_text(text: &str) -> String {
    tokens(text).collect::<Vec<_>>().join(" ")
}

/// Normalize a profile key: lowercase, separators become single underscores
///
/// "Favorite Color" -> "favorite_color"
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_was_sep = false;
    for ch in key.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Hex SHA-256 of the normalized text
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Token set used for similarity comparisons
pub fn token_set(text: &str) -> HashSet<String> {
    tokens(text).collect()
}

/// Jaccard similarity of two token sets, 0.0 when either is empty
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f32 / union as f32
}

/// Jaccard similarity of two texts
pub fn text_similarity(a: &str, b: &str) -> f32 {
    jaccard(&token_set(a), &token_set(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keywords() {
        let kw = extract_keywords("What's the weather like in Tokyo today?");
        assert!(kw.contains("weather"));
        assert!(kw.contains("tokyo"));
        assert!(kw.contains("today"));
        assert!(!kw.contains("the"));
        assert!(!kw.contains("what"));
        assert!(!kw.contains("in"));
        assert!(!kw.contains("whats"));
    }

    #[test]
    fn test_keywords_only_stopwords() {
        assert!(extract_keywords("is it? what was that").is_empty());
        assert!(extract_keywords("").is_empty());
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("Favorite Color"), "favorite_color");
        assert_eq!(normalize_key("  favorite   color "), "favorite_color");
        assert_eq!(normalize_key("pet-name"), "pet_name");
        assert_eq!(normalize_key("name"), "name");
    }

    #[test]
    fn test_content_hash_ignores_case_and_punctuation() {
        assert_eq!(
            content_hash("User loves hiking!"),
            content_hash("user   LOVES hiking")
        );
        assert_ne!(content_hash("User loves hiking"), content_hash("User hates hiking"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn test_similarity() {
        let a = "User talked about their trip to Japan in spring";
        let b = "User talked about their trip to Japan in the spring";
        assert!(text_similarity(a, b) >= 0.85);
        assert!(text_similarity(a, "User asked about Rust lifetimes") < 0.3);
        assert_eq!(text_similarity("", a), 0.0);
    }
}

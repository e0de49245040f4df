//! Output file naming.
//!
//! Shared helpers for turning free-text field values into archive entry names
//! that are safe on every common filesystem, and unique within one run.

use std::collections::{HashMap, HashSet};

/// Upper bound on the sanitized base name, in characters.
pub const MAX_NAME_LEN: usize = 120;

const SEPARATOR: char = '_';

/// Name used when both the value and the fallback sanitize to nothing.
const LAST_RESORT: &str = "document";

fn is_illegal(ch: char) -> bool {
    matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || ch.is_control()
}

fn trim_edges(name: &str) -> &str {
    name.trim_matches(|ch: char| ch == '.' || ch == SEPARATOR || ch.is_whitespace())
}

fn clean(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut last_separator = false;

    for ch in name.trim().chars() {
        if is_illegal(ch) || ch.is_whitespace() || ch == SEPARATOR {
            if !last_separator {
                result.push(SEPARATOR);
                last_separator = true;
            }
        } else {
            result.push(ch);
            last_separator = false;
        }
    }

    let truncated: String = trim_edges(&result).chars().take(MAX_NAME_LEN).collect();
    trim_edges(&truncated).to_string()
}

/// Sanitize a string for use as a file name.
///
/// Illegal characters and whitespace become `_`, runs of `_` collapse, dots
/// and separators are trimmed from both ends and the result is capped at
/// [`MAX_NAME_LEN`] characters. Never returns an empty string.
pub fn sanitize_filename(name: &str, fallback: &str) -> String {
    let cleaned = clean(name);
    if !cleaned.is_empty() {
        return cleaned;
    }

    let fallback = clean(fallback);
    if fallback.is_empty() {
        LAST_RESORT.to_string()
    } else {
        fallback
    }
}

/// Hands out unique names within one run.
///
/// The first claim of a base name returns it unchanged; the k-th repeat gets
/// `_<k>` appended, skipping suffixes that an earlier row already claimed
/// verbatim.
#[derive(Debug, Default)]
pub struct NameRegistry {
    repeats: HashMap<String, usize>,
    claimed: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, base: &str) -> String {
        if self.claimed.insert(base.to_string()) {
            return base.to_string();
        }

        let counter = self.repeats.entry(base.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{base}{SEPARATOR}{counter}");
            if self.claimed.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Mario Rossi", "fallback"), "Mario_Rossi");
        assert_eq!(sanitize_filename("  Spaces  ", "fallback"), "Spaces");
        assert_eq!(sanitize_filename("", "fallback"), "fallback");
        assert_eq!(sanitize_filename("Test__Name", "fb"), "Test_Name");
    }

    #[test]
    fn test_illegal_characters_collapse_to_one_separator() {
        assert_eq!(sanitize_filename(r#"a:/\*?"<>|b"#, "fb"), "a_b");
        assert_eq!(sanitize_filename(r#":/\*?"<>|name|"#, "fb"), "name");
        assert_eq!(sanitize_filename(r#":/\*?"<>|"#, "row_4"), "row_4");
    }

    #[test]
    fn test_dots_trimmed_from_edges() {
        assert_eq!(sanitize_filename("..hidden.", "fb"), "hidden");
        assert_eq!(sanitize_filename("v1.2 final", "fb"), "v1.2_final");
        assert_eq!(sanitize_filename("...", "row_1"), "row_1");
    }

    #[test]
    fn test_length_is_bounded() {
        let long = "é".repeat(300);
        let name = sanitize_filename(&long, "fb");
        assert_eq!(name.chars().count(), MAX_NAME_LEN);

        let spaced = format!("{} tail", "x".repeat(MAX_NAME_LEN - 1));
        assert_eq!(sanitize_filename(&spaced, "fb"), "x".repeat(MAX_NAME_LEN - 1));
    }

    #[test]
    fn test_unicode_letters_are_kept() {
        assert_eq!(sanitize_filename("Città di Castello", "fb"), "Città_di_Castello");
    }

    #[test]
    fn test_never_empty() {
        assert_eq!(sanitize_filename("", ""), "document");
        assert_eq!(sanitize_filename("///", "***"), "document");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "Mario Rossi",
            r#" a :: b // c "#,
            "..x..",
            "tab\tand\nnewline",
            "__already_clean__",
            "ünïcödé  name",
        ];
        for sample in samples {
            let once = sanitize_filename(sample, "fb");
            assert_eq!(sanitize_filename(&once, "fb"), once, "input: {sample:?}");
        }
    }

    #[test]
    fn test_registry_suffixes_repeats() {
        let mut names = NameRegistry::new();
        assert_eq!(names.claim("Alice"), "Alice");
        assert_eq!(names.claim("Alice"), "Alice_1");
        assert_eq!(names.claim("row_3"), "row_3");
        assert_eq!(names.claim("Alice"), "Alice_2");
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_registry_skips_taken_suffixes() {
        let mut names = NameRegistry::new();
        assert_eq!(names.claim("A_1"), "A_1");
        assert_eq!(names.claim("A"), "A");
        assert_eq!(names.claim("A"), "A_2");
        assert_eq!(names.claim("A_1"), "A_1_1");
    }
}

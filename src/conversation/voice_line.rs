//! Pull the line to speak out of an LLM answer.
//!
//! Priority:
//! 1. `VOICE_RESPONSE:` line, cleaned, if at most 60 words
//! 2. `CUSTOM COMPLETED:` line, cleaned, if at most 50 words
//! 3. `COMPLETED:` line, cleaned
//! 4. first 120 words of the raw text with markup removed
//! 5. first 500 characters of the raw text

use std::sync::OnceLock;

use regex::Regex;

const VOICE_MAX_WORDS: usize = 60;
const CUSTOM_MAX_WORDS: usize = 50;
const FALLBACK_WORDS: usize = 120;
const FALLBACK_CHARS: usize = 500;

fn asides() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").expect("static regex"))
}

/// Value after `tag:` on the first line carrying it as a standalone word.
fn tagged_value<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    for line in text.lines() {
        // ASCII uppercasing keeps byte offsets aligned with `line`.
        let upper = line.to_ascii_uppercase();
        let mut from = 0;
        while let Some(found) = upper[from..].find(tag) {
            let start = from + found;
            let end = start + tag.len();
            from = end;

            let before = upper[..start].chars().next_back();
            if before.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                continue;
            }
            // "CUSTOM COMPLETED" is its own tag.
            if tag == "COMPLETED" && upper[..start].trim_end().ends_with("CUSTOM") {
                continue;
            }

            let rest = line[end..].trim_start_matches(['*', '_']);
            if let Some(value) = rest.strip_prefix(':') {
                return Some(value.trim_start_matches(['*', '_']).trim());
            }
        }
    }
    None
}

/// Strip emphasis markup and bracketed asides, collapse whitespace.
fn clean(text: &str) -> String {
    let without_asides = asides().replace_all(text, "");
    without_asides
        .replace(['*', '_', '`'], "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn strip_markup(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.replace(['*', '_', '`', '#', '>', '~'], ""))
        .filter(|w| !w.is_empty())
        .take(FALLBACK_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn extract(raw: &str) -> String {
    if let Some(line) = tagged_value(raw, "VOICE_RESPONSE").map(clean) {
        if !line.is_empty() && word_count(&line) <= VOICE_MAX_WORDS {
            return line;
        }
    }

    if let Some(line) = tagged_value(raw, "CUSTOM COMPLETED").map(clean) {
        if !line.is_empty() && word_count(&line) <= CUSTOM_MAX_WORDS {
            return line;
        }
    }

    if let Some(line) = tagged_value(raw, "COMPLETED").map(clean) {
        if !line.is_empty() {
            return line;
        }
    }

    let words = strip_markup(raw);
    if !words.is_empty() {
        return words;
    }

    raw.chars().take(FALLBACK_CHARS).collect::<String>().trim().to_string()
}

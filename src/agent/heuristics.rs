//! Best-effort guesses about the agent's free-form output.
//!
//! Nothing here is part of the agent's structured protocol. These adapters
//! encode two observed habits and are kept apart from [`super::protocol`] so
//! they can be revised without touching event parsing:
//!
//! - the real answer is usually the first fenced code block of the text output;
//! - when no text is emitted, stderr may announce a file the agent wrote
//!   ("File `x.py` created ..."), which then stands in for the answer.

use regex::Regex;
use std::sync::OnceLock;

fn fenced_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+#.\-]*[ \t]*\r?\n(.*?)```").expect("valid fenced block regex")
    })
}

fn created_file_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"Файл [`"']([^`"'\n]+?\.\w+)[`"'] создан"#,
            r#"(?i)\bfile [`"']([^`"'\n]+?\.\w+)[`"'] (?:was |has been )?created"#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid created-file regex"))
        .collect()
    })
}

/// Content of the first fenced code block, trimmed.
pub fn first_fenced_block(text: &str) -> Option<String> {
    fenced_block_pattern()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Pick the response text from the concatenated text records.
pub fn select_response(full_text: &str) -> String {
    first_fenced_block(full_text).unwrap_or_else(|| full_text.to_string())
}

/// File names announced as created in diagnostic output, in order, deduplicated.
pub fn created_file_mentions(stderr: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for pattern in created_file_patterns() {
        for captures in pattern.captures_iter(stderr) {
            if let Some(name) = captures.get(1) {
                found.push((name.start(), name.as_str().trim().to_string()));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut names: Vec<String> = Vec::new();
    for (_, name) in found {
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

//! Tolerant JSON-array recovery for capability output.
//!
//! The extraction capability is asked for a bare JSON array but may wrap it
//! in markdown fences or prose, or return near-JSON (trailing commas, curly
//! quotes). Recovery locates the outermost array with string-aware bracket
//! matching, attempts a parse, and applies at most one repair pass before
//! giving up.

use regex::Regex;

/// Locates the outermost JSON array in mixed content.
///
/// Markdown code fences are stripped first, then the first `[` is matched
/// against its closing `]` while respecting string literals and escape
/// sequences. Returns the candidate array text, unvalidated.
pub fn locate_array(content: &str) -> Option<&str> {
    let inner = strip_code_fence(content);
    let start = inner.find('[')?;
    let end = find_matching_bracket(&inner[start..])?;
    Some(&inner[start..=start + end])
}

/// Strips a surrounding markdown code fence, if present.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the optional language tag on the fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Finds the matching closing bracket for a string starting with `[`.
///
/// Handles nested brackets and braces, string literals, and escape
/// sequences within strings.
fn find_matching_bracket(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Applies the single repair pass to a near-JSON candidate.
///
/// Repairs applied:
/// - trailing commas before `]` or `}` are removed
/// - curly quotation marks are normalized to straight quotes
pub fn repair_candidate(candidate: &str) -> String {
    let normalized: String = candidate
        .chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();

    let trailing_commas = Regex::new(r",\s*([\]}])").expect("static regex");
    trailing_commas.replace_all(&normalized, "$1").into_owned()
}

/// Parses a JSON array out of mixed capability output.
///
/// Tries the located candidate as-is, then once more after the repair pass.
/// Returns the parsed array elements or `None` when both attempts fail.
pub fn parse_array(content: &str) -> Option<Vec<serde_json::Value>> {
    let candidate = locate_array(content)?;

    if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(candidate) {
        return Some(values);
    }

    let repaired = repair_candidate(candidate);
    serde_json::from_str::<Vec<serde_json::Value>>(&repaired).ok()
}

//! Recover `[{"path", "content"}]` file arrays from free-form model output.
//!
//! Strategies run in order and the first one that yields at least one valid record wins:
//! direct parse, fenced blocks, bracket-depth scan, then per-object salvage. Nothing here
//! fails; total failure is an empty list.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::project::FileRecord;
use crate::util::{cached_regex, is_safe_relative_path};

/// Upper bound on a single bracket-scan candidate.
const MAX_CANDIDATE_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DirectParse,
    FencedBlock,
    BracketScan,
    ObjectSalvage,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::DirectParse => "direct parse",
            Strategy::FencedBlock => "fenced block",
            Strategy::BracketScan => "bracket scan",
            Strategy::ObjectSalvage => "object salvage",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionOutcome {
    /// `None` when every strategy came up empty.
    pub strategy: Option<Strategy>,
    pub files: Vec<FileRecord>,
}

pub fn extract(text: &str) -> Vec<FileRecord> {
    extract_detailed(text).files
}

pub fn extract_detailed(text: &str) -> ExtractionOutcome {
    let strategies: [(Strategy, fn(&str) -> Option<Vec<FileRecord>>); 4] = [
        (Strategy::DirectParse, direct_parse),
        (Strategy::FencedBlock, fenced_blocks),
        (Strategy::BracketScan, bracket_scan),
        (Strategy::ObjectSalvage, object_salvage),
    ];
    for (strategy, run) in strategies {
        if let Some(files) = run(text) {
            tracing::debug!(strategy = strategy.label(), files = files.len(), "extracted file records");
            return ExtractionOutcome {
                strategy: Some(strategy),
                files,
            };
        }
    }
    ExtractionOutcome::default()
}

// ═══════════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════════

fn direct_parse(text: &str) -> Option<Vec<FileRecord>> {
    parse_file_array(text.trim())
}

fn fenced_blocks(text: &str) -> Option<Vec<FileRecord>> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = cached_regex(&FENCE, r"(?s)```([A-Za-z0-9_+.-]*)[ \t]*\r?\n?(.*?)```")?;

    fence
        .captures_iter(text)
        .filter(|caps| {
            let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            tag.is_empty() || tag.eq_ignore_ascii_case("json")
        })
        .filter_map(|caps| caps.get(2))
        .find_map(|body| parse_file_array(body.as_str().trim()))
}

fn bracket_scan(text: &str) -> Option<Vec<FileRecord>> {
    let bytes = text.as_bytes();
    let mut best: Option<Vec<FileRecord>> = None;
    let mut skip_until = 0usize;

    for start in 0..bytes.len() {
        if start < skip_until || bytes[start] != b'[' || !next_non_ws_is(bytes, start + 1, b'{') {
            continue;
        }
        let Some(end) = balanced_end(bytes, start) else {
            continue;
        };
        let Some(records) = parse_file_array(&text[start..end]) else {
            continue;
        };
        // Candidates nested inside an accepted array are part of its content.
        skip_until = end;
        let longer = best
            .as_ref()
            .map(|current| records.len() > current.len())
            .unwrap_or(true);
        if longer {
            best = Some(records);
        }
    }
    best
}

fn object_salvage(text: &str) -> Option<Vec<FileRecord>> {
    static OBJECT_HEAD: OnceLock<Option<Regex>> = OnceLock::new();
    let head = cached_regex(
        &OBJECT_HEAD,
        r#"\{\s*"path"\s*:\s*"((?:[^"\\]|\\.)+)"\s*,\s*"content"\s*:\s*""#,
    )?;

    let bytes = text.as_bytes();
    let mut records = Vec::new();
    let mut cursor = 0usize;

    while cursor < text.len() {
        let Some(caps) = head.captures_at(text, cursor) else {
            break;
        };
        let (Some(whole), Some(raw_path)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let content_start = whole.end();
        let Some((content_end, object_end)) = closing_content_quote(bytes, content_start) else {
            tracing::debug!(path = raw_path.as_str(), "dropping file with unbounded content");
            cursor = content_start;
            continue;
        };
        cursor = object_end;

        let (Some(path), Some(content)) = (
            unescape_json_string(raw_path.as_str()),
            unescape_json_string(&text[content_start..content_end]),
        ) else {
            continue;
        };
        if let Some(record) = checked_record(path, content) {
            records.push(record);
        }
    }

    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scanning helpers
// ═══════════════════════════════════════════════════════════════════════════

fn next_non_ws_is(bytes: &[u8], from: usize, expected: u8) -> bool {
    bytes[from.min(bytes.len())..]
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == expected)
        .unwrap_or(false)
}

/// End offset (exclusive) of the structure opening at `start`, ignoring brackets inside
/// strings. A mismatched closer or an oversized span abandons the candidate.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let limit = bytes.len().min(start.saturating_add(MAX_CANDIDATE_BYTES));

    for (idx, &b) in bytes.iter().enumerate().take(limit).skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Find the quote closing a content string that begins at `from`.
///
/// Returns the quote offset and the offset just past the object's `}`. Only a quote
/// followed by optional whitespace, an optional comma, and `}` counts.
fn closing_content_quote(bytes: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut escaped = false;
    for idx in from..bytes.len() {
        let b = bytes[idx];
        if escaped {
            escaped = false;
            continue;
        }
        if b == b'\\' {
            escaped = true;
            continue;
        }
        if b != b'"' {
            continue;
        }
        let mut next = idx + 1;
        while next < bytes.len() && bytes[next].is_ascii_whitespace() {
            next += 1;
        }
        if next < bytes.len() && bytes[next] == b',' {
            next += 1;
            while next < bytes.len() && bytes[next].is_ascii_whitespace() {
                next += 1;
            }
        }
        if next < bytes.len() && bytes[next] == b'}' {
            return Some((idx, next + 1));
        }
    }
    None
}

/// Decode the body of a JSON string literal. Raw control characters are tolerated.
fn unescape_json_string(raw: &str) -> Option<String> {
    let mut literal = String::with_capacity(raw.len() + 2);
    literal.push('"');
    for ch in raw.chars() {
        match ch {
            '\n' => literal.push_str("\\n"),
            '\r' => literal.push_str("\\r"),
            '\t' => literal.push_str("\\t"),
            _ => literal.push(ch),
        }
    }
    literal.push('"');
    serde_json::from_str::<String>(&literal).ok()
}

/// Drop commas whose next non-whitespace character closes an object or array.
/// Commas inside string literals are left alone.
pub(crate) fn remove_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            out.push(b);
            continue;
        }
        match b {
            b'"' => {
                in_string = true;
                out.push(b);
            }
            b',' if next_non_ws_is(bytes, idx + 1, b'}') || next_non_ws_is(bytes, idx + 1, b']') => {}
            _ => out.push(b),
        }
    }
    // Only ASCII commas were removed, so the bytes are still valid UTF-8.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// Record conversion
// ═══════════════════════════════════════════════════════════════════════════

fn parse_file_array(candidate: &str) -> Option<Vec<FileRecord>> {
    if !candidate.starts_with('[') {
        return None;
    }
    let value = serde_json::from_str::<Value>(&remove_trailing_commas(candidate)).ok()?;
    records_from_value(value)
}

/// A non-empty array whose every element is an object with a string `path`.
fn records_from_value(value: Value) -> Option<Vec<FileRecord>> {
    let Value::Array(items) = value else {
        return None;
    };
    if items.is_empty() {
        return None;
    }
    let shaped = items.iter().all(|item| {
        item.as_object()
            .and_then(|obj| obj.get("path"))
            .map(Value::is_string)
            .unwrap_or(false)
    });
    if !shaped {
        return None;
    }

    let records: Vec<FileRecord> = items
        .into_iter()
        .filter_map(|item| {
            let Value::Object(mut obj) = item else {
                return None;
            };
            let path = obj.remove("path")?.as_str()?.to_string();
            let content = match obj.remove("content") {
                Some(Value::String(text)) => text,
                Some(Value::Null) | None => {
                    tracing::warn!(path = %path, "dropping file record without content");
                    return None;
                }
                Some(other) => serde_json::to_string_pretty(&other).ok()?,
            };
            checked_record(path, content)
        })
        .collect();

    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}

fn checked_record(path: String, content: String) -> Option<FileRecord> {
    if !is_safe_relative_path(Path::new(&path)) {
        tracing::warn!(path = %path, "dropping file record with unsafe path");
        return None;
    }
    Some(FileRecord { path, content })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop, prop_assert_eq, proptest};
    use proptest::strategy::Strategy as ValueStrategy;

    fn record(path: &str, content: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Strategy selection
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_serialized_records_round_trip() {
        let files = vec![
            record("src/app/page.tsx", "export default function Page() {\n  return <div>[{}]</div>;\n}\n"),
            record("lib/quote.ts", "export const q = \"a \\\"quoted\\\" ]} thing\";"),
            record("README.md", "# Title\n\n```json\n[1,2]\n```\n"),
        ];
        let text = serde_json::to_string(&files).unwrap();
        let outcome = extract_detailed(&text);
        assert_eq!(outcome.strategy, Some(Strategy::DirectParse));
        assert_eq!(outcome.files, files);
    }

    #[test]
    fn test_fenced_block_with_trailing_comma() {
        let text = "some explanation ```json\n[{\"path\":\"a.ts\",\"content\":\"x\",}]\n``` more text";
        let outcome = extract_detailed(text);
        assert_eq!(outcome.strategy, Some(Strategy::FencedBlock));
        assert_eq!(outcome.files, vec![record("a.ts", "x")]);
    }

    #[test]
    fn test_direct_parse_repairs_trailing_commas() {
        let text = "  [{\"path\":\"a.ts\",\"content\":\"x\",},{\"path\":\"b.ts\",\"content\":\"y\"},]  ";
        let outcome = extract_detailed(text);
        assert_eq!(outcome.strategy, Some(Strategy::DirectParse));
        assert_eq!(outcome.files, vec![record("a.ts", "x"), record("b.ts", "y")]);
    }

    #[test]
    fn test_untagged_fence_in_position_order() {
        let text = "First:\n```\n[{\"path\":\"first.ts\",\"content\":\"1\"}]\n```\nThen:\n```json\n[{\"path\":\"second.ts\",\"content\":\"2\"}]\n```";
        assert_eq!(extract(text), vec![record("first.ts", "1")]);
    }

    #[test]
    fn test_fence_with_other_language_is_skipped() {
        let text = "```ts\n[{\"path\":\"no.ts\",\"content\":\"n\"}]\n```\n```json\n[{\"path\":\"yes.ts\",\"content\":\"y\"}]\n```";
        assert_eq!(extract(text), vec![record("yes.ts", "y")]);
    }

    #[test]
    fn test_bracket_scan_ignores_brackets_in_strings() {
        let text = r#"Here you go: [{"path":"a.ts","content":"const x = [1, {\"k\": \"]}\"}];",}] hope that helps"#;
        let outcome = extract_detailed(text);
        assert_eq!(outcome.strategy, Some(Strategy::BracketScan));
        assert_eq!(
            outcome.files,
            vec![record("a.ts", "const x = [1, {\"k\": \"]}\"}];")]
        );
    }

    #[test]
    fn test_bracket_scan_longest_array_wins() {
        let text = concat!(
            "draft: [{\"path\":\"one.ts\",\"content\":\"1\"}]\n",
            "final: [{\"path\":\"a.ts\",\"content\":\"a\"},{\"path\":\"b.ts\",\"content\":\"b\"}]\n",
        );
        let files = extract(text);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "a.ts");
    }

    #[test]
    fn test_bracket_scan_equal_length_first_wins() {
        let text = concat!(
            "v1: [{\"path\":\"first.ts\",\"content\":\"1\"}]\n",
            "v2: [{\"path\":\"second.ts\",\"content\":\"2\"}]\n",
        );
        assert_eq!(extract(text), vec![record("first.ts", "1")]);
    }

    #[test]
    fn test_bracket_scan_abandons_mismatched_candidate() {
        let text = "oops [{\"path\":\"bad.ts\"] then [{\"path\":\"good.ts\",\"content\":\"g\"}]";
        assert_eq!(extract(text), vec![record("good.ts", "g")]);
    }

    #[test]
    fn test_salvage_recovers_complete_objects_from_truncated_output() {
        let text = concat!(
            "[{\"path\":\"a.ts\",\"content\":\"line1\\nline2 \\\"q\\\"\"},\n",
            " {\"path\":\"b.ts\", \"content\": \"b\" , },\n",
            " {\"path\":\"c.ts\",\"content\":\"export const cut = "
        );
        let outcome = extract_detailed(text);
        assert_eq!(outcome.strategy, Some(Strategy::ObjectSalvage));
        assert_eq!(
            outcome.files,
            vec![record("a.ts", "line1\nline2 \"q\""), record("b.ts", "b")]
        );
    }

    #[test]
    fn test_salvage_tolerates_raw_newlines() {
        let text = "{\"path\":\"a.ts\",\"content\":\"x\ny\"} trailing";
        assert_eq!(extract(text), vec![record("a.ts", "x\ny")]);
    }

    #[test]
    fn test_total_failure_is_empty() {
        let outcome = extract_detailed("I could not generate that project, sorry.");
        assert_eq!(outcome.strategy, None);
        assert!(outcome.files.is_empty());
        assert!(extract("").is_empty());
        assert!(extract("[]").is_empty());
        assert!(extract("[{\"name\":\"x\"}]").is_empty());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record conversion
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_unsafe_paths_are_dropped() {
        let text = r#"[{"path":"../../etc/passwd","content":"x"},{"path":"ok.ts","content":"y"},{"path":"/abs.ts","content":"z"}]"#;
        assert_eq!(extract(text), vec![record("ok.ts", "y")]);
    }

    #[test]
    fn test_object_content_is_pretty_printed() {
        let text = r#"[{"path":"package.json","content":{"name":"demo","private":true}}]"#;
        let files = extract(text);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "{\n  \"name\": \"demo\",\n  \"private\": true\n}");
    }

    #[test]
    fn test_trailing_comma_inside_string_is_preserved() {
        let repaired = remove_trailing_commas(r#"{"content":"{a, }","list":[1,2,],}"#);
        assert_eq!(repaired, r#"{"content":"{a, }","list":[1,2]}"#);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Properties
    // ═══════════════════════════════════════════════════════════════════════

    const SAFE_PATH: &str = r"[a-z]{1,8}(/[a-z]{1,8}){0,3}\.(ts|tsx|js)";
    const BRACKETY_CONTENT: &str = r#"[ a-zA-Z0-9\[\]{}"\\,:;\n]{0,60}"#;

    fn records_strategy(content: &'static str) -> impl ValueStrategy<Value = Vec<FileRecord>> {
        prop::collection::vec((SAFE_PATH, content), 1..5).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(path, content)| FileRecord { path, content })
                .collect()
        })
    }

    fn json_str(s: &str) -> String {
        serde_json::to_string(s).unwrap()
    }

    fn numbered(prefix: &str, count: usize) -> Vec<FileRecord> {
        (0..count)
            .map(|i| record(&format!("{prefix}{i}.ts"), &format!("export const v{i} = {i};")))
            .collect()
    }

    proptest! {
        #[test]
        fn test_any_serialized_records_round_trip(
            files in prop::collection::vec((SAFE_PATH, any::<String>()), 1..5)
        ) {
            let files: Vec<FileRecord> = files
                .into_iter()
                .map(|(path, content)| FileRecord { path, content })
                .collect();
            let outcome = extract_detailed(&serde_json::to_string(&files).unwrap());
            prop_assert_eq!(outcome.strategy, Some(Strategy::DirectParse));
            prop_assert_eq!(outcome.files, files);
        }

        #[test]
        fn test_brackets_and_quotes_in_content_survive_bracket_scan(
            files in records_strategy(BRACKETY_CONTENT)
        ) {
            let text = format!(
                "Here you go: {} hope that helps",
                serde_json::to_string_pretty(&files).unwrap()
            );
            let outcome = extract_detailed(&text);
            prop_assert_eq!(outcome.strategy, Some(Strategy::BracketScan));
            prop_assert_eq!(outcome.files, files);
        }

        #[test]
        fn test_injected_trailing_commas_are_tolerated(
            files in records_strategy(BRACKETY_CONTENT),
            pad in "[ \n]{0,3}",
        ) {
            let objects: Vec<String> = files
                .iter()
                .map(|f| {
                    format!(
                        "{{\"path\":{},\"content\":{},{pad}}}",
                        json_str(&f.path),
                        json_str(&f.content)
                    )
                })
                .collect();
            let text = format!("[{},{pad}]", objects.join(","));
            let outcome = extract_detailed(&text);
            prop_assert_eq!(outcome.strategy, Some(Strategy::DirectParse));
            prop_assert_eq!(outcome.files, files);
        }

        #[test]
        fn test_longest_embedded_array_wins_and_ties_keep_the_first(
            first_len in 1usize..5,
            second_len in 1usize..5,
        ) {
            let first = numbered("first", first_len);
            let second = numbered("second", second_len);
            let text = format!(
                "draft: {}\nfinal: {}\n",
                serde_json::to_string(&first).unwrap(),
                serde_json::to_string(&second).unwrap()
            );
            let expected = if second_len > first_len { second } else { first };
            let outcome = extract_detailed(&text);
            prop_assert_eq!(outcome.strategy, Some(Strategy::BracketScan));
            prop_assert_eq!(outcome.files, expected);
        }
    }
}

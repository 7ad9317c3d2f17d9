//! Extraction and validation of the JSON envelope embedded in agent output.
//!
//! Agents interleave prose, markdown fences and exactly one machine-readable
//! summary. Extraction prefers fenced blocks labelled `json` (last block
//! first); without any such block the full text is scanned for top-level JSON
//! objects. Candidates are validated against embedded JSON Schemas and then
//! deserialized. Failures are values, never panics or errors: the engine
//! decides whether to retry with a format reminder.

use std::collections::HashSet;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::{FixSummary, ReviewSummary};

const REVIEW_SCHEMA: &str = include_str!("../../schemas/review_summary.schema.json");
const FIX_SCHEMA: &str = include_str!("../../schemas/fix_summary.schema.json");

/// How many trailing `{` positions a truncated payload is repaired from.
const MAX_REPAIR_STARTS: usize = 32;

static REVIEW_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_schema(REVIEW_SCHEMA));
static FIX_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_schema(FIX_SCHEMA));

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```[ \t]*json[ \t]*\r?\n(.*?)(?:```|\z)").expect("fence regex is valid")
});

fn compile_schema(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema should be valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded schema should compile")
}

/// A summary type the parser knows how to validate.
pub trait Envelope: DeserializeOwned {
    /// Name used in failure reasons.
    const NAME: &'static str;

    fn validator() -> &'static Validator;

    /// Semantic checks beyond the schema.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Envelope for ReviewSummary {
    const NAME: &'static str = "review summary";

    fn validator() -> &'static Validator {
        &REVIEW_VALIDATOR
    }
}

impl Envelope for FixSummary {
    const NAME: &'static str = "fix summary";

    fn validator() -> &'static Validator {
        &FIX_VALIDATOR
    }

    fn check(&self) -> Result<(), String> {
        let mut fix_ids = HashSet::new();
        for fix in &self.fixes {
            if !fix_ids.insert(fix.id) {
                return Err(format!("duplicate fix id {}", fix.id));
            }
        }
        let mut skipped_ids = HashSet::new();
        for skipped in &self.skipped {
            if !skipped_ids.insert(skipped.id) {
                return Err(format!("duplicate skipped id {}", skipped.id));
            }
            if fix_ids.contains(&skipped.id) {
                return Err(format!(
                    "id {} appears in both fixes and skipped",
                    skipped.id
                ));
            }
        }
        Ok(())
    }
}

/// Where the accepted payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    FencedBlock,
    BareObject,
}

/// A successfully parsed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    /// True when the local repair pass had to fix the JSON text.
    pub repaired: bool,
    pub source: PayloadSource,
}

/// Why no envelope could be recovered. Expected and recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ParseFailure {
    pub reason: String,
}

impl ParseFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub fn parse_review_summary(raw: &str) -> Result<Parsed<ReviewSummary>, ParseFailure> {
    parse_envelope(raw)
}

pub fn parse_fix_summary(raw: &str) -> Result<Parsed<FixSummary>, ParseFailure> {
    parse_envelope(raw)
}

/// Review text to hand to the fixer when no envelope could be recovered.
///
/// Returns `None` for output that is blank after trimming.
pub fn extract_text(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Locate, repair if needed, validate and deserialize an envelope of type `T`.
pub fn parse_envelope<T: Envelope>(raw: &str) -> Result<Parsed<T>, ParseFailure> {
    let blocks = fenced_json_blocks(raw);
    if !blocks.is_empty() {
        let mut last_failure = None;
        for block in blocks.iter().rev() {
            match parse_candidate::<T>(block, PayloadSource::FencedBlock) {
                Ok(parsed) => return Ok(parsed),
                Err(failure) => {
                    last_failure.get_or_insert(failure);
                }
            }
        }
        let failure = last_failure.unwrap_or_else(|| ParseFailure::new("empty json block"));
        return Err(ParseFailure::new(format!(
            "{}: json block rejected: {}",
            T::NAME,
            failure.reason
        )));
    }

    let objects = bare_json_objects(raw);
    if objects.is_empty() {
        return parse_truncated::<T>(raw);
    }

    let mut first_failure = None;
    for object in objects {
        match validate_value::<T>(object) {
            Ok(value) => {
                return Ok(Parsed {
                    value,
                    repaired: false,
                    source: PayloadSource::BareObject,
                });
            }
            Err(failure) => {
                first_failure.get_or_insert(failure);
            }
        }
    }
    // Complete objects may be nested pieces of a cut-off envelope.
    if let Ok(parsed) = parse_truncated::<T>(raw) {
        return Ok(parsed);
    }
    let failure = first_failure.unwrap_or_else(|| ParseFailure::new("no candidate object"));
    Err(ParseFailure::new(format!("{}: {}", T::NAME, failure.reason)))
}

/// Nothing parses as-is, so the payload may be cut off mid-object. Repair is
/// tried from each of the last few `{` in turn, outermost first, so braces in
/// prose ahead of the payload cannot hide it.
fn parse_truncated<T: Envelope>(raw: &str) -> Result<Parsed<T>, ParseFailure> {
    let starts: Vec<usize> = raw.match_indices('{').map(|(i, _)| i).collect();
    if starts.is_empty() {
        return Err(ParseFailure::new(format!(
            "{}: no JSON block or object found in output",
            T::NAME
        )));
    }

    let mut syntax_failure = None;
    let mut schema_failure = None;
    for &start in &starts[starts.len().saturating_sub(MAX_REPAIR_STARTS)..] {
        match parse_candidate::<T>(&raw[start..], PayloadSource::BareObject) {
            Ok(parsed) => return Ok(parsed),
            Err(failure) if failure.reason.starts_with("invalid JSON") => {
                syntax_failure.get_or_insert(failure);
            }
            Err(failure) => {
                schema_failure.get_or_insert(failure);
            }
        }
    }
    let failure = schema_failure
        .or(syntax_failure)
        .unwrap_or_else(|| ParseFailure::new("no candidate object"));
    Err(ParseFailure::new(format!("{}: {}", T::NAME, failure.reason)))
}

/// Bodies of fenced code blocks labelled `json`, in document order.
///
/// A final block that was never closed runs to the end of the text.
pub fn fenced_json_blocks(raw: &str) -> Vec<&str> {
    FENCED_JSON_RE
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| !body.is_empty())
        .collect()
}

/// Every syntactically valid top-level JSON object in `raw`, in order.
///
/// Objects nested inside an accepted object are not reported separately.
fn bare_json_objects(raw: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    let mut pos = 0;
    while let Some(offset) = raw[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                objects.push(value);
                pos = start + stream.byte_offset().max(1);
            }
            _ => pos = start + 1,
        }
    }
    objects
}

fn parse_candidate<T: Envelope>(
    text: &str,
    source: PayloadSource,
) -> Result<Parsed<T>, ParseFailure> {
    let text = text.trim();
    let (value, repaired) = match serde_json::from_str::<Value>(text) {
        Ok(value) => (value, false),
        Err(err) => {
            let Some(fixed) = repair_json(text) else {
                return Err(ParseFailure::new(format!("invalid JSON: {err}")));
            };
            match serde_json::from_str::<Value>(&fixed) {
                Ok(value) => (value, true),
                Err(_) => return Err(ParseFailure::new(format!("invalid JSON: {err}"))),
            }
        }
    };
    let value = validate_value::<T>(value)?;
    Ok(Parsed {
        value,
        repaired,
        source,
    })
}

fn validate_value<T: Envelope>(value: Value) -> Result<T, ParseFailure> {
    if !value.is_object() {
        return Err(ParseFailure::new("expected a JSON object"));
    }
    let messages: Vec<String> = T::validator()
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(ParseFailure::new(format!(
            "schema mismatch: {}",
            messages.join("; ")
        )));
    }
    let parsed: T = serde_json::from_value(value)
        .map_err(|err| ParseFailure::new(format!("schema mismatch: {err}")))?;
    parsed
        .check()
        .map_err(|msg| ParseFailure::new(format!("invalid {}: {msg}", T::NAME)))?;
    Ok(parsed)
}

/// Mechanically fix common malformations: trailing commas, an unterminated
/// final string or field, and unclosed brackets.
///
/// Returns `None` when the text has no JSON start or nothing was changed.
pub fn repair_json(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    let body = text[start..].trim_end();

    let mut out = String::with_capacity(body.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                trim_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                }
                out.push(c);
                if closers.is_empty() {
                    break;
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    if !closers.is_empty() {
        drop_dangling_key(&mut out);
        while let Some(close) = closers.pop() {
            trim_trailing_comma(&mut out);
            out.push(close);
        }
    }

    (out != body).then_some(out)
}

fn trim_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
}

/// Remove a trailing `"key":` that never received a value.
fn drop_dangling_key(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if !out.ends_with(':') {
        return;
    }
    out.pop();
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if !out.ends_with('"') {
        return;
    }
    out.pop();
    let bytes = out.as_bytes();
    let opening_quote =
        (0..bytes.len()).rev().find(|&i| bytes[i] == b'"' && (i == 0 || bytes[i - 1] != b'\\'));
    if let Some(idx) = opening_quote {
        out.truncate(idx);
    }
    trim_trailing_comma(out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FixDecision, Priority};

    const FIX_JSON: &str = r#"{
        "decision": "APPLY_SELECTIVELY",
        "fixes": [{"id": 1, "title": "null check", "priority": "P1", "file": "src/lib.rs",
                   "claim": "panics on empty input", "evidence": "line 10", "fix": "guard"}],
        "skipped": [{"id": 2, "title": "style", "reason": "subjective"}],
        "stop_iteration": false
    }"#;

    #[test]
    fn prefers_labelled_fence_over_bare_objects() {
        let raw = format!(
            "Here is a sample {{\"decision\": 1}}\n\n```json\n{FIX_JSON}\n```\nDone."
        );
        let parsed = parse_fix_summary(&raw).expect("parse");
        assert_eq!(parsed.source, PayloadSource::FencedBlock);
        assert!(!parsed.repaired);
        assert_eq!(parsed.value.decision, FixDecision::ApplySelectively);
        assert_eq!(parsed.value.fixes[0].priority, Priority::P1);
    }

    #[test]
    fn last_valid_fence_wins() {
        let raw = format!(
            "```json\n{{\"findings\": []}}\n```\nthen\n```json\n{{\"findings\": [{{\"title\": \"t\", \"body\": \"b\", \"priority\": \"P0\"}}]}}\n```"
        );
        let parsed = parse_review_summary(&raw).expect("parse");
        assert_eq!(parsed.value.findings.len(), 1);
    }

    #[test]
    fn falls_back_to_bare_object_scan() {
        let raw = format!("I fixed things. {{not json}} Summary: {FIX_JSON} -- end");
        let parsed = parse_fix_summary(&raw).expect("parse");
        assert_eq!(parsed.source, PayloadSource::BareObject);
        assert_eq!(parsed.value.skipped.len(), 1);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"```json
{"findings": [], "extra": {"nested": true}, "overall_correctness": "patch is correct"}
```"#;
        let parsed = parse_review_summary(raw).expect("parse");
        assert!(parsed.value.findings.is_empty());
        assert_eq!(
            parsed.value.overall_correctness.as_deref(),
            Some("patch is correct")
        );
    }

    #[test]
    fn repairs_trailing_commas_and_flags_it() {
        let raw = "```json\n{\"decision\": \"NO_CHANGES_NEEDED\", \"fixes\": [], \"skipped\": [], \"stop_iteration\": true,}\n```";
        let parsed = parse_fix_summary(raw).expect("parse");
        assert!(parsed.repaired);
        assert!(parsed.value.stop_iteration);
    }

    #[test]
    fn repairs_unterminated_final_field() {
        let raw = "```json\n{\"findings\": [], \"explanation\": \"cut off mid";
        let parsed = parse_review_summary(raw).expect("parse");
        assert!(parsed.repaired);
        assert_eq!(parsed.value.explanation.as_deref(), Some("cut off mid"));
    }

    #[test]
    fn repairs_truncated_bare_object() {
        let raw = "Summary follows {\"findings\": [], \"explanation\": \"abc\", \"overall_correctness\":";
        let parsed = parse_review_summary(raw).expect("parse");
        assert!(parsed.repaired);
        assert_eq!(parsed.value.overall_correctness, None);
    }

    #[test]
    fn braces_in_prose_do_not_hide_a_truncated_payload() {
        let raw = "Use {x} in the loop. {\"findings\": [], \"explanation\": \"cut";
        let parsed = parse_review_summary(raw).expect("parse");
        assert!(parsed.repaired);
        assert_eq!(parsed.value.explanation.as_deref(), Some("cut"));
    }

    #[test]
    fn truncated_envelope_with_complete_nested_fix_is_repaired() {
        let raw = r#"{"decision": "APPLY_SELECTIVELY",
            "fixes": [{"id": 1, "title": "a", "priority": "P1", "claim": "c", "evidence": "e", "fix": "f"}],
            "skipped": [], "stop_iteration": true"#;
        let parsed = parse_fix_summary(raw).expect("parse");
        assert!(parsed.repaired);
        assert_eq!(parsed.value.fixes.len(), 1);
        assert!(parsed.value.stop_iteration);
    }

    #[test]
    fn schema_mismatch_is_a_typed_failure() {
        let raw = "```json\n{\"decision\": \"MAYBE\", \"fixes\": [], \"skipped\": [], \"stop_iteration\": true}\n```";
        let failure = parse_fix_summary(raw).unwrap_err();
        assert!(failure.reason.contains("schema mismatch"), "{}", failure.reason);
    }

    #[test]
    fn missing_payload_reports_reason() {
        let failure = parse_review_summary("no structure here at all").unwrap_err();
        assert!(failure.reason.contains("no JSON block or object"));
    }

    #[test]
    fn rejects_ids_shared_between_fixes_and_skipped() {
        let raw = r#"{"decision": "APPLY_MOST",
            "fixes": [{"id": 3, "title": "a", "priority": "P2", "claim": "c", "evidence": "e", "fix": "f"}],
            "skipped": [{"id": 3, "title": "a", "reason": "dup"}],
            "stop_iteration": false}"#;
        let failure = parse_fix_summary(raw).unwrap_err();
        assert!(failure.reason.contains("both fixes and skipped"));
    }

    #[test]
    fn repair_leaves_valid_json_alone() {
        assert_eq!(repair_json("{\"a\": [1, 2]}"), None);
        assert_eq!(
            repair_json("{\"a\": [1, 2,], \"b\": {\"c\": 1,},}").as_deref(),
            Some("{\"a\": [1, 2], \"b\": {\"c\": 1}}")
        );
    }

    #[test]
    fn repair_keeps_commas_inside_strings() {
        let fixed = repair_json("{\"a\": \"x,}\",").expect("repaired");
        assert_eq!(fixed, "{\"a\": \"x,}\"}");
    }
}

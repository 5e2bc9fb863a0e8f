//! The three pure, stateless model-name operations: substitution
//! (byte-level, one of the two deliberately untyped seams alongside the
//! usage parser), whitelist matching, and mapping.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelRewriteError {
    #[error("missing_model")]
    MissingModel,
}

/// Replaces the top-level `"model"` field's value in a JSON request body
/// without deserializing (and therefore reserializing, and therefore
/// possibly reordering or reformatting) the rest of the document. Scans raw
/// bytes tracking string/escape state and brace depth, finds the `model` key
/// at depth 1, and splices in the new value in place.
pub fn rewrite_model(body: &[u8], new_model: &str) -> Result<Vec<u8>, ModelRewriteError> {
    let span = find_top_level_string_value(body, "model").ok_or(ModelRewriteError::MissingModel)?;
    let mut out = Vec::with_capacity(body.len() + new_model.len());
    out.extend_from_slice(&body[..span.value_start]);
    out.push(b'"');
    escape_json_string_into(new_model, &mut out);
    out.push(b'"');
    out.extend_from_slice(&body[span.value_end..]);
    Ok(out)
}

/// Reads the top-level `"model"` field without mutating anything. Used by
/// the dispatcher to learn the client's requested model before any rewrite.
pub fn read_model(body: &[u8]) -> Option<String> {
    let span = find_top_level_string_value(body, "model")?;
    // value_start/value_end bound the content between the quotes.
    let raw = &body[span.value_start..span.value_end];
    serde_json::from_slice::<String>(&wrap_in_quotes(raw)).ok()
}

fn wrap_in_quotes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 2);
    out.push(b'"');
    out.extend_from_slice(raw);
    out.push(b'"');
    out
}

struct ValueSpan {
    value_start: usize,
    value_end: usize,
}

/// Finds the byte span of a top-level (depth-1 object) string field's value,
/// *excluding* the surrounding quotes themselves but including nothing else.
/// Returns `None` if the field is absent, not a JSON object at top level, or
/// the field's value isn't a JSON string.
fn find_top_level_string_value(body: &[u8], key: &str) -> Option<ValueSpan> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut i = 0usize;
    let key_pattern = format!("\"{key}\"");

    // Skip leading whitespace to find the opening brace.
    while i < body.len() && (body[i] as char).is_whitespace() {
        i += 1;
    }
    if body.get(i) != Some(&b'{') {
        return None;
    }

    while i < body.len() {
        let b = body[i];
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' => {
                // Is this the key we're looking for, at depth 1?
                if depth == 1 && body[i..].starts_with(key_pattern.as_bytes()) {
                    let mut j = i + key_pattern.len();
                    while j < body.len() && (body[j] as char).is_whitespace() {
                        j += 1;
                    }
                    if body.get(j) == Some(&b':') {
                        j += 1;
                        while j < body.len() && (body[j] as char).is_whitespace() {
                            j += 1;
                        }
                        if body.get(j) == Some(&b'"') {
                            let value_start = j + 1;
                            let mut k = value_start;
                            let mut esc = false;
                            while k < body.len() {
                                let c = body[k];
                                if esc {
                                    esc = false;
                                } else if c == b'\\' {
                                    esc = true;
                                } else if c == b'"' {
                                    return Some(ValueSpan { value_start, value_end: k });
                                }
                                k += 1;
                            }
                            return None;
                        }
                        // Non-string model value (e.g. null) — not representable here.
                        return None;
                    }
                }
                in_string = true;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

fn escape_json_string_into(value: &str, out: &mut Vec<u8>) {
    for ch in value.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

/// `isSupported(requested, whitelist)`: exact membership, or for any entry
/// ending in `*`, a prefix match on the portion before `*`. An empty
/// whitelist accepts everything.
pub fn is_supported(requested: &str, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    whitelist.iter().any(|pattern| matches_pattern(requested, pattern))
}

fn matches_pattern(requested: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => requested.starts_with(prefix),
        None => requested == pattern,
    }
}

/// `effective(requested, mapping)`: exact match wins; else the first pattern
/// ending in `*` whose prefix `requested` starts with substitutes the
/// requested suffix into the target's own `*` (one `*` per side); else
/// `requested` unchanged. Idempotent when re-applied to its own result.
pub fn effective(requested: &str, mapping: &HashMap<String, String>) -> String {
    if let Some(target) = mapping.get(requested) {
        return target.clone();
    }
    for (pattern, target) in mapping {
        let Some(prefix) = pattern.strip_suffix('*') else {
            continue;
        };
        if let Some(suffix) = requested.strip_prefix(prefix) {
            if let Some(target_prefix) = target.strip_suffix('*') {
                return format!("{target_prefix}{suffix}");
            }
            return target.clone();
        }
    }
    requested.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_preserves_rest_of_body_byte_for_byte() {
        let body = br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#;
        let out = rewrite_model(body, "gpt-4o").unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#
        );
    }

    #[test]
    fn rewrite_handles_model_with_escapes() {
        let body = br#"{"model":"a\"b","x":1}"#;
        let out = rewrite_model(body, "clean").unwrap();
        assert_eq!(std::str::from_utf8(&out).unwrap(), r#"{"model":"clean","x":1}"#);
    }

    #[test]
    fn rewrite_ignores_nested_model_keys() {
        let body = br#"{"model":"top","meta":{"model":"nested"}}"#;
        let out = rewrite_model(body, "new").unwrap();
        assert_eq!(
            std::str::from_utf8(&out).unwrap(),
            r#"{"model":"new","meta":{"model":"nested"}}"#
        );
    }

    #[test]
    fn rewrite_fails_when_model_absent() {
        let body = br#"{"messages":[]}"#;
        assert_eq!(rewrite_model(body, "x"), Err(ModelRewriteError::MissingModel));
    }

    #[test]
    fn read_model_returns_value() {
        let body = br#"{"model":"claude-sonnet-4"}"#;
        assert_eq!(read_model(body).as_deref(), Some("claude-sonnet-4"));
    }

    #[test]
    fn empty_whitelist_accepts_all() {
        assert!(is_supported("anything", &[]));
    }

    #[test]
    fn whitelist_exact_and_wildcard() {
        let whitelist = vec!["gpt-4".to_string(), "claude-*".to_string()];
        assert!(is_supported("gpt-4", &whitelist));
        assert!(is_supported("claude-sonnet-4", &whitelist));
        assert!(!is_supported("gemini-pro", &whitelist));
    }

    #[test]
    fn mapping_exact_beats_wildcard() {
        let mut mapping = HashMap::new();
        mapping.insert("claude-*".to_string(), "anthropic/claude-*".to_string());
        mapping.insert("claude-opus".to_string(), "special/opus".to_string());
        assert_eq!(effective("claude-opus", &mapping), "special/opus");
        assert_eq!(effective("claude-sonnet-4", &mapping), "anthropic/claude-sonnet-4");
        assert_eq!(effective("unrelated", &mapping), "unrelated");
    }

    #[test]
    fn mapping_is_idempotent() {
        let mut mapping = HashMap::new();
        mapping.insert("claude-*".to_string(), "anthropic/claude-*".to_string());
        let once = effective("claude-sonnet-4", &mapping);
        let twice = effective(&once, &mapping);
        assert_eq!(once, twice);
    }
}

//! Token-usage extraction across every vendor dialect the gateway relays.
//!
//! `parse_usage_fragment` is additive, never replacing: callers fold each
//! SSE `data:` payload or complete JSON body through the same accumulator as
//! a stream progresses, so a chunk that only reports `output_tokens` doesn't
//! erase totals a previous chunk already contributed.

use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub reasoning_tokens: u64,
}

impl UsageAccumulator {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Folds one fragment — a raw non-stream JSON body, or the decoded payload
/// of a single SSE `data:` line — into `acc`. All four recognized dialect
/// families are checked unconditionally and contribute additively; this is
/// safe because in practice only one family ever reports non-zero numbers
/// for a given upstream. Unparseable or non-object fragments are
/// silently ignored (usage extraction never fails a request).
pub fn parse_usage_fragment(fragment: &str, acc: &mut UsageAccumulator) {
    let Ok(value) = serde_json::from_str::<Value>(fragment) else {
        return;
    };
    parse_anthropic_shape(&value, acc);
    parse_openai_chat_shape(&value, acc);
    parse_openai_responses_shape(&value, acc);
    parse_gemini_shape(&value, acc);
}

fn as_u64(value: &Value) -> u64 {
    value.as_u64().unwrap_or(0)
}

fn parse_anthropic_shape(value: &Value, acc: &mut UsageAccumulator) {
    // `message.usage.{...}` (streaming `message_start` events) and a
    // top-level `usage.{input_tokens, output_tokens}` (non-stream responses).
    if let Some(usage) = value.pointer("/message/usage") {
        add_anthropic_usage(usage, acc);
    }
    if let Some(usage) = value.get("usage") {
        add_anthropic_usage(usage, acc);
    }
}

fn add_anthropic_usage(usage: &Value, acc: &mut UsageAccumulator) {
    if let Some(v) = usage.get("input_tokens") {
        acc.input_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("output_tokens") {
        acc.output_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("cache_creation_input_tokens") {
        acc.cache_creation_input_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("cache_read_input_tokens") {
        acc.cache_read_input_tokens += as_u64(v);
    }
}

fn parse_openai_chat_shape(value: &Value, acc: &mut UsageAccumulator) {
    let Some(usage) = value.get("usage") else {
        return;
    };
    // prompt_tokens/completion_tokens only belong to this family when the
    // anthropic-shape fields above are absent from the same object, but since
    // contribution is additive by design we don't need to disambiguate here.
    if let Some(v) = usage.get("prompt_tokens") {
        acc.input_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("completion_tokens") {
        acc.output_tokens += as_u64(v);
    }
    if let Some(v) = usage.pointer("/completion_tokens_details/reasoning_tokens") {
        acc.reasoning_tokens += as_u64(v);
    }
    if let Some(v) = usage.pointer("/prompt_tokens_details/cached_tokens") {
        acc.cache_read_input_tokens += as_u64(v);
    }
}

fn parse_openai_responses_shape(value: &Value, acc: &mut UsageAccumulator) {
    let Some(usage) = value.pointer("/response/usage") else {
        return;
    };
    if let Some(v) = usage.get("input_tokens") {
        acc.input_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("output_tokens") {
        acc.output_tokens += as_u64(v);
    }
    if let Some(v) = usage.pointer("/input_tokens_details/cached_tokens") {
        acc.cache_read_input_tokens += as_u64(v);
    }
    if let Some(v) = usage.pointer("/output_tokens_details/reasoning_tokens") {
        acc.reasoning_tokens += as_u64(v);
    }
}

fn parse_gemini_shape(value: &Value, acc: &mut UsageAccumulator) {
    let Some(usage) = value.get("usageMetadata") else {
        return;
    };
    if let Some(v) = usage.get("promptTokenCount") {
        acc.input_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("candidatesTokenCount") {
        acc.output_tokens += as_u64(v);
    }
    if let Some(v) = usage.get("cachedContentTokenCount") {
        acc.cache_read_input_tokens += as_u64(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_non_stream_usage() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment(r#"{"usage":{"input_tokens":10,"output_tokens":5}}"#, &mut acc);
        assert_eq!(acc.input_tokens, 10);
        assert_eq!(acc.output_tokens, 5);
    }

    #[test]
    fn anthropic_stream_message_start_usage() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment(
            r#"{"type":"message_start","message":{"usage":{"input_tokens":20,"cache_read_input_tokens":4}}}"#,
            &mut acc,
        );
        assert_eq!(acc.input_tokens, 20);
        assert_eq!(acc.cache_read_input_tokens, 4);
    }

    #[test]
    fn openai_chat_usage_maps_fields() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment(
            r#"{"usage":{"prompt_tokens":30,"completion_tokens":12,
                "completion_tokens_details":{"reasoning_tokens":3},
                "prompt_tokens_details":{"cached_tokens":7}}}"#,
            &mut acc,
        );
        assert_eq!(acc.input_tokens, 30);
        assert_eq!(acc.output_tokens, 12);
        assert_eq!(acc.reasoning_tokens, 3);
        assert_eq!(acc.cache_read_input_tokens, 7);
    }

    #[test]
    fn openai_responses_usage_nested_under_response() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment(
            r#"{"response":{"usage":{"input_tokens":8,"output_tokens":2,
                "output_tokens_details":{"reasoning_tokens":1}}}}"#,
            &mut acc,
        );
        assert_eq!(acc.input_tokens, 8);
        assert_eq!(acc.output_tokens, 2);
        assert_eq!(acc.reasoning_tokens, 1);
    }

    #[test]
    fn gemini_usage_metadata() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment(
            r#"{"usageMetadata":{"promptTokenCount":100,"candidatesTokenCount":40,"cachedContentTokenCount":10}}"#,
            &mut acc,
        );
        assert_eq!(acc.input_tokens, 100);
        assert_eq!(acc.output_tokens, 40);
        assert_eq!(acc.cache_read_input_tokens, 10);
    }

    #[test]
    fn accumulates_additively_across_chunks() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment(r#"{"usageMetadata":{"promptTokenCount":10}}"#, &mut acc);
        parse_usage_fragment(r#"{"usageMetadata":{"candidatesTokenCount":4}}"#, &mut acc);
        parse_usage_fragment(r#"{"usageMetadata":{"candidatesTokenCount":6}}"#, &mut acc);
        assert_eq!(acc.input_tokens, 10);
        assert_eq!(acc.output_tokens, 10);
    }

    #[test]
    fn malformed_fragment_is_ignored() {
        let mut acc = UsageAccumulator::default();
        parse_usage_fragment("not json", &mut acc);
        assert!(acc.is_empty());
    }
}

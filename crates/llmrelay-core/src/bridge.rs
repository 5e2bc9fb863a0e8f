//! Cross-dialect provider serving: a provider's `platform` tag fixes the
//! wire dialect it natively speaks, but the Dispatcher does not restrict a
//! request to providers of the exact same platform as the endpoint it
//! arrived on — a `gemini-cli` provider may serve a request that arrived on
//! an OpenAI-chat endpoint (and vice versa), and an Anthropic client may
//! fall back to an OpenAI-speaking provider, bridged through the format
//! translator crate.
//!
//! Only the pairs the translator crate actually implements are bridgeable:
//! Anthropic↔OpenAiChat (one direction: Anthropic client, OpenAI provider —
//! the direction unified-gateway mode needs) and OpenAiChat↔Gemini (both
//! directions). Everything else is `CallMode::Unsupported` and such a
//! candidate is skipped as though its whitelist didn't match.

use bytes::Bytes;
use llmrelay_protocol::anthropic::CreateMessageResponse;
use llmrelay_protocol::gemini::{GenerateContentRequest, GenerateContentResponse};
use llmrelay_protocol::openai_chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use llmrelay_protocol::{Dialect, Platform};
use llmrelay_transform::anthropic_openai::{anthropic_request_to_openai, openai_response_to_anthropic, simulate_anthropic_stream};
use llmrelay_transform::openai_gemini::{
    gemini_request_to_openai, gemini_response_to_openai, openai_chunk_to_gemini, openai_request_to_gemini,
    openai_response_to_gemini, simulate_openai_stream,
};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no translation path from {from:?} to {to:?}")]
    Unsupported { from: Dialect, to: Dialect },
    #[error("malformed body for {0:?} translation: {1}")]
    Malformed(Dialect, String),
}

/// The provider's native wire dialect, derived purely from its platform tag
/// (the data model carries no separate dialect field — each platform tag
/// implies exactly one wire shape).
pub fn native_dialect(platform: Platform) -> Dialect {
    match platform {
        Platform::Claude => Dialect::Anthropic,
        Platform::Codex | Platform::Picoclaw => Dialect::OpenAiChat,
        Platform::GeminiCli => Dialect::Gemini,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Client dialect == provider dialect; no translation, genuine pass-through.
    Native,
    /// Client is Gemini, provider is OpenAI chat: the one streaming-chunk
    /// conversion direction that can run live, per-chunk.
    LiveChunks,
    /// Every other mismatched pair: the translator only knows how to convert
    /// a *complete* response, so the upstream call is forced non-stream and,
    /// if the client wanted a stream, the converted response is replayed
    /// through the non-stream→SSE simulation in the client's own dialect.
    BufferedConvert,
}

pub fn call_mode(client_dialect: Dialect, provider_dialect: Dialect) -> Option<CallMode> {
    if client_dialect == provider_dialect {
        return Some(CallMode::Native);
    }
    match (client_dialect, provider_dialect) {
        (Dialect::Gemini, Dialect::OpenAiChat) => Some(CallMode::LiveChunks),
        (Dialect::OpenAiChat, Dialect::Gemini) => Some(CallMode::BufferedConvert),
        (Dialect::Anthropic, Dialect::OpenAiChat) => Some(CallMode::BufferedConvert),
        _ => None,
    }
}

/// Translates a client's request body into the shape the chosen provider
/// expects. `model_hint` carries the model name for client dialects (Gemini)
/// whose wire format keeps it out of the body — in the URL instead; other
/// dialects ignore it since their own body already names the model.
pub fn translate_outbound_request(
    client_dialect: Dialect,
    provider_dialect: Dialect,
    body: &[u8],
    model_hint: Option<&str>,
) -> Result<Vec<u8>, BridgeError> {
    if client_dialect == provider_dialect {
        return Ok(body.to_vec());
    }
    match (client_dialect, provider_dialect) {
        (Dialect::OpenAiChat, Dialect::Gemini) => {
            let req: ChatCompletionRequest =
                serde_json::from_slice(body).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            let gemini = openai_request_to_gemini(&req).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            serde_json::to_vec(&gemini).map_err(|e| BridgeError::Malformed(provider_dialect, e.to_string()))
        }
        (Dialect::Gemini, Dialect::OpenAiChat) => {
            let req: GenerateContentRequest =
                serde_json::from_slice(body).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            let openai = gemini_request_to_openai(&req, model_hint.unwrap_or_default());
            serde_json::to_vec(&openai).map_err(|e| BridgeError::Malformed(provider_dialect, e.to_string()))
        }
        (Dialect::Anthropic, Dialect::OpenAiChat) => {
            let req: llmrelay_protocol::anthropic::CreateMessageRequest =
                serde_json::from_slice(body).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            let openai = anthropic_request_to_openai(&req).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            serde_json::to_vec(&openai).map_err(|e| BridgeError::Malformed(provider_dialect, e.to_string()))
        }
        _ => Err(BridgeError::Unsupported { from: client_dialect, to: provider_dialect }),
    }
}

/// Translates a complete (non-stream) provider response body back into the
/// client's dialect.
pub fn translate_inbound_response(
    provider_dialect: Dialect,
    client_dialect: Dialect,
    body: &[u8],
    trace_id: &str,
    model: &str,
) -> Result<Vec<u8>, BridgeError> {
    if provider_dialect == client_dialect {
        return Ok(body.to_vec());
    }
    match (provider_dialect, client_dialect) {
        (Dialect::Gemini, Dialect::OpenAiChat) => {
            let resp: GenerateContentResponse =
                serde_json::from_slice(body).map_err(|e| BridgeError::Malformed(provider_dialect, e.to_string()))?;
            let openai = gemini_response_to_openai(&resp, trace_id, model);
            serde_json::to_vec(&openai).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))
        }
        (Dialect::OpenAiChat, Dialect::Gemini) => {
            let resp: ChatCompletionResponse =
                serde_json::from_slice(body).map_err(|e| BridgeError::Malformed(provider_dialect, e.to_string()))?;
            let gemini = openai_response_to_gemini(&resp);
            serde_json::to_vec(&gemini).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))
        }
        (Dialect::OpenAiChat, Dialect::Anthropic) => {
            let resp: ChatCompletionResponse =
                serde_json::from_slice(body).map_err(|e| BridgeError::Malformed(provider_dialect, e.to_string()))?;
            let anthropic = openai_response_to_anthropic(&resp, trace_id);
            serde_json::to_vec(&anthropic).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))
        }
        _ => Err(BridgeError::Unsupported { from: provider_dialect, to: client_dialect }),
    }
}

/// Replays a converted non-stream response as an SSE stream shaped for the
/// client's own dialect, reusing the same non-stream→SSE simulation the
/// native same-dialect path uses for the cross-dialect `BufferedConvert` case.
pub fn simulate_stream_for_client(client_dialect: Dialect, converted_body: &[u8]) -> Result<Vec<Bytes>, BridgeError> {
    match client_dialect {
        Dialect::OpenAiChat => {
            let resp: ChatCompletionResponse =
                serde_json::from_slice(converted_body).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            Ok(simulate_openai_stream(&resp))
        }
        Dialect::Anthropic => {
            let resp: CreateMessageResponse =
                serde_json::from_slice(converted_body).map_err(|e| BridgeError::Malformed(client_dialect, e.to_string()))?;
            Ok(simulate_anthropic_stream(&resp))
        }
        Dialect::Gemini => {
            // Gemini has no SSE simulation contract of its own (connection
            // close signals end-of-stream); a single JSON-array chunk read
            // by `gemini_array_to_sse` upstream covers this case instead.
            Err(BridgeError::Unsupported { from: client_dialect, to: client_dialect })
        }
        Dialect::OpenAiResponses => Err(BridgeError::Unsupported { from: client_dialect, to: client_dialect }),
    }
}

/// Converts one upstream OpenAI-chat SSE chunk into a Gemini chunk, the
/// live per-event path `CallMode::LiveChunks` uses.
pub fn translate_live_chunk(openai_chunk_json: &str) -> Result<Bytes, BridgeError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(openai_chunk_json)
        .map_err(|e| BridgeError::Malformed(Dialect::OpenAiChat, e.to_string()))?;
    let gemini = openai_chunk_to_gemini(&chunk);
    let mut payload = serde_json::to_vec(&gemini).map_err(|e| BridgeError::Malformed(Dialect::Gemini, e.to_string()))?;
    payload.push(b'\n');
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_dialect_matches_platform() {
        assert_eq!(native_dialect(Platform::Claude), Dialect::Anthropic);
        assert_eq!(native_dialect(Platform::Codex), Dialect::OpenAiChat);
        assert_eq!(native_dialect(Platform::Picoclaw), Dialect::OpenAiChat);
        assert_eq!(native_dialect(Platform::GeminiCli), Dialect::Gemini);
    }

    #[test]
    fn call_mode_picks_buffered_for_openai_client_gemini_provider() {
        assert_eq!(call_mode(Dialect::OpenAiChat, Dialect::Gemini), Some(CallMode::BufferedConvert));
    }

    #[test]
    fn call_mode_picks_live_chunks_for_gemini_client_openai_provider() {
        assert_eq!(call_mode(Dialect::Gemini, Dialect::OpenAiChat), Some(CallMode::LiveChunks));
    }

    #[test]
    fn call_mode_none_for_unbridged_pair() {
        assert_eq!(call_mode(Dialect::Anthropic, Dialect::Gemini), None);
    }
}

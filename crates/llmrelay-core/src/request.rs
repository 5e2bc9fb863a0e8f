//! The shape the binary crate's router hands the dispatcher: one inbound
//! HTTP call, fully buffered, not yet attributed to any provider.

use bytes::Bytes;
use llmrelay_protocol::{Dialect, Platform};

/// One of the routes the router exposes, collapsed to the platform it
/// forwards to plus the wire dialect the body is shaped as and the upstream
/// path template to append to a provider's base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    AnthropicMessages,
    OpenAiChatCompletions,
    OpenAiResponses,
    GeminiGenerateContent,
    GeminiStreamGenerateContent,
    PicoclawChatCompletions,
}

impl Endpoint {
    pub fn platform(self) -> Platform {
        match self {
            Endpoint::AnthropicMessages => Platform::Claude,
            Endpoint::OpenAiChatCompletions | Endpoint::OpenAiResponses => Platform::Codex,
            Endpoint::GeminiGenerateContent | Endpoint::GeminiStreamGenerateContent => Platform::GeminiCli,
            Endpoint::PicoclawChatCompletions => Platform::Picoclaw,
        }
    }

    pub fn dialect(self) -> Dialect {
        match self {
            Endpoint::AnthropicMessages => Dialect::Anthropic,
            Endpoint::OpenAiChatCompletions | Endpoint::PicoclawChatCompletions => Dialect::OpenAiChat,
            Endpoint::OpenAiResponses => Dialect::OpenAiResponses,
            Endpoint::GeminiGenerateContent | Endpoint::GeminiStreamGenerateContent => Dialect::Gemini,
        }
    }

    /// Whether this endpoint's upstream call is inherently a stream
    /// (Gemini's two distinct methods encode this in the path itself).
    pub fn upstream_is_stream(self) -> bool {
        matches!(self, Endpoint::GeminiStreamGenerateContent)
    }

    /// Path appended to a provider's base URL for a local-dispatch attempt,
    /// given the model the request names (Gemini embeds it in the path).
    pub fn upstream_path(self, model: &str) -> String {
        match self {
            Endpoint::AnthropicMessages => "/v1/messages".to_string(),
            Endpoint::OpenAiChatCompletions | Endpoint::PicoclawChatCompletions => "/v1/chat/completions".to_string(),
            Endpoint::OpenAiResponses => "/responses".to_string(),
            Endpoint::GeminiGenerateContent => format!("/v1beta/models/{model}:generateContent"),
            Endpoint::GeminiStreamGenerateContent => format!("/v1beta/models/{model}:streamGenerateContent"),
        }
    }

    /// Unified gateway mode re-homes every platform to one of two paths.
    pub fn gateway_path(self) -> &'static str {
        match self {
            Endpoint::AnthropicMessages => "/v1/messages",
            _ => "/v1/chat/completions",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub method: String,
    pub path: String,
}

/// A fully-buffered inbound request, handed to the dispatcher by the
/// router. `model`/`stream` are parsed out of the body by the dispatcher
/// itself — the router's job ends at buffering the body and classifying
/// which endpoint was hit.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub endpoint: Endpoint,
    pub body: Bytes,
    /// `alt=sse` on a Gemini native endpoint.
    pub gemini_alt_sse: bool,
    pub headers: http::HeaderMap,
    pub meta: ClientMeta,
    /// The model name for dialects that carry it in the URL rather than the
    /// body (Gemini's `:generateContent`/`:streamGenerateContent` path
    /// segment). `None` for every other endpoint, which reads `model` out of
    /// the JSON body instead.
    pub path_model: Option<String>,
}

impl InboundRequest {
    pub fn platform(&self) -> Platform {
        self.endpoint.platform()
    }
}

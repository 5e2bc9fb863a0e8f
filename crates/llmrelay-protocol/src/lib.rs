//! Vendor wire-format structs for the dialects the gateway speaks, plus the
//! SSE line-parser shared by the streaming relay and the format translator.
//!
//! Everything here is a plain serde struct; no behavior lives in this crate
//! beyond `Platform`'s own small helpers. Translation and usage extraction
//! are implemented in `llmrelay-transform` over these types.

pub mod anthropic;
pub mod gemini;
pub mod openai_chat;
pub mod openai_responses;
pub mod sse;

use serde::{Deserialize, Serialize};

/// The inbound dialect classification used to pick which provider pool to
/// draw from — `claude`, `codex`, `gemini-cli`, `picoclaw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Claude,
    Codex,
    GeminiCli,
    Picoclaw,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::Codex => "codex",
            Platform::GeminiCli => "gemini-cli",
            Platform::Picoclaw => "picoclaw",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(Platform::Claude),
            "codex" => Some(Platform::Codex),
            "gemini-cli" => Some(Platform::GeminiCli),
            "picoclaw" => Some(Platform::Picoclaw),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown platform tag: {0}")]
pub struct UnknownPlatform(String);

impl std::str::FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Platform::parse(value).ok_or_else(|| UnknownPlatform(value.to_string()))
    }
}

/// Vendor wire dialect a request/response body is shaped as. Distinct from
/// `Platform`: a `codex` provider speaks `OpenAiChat`, a `picoclaw` provider
/// also speaks `OpenAiChat`, a `gemini-cli` provider speaks `Gemini`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Anthropic,
    OpenAiChat,
    OpenAiResponses,
    Gemini,
}

//! Unified gateway mode: when configured, every platform is
//! re-homed to one OpenAI-compatible endpoint before local dispatch is ever
//! consulted. Gemini-native requests are translated out to OpenAI shape and
//! the response translated back; every other platform already speaks (or is
//! treated as speaking) OpenAI shape.

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token: String,
}

impl GatewayConfig {
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

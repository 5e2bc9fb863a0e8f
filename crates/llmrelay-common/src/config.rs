use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged process configuration.
///
/// Merge order: CLI flag > environment variable > value persisted from a
/// previous run, then the merged result is persisted again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    pub dsn: String,
    pub data_dir: String,
    /// Round-robin mode when true; priority mode (always start at index 0) when false.
    pub round_robin: bool,
    /// Unified gateway mode: base URL of a single OpenAI-compatible endpoint
    /// all platforms are re-homed to, tried before local dispatch.
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub data_dir: Option<String>,
    pub round_robin: Option<bool>,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.round_robin.is_some() {
            self.round_robin = other.round_robin;
        }
        if other.gateway_url.is_some() {
            self.gateway_url = other.gateway_url;
        }
        if other.gateway_token.is_some() {
            self.gateway_token = other.gateway_token;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            data_dir: self.data_dir.unwrap_or_else(|| "./data".to_string()),
            round_robin: self.round_robin.unwrap_or(false),
            gateway_url: self.gateway_url,
            gateway_token: self.gateway_token,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            data_dir: Some(value.data_dir),
            round_robin: Some(value.round_robin),
            gateway_url: value.gateway_url,
            gateway_token: value.gateway_token,
        }
    }
}

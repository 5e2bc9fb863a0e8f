//! Flag/env layer feeding `llmrelay_common::GlobalConfigPatch`. Clap already
//! gives CLI > ENV precedence per field; `into_patch` is the only place that
//! knows how a `Cli` maps onto the shared config type.

use clap::Parser;
use llmrelay_common::GlobalConfigPatch;

#[derive(Debug, Clone, Parser)]
#[command(name = "llmrelay", version, about = "Multi-provider LLM gateway")]
pub struct Cli {
    /// Database DSN; defaults to a sqlite file under `--data-dir`.
    #[arg(long, env = "LLMRELAY_DSN")]
    pub dsn: Option<String>,

    /// Directory holding the default sqlite database (and the file-backend
    /// provider JSON, when that backend is selected).
    #[arg(long, env = "LLMRELAY_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Bind host.
    #[arg(long, env = "LLMRELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "LLMRELAY_PORT")]
    pub port: Option<u16>,

    /// Admin surface key, checked against `X-Admin-Key` / bearer / query param.
    #[arg(long, env = "LLMRELAY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Round-robin dispatch instead of always starting at the top priority.
    #[arg(long, env = "LLMRELAY_ROUND_ROBIN")]
    pub round_robin: bool,

    /// Unified gateway mode: base URL of a single OpenAI-compatible upstream
    /// tried before local dispatch.
    #[arg(long, env = "LLMRELAY_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    #[arg(long, env = "LLMRELAY_GATEWAY_TOKEN")]
    pub gateway_token: Option<String>,

    /// Provider repository backend. `sql` stores providers in the same
    /// database as the log; `file` keeps one JSON file per platform under
    /// `--data-dir`. Selection happens once, at startup.
    #[arg(long, env = "LLMRELAY_PROVIDER_BACKEND", default_value = "sql")]
    pub provider_backend: ProviderBackendKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum ProviderBackendKind {
    Sql,
    File,
}

impl Cli {
    pub fn into_patch(self, resolved_dsn: String, resolved_data_dir: String) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            dsn: Some(resolved_dsn),
            data_dir: Some(resolved_data_dir),
            round_robin: if self.round_robin { Some(true) } else { None },
            gateway_url: self.gateway_url,
            gateway_token: self.gateway_token,
        }
    }
}

//! Process entry point: the only place in the workspace that touches env
//! vars, CLI flags, signals, and the listener socket. Everything else is
//! wired in as an explicit constructor argument, one `main` since this
//! crate has no admin UI to nest.

mod cli;
mod data_dir;
mod dsn;
mod routes;
mod shutdown;
mod state;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use llmrelay_admin::AdminState;
use llmrelay_common::GlobalConfigPatch;
use llmrelay_core::gateway::GatewayConfig;
use llmrelay_core::upstream::WreqUpstreamClient;
use llmrelay_core::Dispatcher;
use llmrelay_provider::backend::FileProviderRepository;
use llmrelay_provider::{BreakerConfig, CircuitBreakerManager, ProviderRepository};
use llmrelay_storage::{
    connect, load_global_config, sync_schema, upsert_global_config, LogPipeline, SqlCircuitStore, SqlProviderRepository,
};
use tokio_util::sync::CancellationToken;

use cli::{Cli, ProviderBackendKind};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let data_dir = data_dir::resolve_data_dir(cli.data_dir.as_deref());
    let dsn = dsn::resolve_dsn(cli.dsn.as_deref(), &data_dir).context("resolve dsn")?;
    let provider_backend = cli.provider_backend;
    let admin_key = cli.admin_key.clone();

    let cli_patch = cli.into_patch(dsn.clone(), data_dir);

    let db = connect(&dsn).await.context("connect database")?;
    sync_schema(&db).await.context("sync database schema")?;

    let stored = load_global_config(&db).await.context("load persisted global config")?;
    let mut merged = stored.map(GlobalConfigPatch::from).unwrap_or_default();
    merged.overlay(cli_patch);
    let config = merged.into_config().context("finalize global config")?;
    upsert_global_config(&db, &config).await.context("persist merged global config")?;

    let admin_key = admin_key.unwrap_or_else(|| {
        let generated = llmrelay_common::new_trace_id();
        eprintln!("no --admin-key / LLMRELAY_ADMIN_KEY given, generated admin key: {generated}");
        generated
    });

    let repository: Arc<dyn ProviderRepository> = match provider_backend {
        ProviderBackendKind::Sql => Arc::new(SqlProviderRepository::new(db.clone())),
        ProviderBackendKind::File => {
            Arc::new(FileProviderRepository::open(config.data_dir.clone()).await.context("open file provider backend")?)
        }
    };

    let circuit_store = Arc::new(SqlCircuitStore::new(db.clone()));
    let breakers = Arc::new(
        CircuitBreakerManager::rehydrate(BreakerConfig::default(), circuit_store)
            .await
            .context("rehydrate circuit breaker state")?,
    );

    let shutdown_token = CancellationToken::new();
    let pipeline = Arc::new(LogPipeline::spawn(db.clone(), shutdown_token.clone()));

    let upstream = Arc::new(WreqUpstreamClient::new().context("build upstream http client")?);
    let gateway = match (&config.gateway_url, &config.gateway_token) {
        (Some(base_url), Some(token)) if !base_url.is_empty() && !token.is_empty() => {
            Some(GatewayConfig { base_url: base_url.clone(), token: token.clone() })
        }
        _ => None,
    };

    let dispatcher =
        Arc::new(Dispatcher::new(repository.clone(), breakers.clone(), upstream, pipeline.clone(), gateway, config.round_robin));

    let app_state = AppState {
        dispatcher,
        repository,
        breakers: breakers.clone(),
        db: db.clone(),
        started_at: time::OffsetDateTime::now_utc(),
        version: env!("CARGO_PKG_VERSION"),
    };

    let admin_state = AdminState { db: db.clone(), breakers, admin_key };

    let app = routes::router(app_state).nest("/admin", llmrelay_admin::router(admin_state));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "llmrelay listening");

    shutdown::spawn_signal_watcher(shutdown_token.clone());

    let serve_token = shutdown_token.clone();
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app).with_graceful_shutdown(serve_token.cancelled_owned()).await
    });

    // Runs indefinitely while healthy; once a signal cancels the token, stop
    // accepting and give in-flight requests up to 5s to finish before moving
    // on to draining the log pipeline regardless of stragglers.
    shutdown_token.cancelled().await;
    match tokio::time::timeout(std::time::Duration::from_secs(5), serve_task).await {
        Ok(Ok(result)) => result.context("serve")?,
        Ok(Err(join_err)) => tracing::warn!(error = %join_err, "server task panicked during shutdown"),
        Err(_) => tracing::warn!("graceful shutdown grace period elapsed with requests still in flight"),
    }

    // `axum::serve` only returns once every in-flight request has finished
    // (graceful shutdown above), so the dispatcher's clone of `pipeline` is
    // already gone by now; this is almost always the only strong reference.
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(pipeline) => tracing::warn!(refs = Arc::strong_count(&pipeline), "log pipeline outlived its requests, skipping drain"),
    }

    Ok(())
}

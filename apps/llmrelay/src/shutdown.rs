//! Graceful shutdown: `ctrl_c()` and `SIGTERM` both cancel one shared token,
//! observed by axum's own graceful-shutdown future and by the log
//! pipeline's drain.

use tokio_util::sync::CancellationToken;

pub fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
                std::future::pending::<()>().await;
                return;
            };
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
            _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
        }

        token.cancel();
    });
}

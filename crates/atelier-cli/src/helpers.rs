//! Shared startup helpers: tracing init and shutdown signal plumbing.

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Initialise tracing with `RUST_LOG` override and the given default
/// filter.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// A watch channel that flips to `true` on SIGINT or SIGTERM.
///
/// Long-running loops select on the receiver so a terminating process
/// marks its rows offline before exiting.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received");
        let _ = tx.send(true);
    });

    rx
}

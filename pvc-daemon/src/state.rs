//! Daemon shutdown state.
//!
//! TERM, INT and QUIT all trigger the same ordered shutdown; the flag is
//! global so loop threads can poll it and async code can await it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

static SHUTDOWN_LISTENERS: OnceLock<watch::Sender<bool>> = OnceLock::new();
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn shutdown_listeners() -> &'static watch::Sender<bool> {
    SHUTDOWN_LISTENERS.get_or_init(|| watch::channel(false).0)
}

/// Request an ordered shutdown.
pub fn request_shutdown() {
    if !SHUTDOWN_REQUESTED.swap(true, Ordering::Release) {
        let _ = shutdown_listeners().send(true);
    }
}

/// Whether a shutdown has been requested via a signal or
/// [`request_shutdown()`].
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// Finishes once a shutdown has been requested.
pub async fn shutdown_future() {
    let _ = shutdown_listeners().subscribe().wait_for(|&v| v).await;
}

/// Spawn tasks listening for TERM/INT/QUIT, each calling
/// [`request_shutdown()`].
pub fn catch_shutdown_signals() -> Result<(), Error> {
    for (kind, name) in [
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::quit(), "SIGQUIT"),
    ] {
        let mut stream = signal(kind)?;
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                info!("got shutdown request ({name})");
                request_shutdown();
            }
        });
    }
    Ok(())
}

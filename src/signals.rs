//! Shutdown signal handling
//!
//! The first SIGINT or SIGTERM cancels the returned token so the controller
//! can drain and release its lease. A second signal exits at once with
//! status 1.

use futures::{Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Exit status used when a second signal forces termination
pub const FORCED_EXIT_CODE: i32 = 1;

/// Install SIGINT/SIGTERM handlers and return the shutdown token
///
/// Must be called from within a tokio runtime.
pub fn setup_signal_handler() -> Result<CancellationToken> {
    let sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::internal_with_context(e.to_string(), "signals"))?;
    let sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::internal_with_context(e.to_string(), "signals"))?;

    let received = Box::pin(futures::stream::unfold(
        (sigint, sigterm),
        |(mut sigint, mut sigterm)| async move {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            Some((name, (sigint, sigterm)))
        },
    ));

    let token = CancellationToken::new();
    tokio::spawn(forward_signals(received, token.clone(), || {
        std::process::exit(FORCED_EXIT_CODE)
    }));
    Ok(token)
}

/// Cancel `token` on the first signal, call `force` on the second
pub async fn forward_signals<S, F>(mut signals: S, token: CancellationToken, force: F)
where
    S: Stream<Item = &'static str> + Unpin,
    F: FnOnce(),
{
    let Some(first) = signals.next().await else {
        return;
    };
    info!(signal = first, "Shutdown signal received, stopping");
    token.cancel();

    if let Some(second) = signals.next().await {
        warn!(signal = second, "Second shutdown signal received, exiting immediately");
        force();
    }
}

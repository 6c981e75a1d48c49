use std::sync::Arc;
use std::time::Duration;

use alyx_core::Supervisor;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::loader::ManifestLoader;

/// Watch the functions root and re-run the loader on changes.
///
/// Bursts of file events (editors, builds) coalesce into one reload per
/// debounce window.
pub fn start_watcher(
    loader: Arc<ManifestLoader>,
    supervisor: &Supervisor,
    debounce: Duration,
) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

    let mut watcher =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        // Full signal queue just means a reload is already due.
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => error!("manifest watcher error: {e}"),
            }
        })?;
    watcher.watch(loader.functions_dir(), RecursiveMode::Recursive)?;
    info!(dir = %loader.functions_dir().display(), "watching functions directory");

    let shutdown = supervisor.cancellation_token();
    supervisor.spawn(async move {
        // Moved in so the watcher lives as long as the loop.
        let _watcher = watcher;
        loop {
            tokio::select! {
                received = rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tokio::time::sleep(debounce).await;
                    while rx.try_recv().is_ok() {}
                    debug!("manifest change detected, reloading");
                    match loader.load_all() {
                        Ok(summary) if !summary.errors.is_empty() => {
                            for (function, reason) in &summary.errors {
                                error!(function = %function, reason = %reason, "manifest rejected on reload");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => error!("manifest reload failed: {e}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("manifest watcher shutting down");
                    break;
                }
            }
        }
    });
    Ok(())
}

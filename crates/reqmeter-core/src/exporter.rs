//! File exporter — background task that periodically writes the registry
//! to a file in the text exposition format.
//!
//! One exporter runs per started context. Each tick overwrites the file.
//! Write failures are retried on the next tick; after
//! [`MAX_FILE_WRITE_ERRORS`] consecutive failures the task gives up, since
//! an unmounted directory, missing permissions or a full disk will not fix
//! themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use prometheus::Registry;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MetricsResult;
use crate::exposition;

/// Consecutive write failures tolerated before the exporter stops.
pub const MAX_FILE_WRITE_ERRORS: u32 = 5;

/// Handle to a running export task.
pub struct FileExporter {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    path: PathBuf,
}

impl FileExporter {
    /// Spawn the export loop on the given runtime.
    pub fn spawn(runtime: &Handle, registry: Registry, path: PathBuf, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_path = path.clone();
        let handle = runtime.spawn(async move {
            run_export_loop(registry, loop_path, interval, shutdown_rx).await;
        });

        Self {
            handle,
            shutdown_tx,
            path,
        }
    }

    /// Whether the loop has exited (stopped or gave up).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and cancel the task without waiting for it.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        debug!(path = %self.path.display(), "metrics file exporter stopped");
    }
}

/// Write one snapshot of the registry to `path`, replacing its contents.
pub async fn write_snapshot(registry: &Registry, path: &Path) -> MetricsResult<()> {
    let bytes = exposition::encode(registry)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn run_export_loop(
    registry: Registry,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(path = %path.display(), interval_secs = interval.as_secs_f64(), "writing metrics to file");

    let mut error_count = 0u32;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                debug!(path = %path.display(), "updating metrics file");
                match write_snapshot(&registry, &path).await {
                    Ok(()) => error_count = 0,
                    Err(e) => {
                        error_count += 1;
                        error!(path = %path.display(), error = %e, error_count, "failed to write metrics to file");
                        if error_count >= MAX_FILE_WRITE_ERRORS {
                            warn!(path = %path.display(), error_count, "too many metrics file errors, giving up");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!(path = %path.display(), "metrics file exporter cancelled");
                break;
            }
        }
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::proxy::{PinnedKey, RunnerSlot};
use crate::rights::{self, HandoffError, wait_closed};

/// Owner side of the handoff: lends the local runner to one borrower at a
/// time and replaces it once the borrower is done.
pub struct Responder {
    path: PathBuf,
    leases: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Responder {
    /// Binds the handoff socket for `key` under `dir` and starts serving.
    pub fn start(runner: RunnerSlot, dir: &Path, key: &PinnedKey) -> Result<Self, HandoffError> {
        let path = key.socket_path(dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| HandoffError::Bind {
                path: path.clone(),
                source,
            })?;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale handoff socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(HandoffError::Bind { path, source }),
        }
        let listener = UnixListener::bind(&path).map_err(|source| HandoffError::Bind {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "handoff responder listening");

        let leases = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(serve(listener, runner, Arc::clone(&leases)));
        Ok(Self { path, leases, task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leases that ended with the runner reclaimed.
    pub fn leases_served(&self) -> u64 {
        self.leases.load(Ordering::SeqCst)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
        let _ = fs::remove_file(&self.path);
    }
}

const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after `failures` accept errors in a row.
fn accept_backoff(failures: u32) -> Duration {
    Duration::from_millis(10)
        .saturating_mul(1 << failures.min(10))
        .min(MAX_ACCEPT_BACKOFF)
}

async fn serve(listener: UnixListener, runner: RunnerSlot, leases: Arc<AtomicU64>) {
    let mut failures = 0;
    loop {
        let conn = match listener.accept().await {
            Ok((conn, _)) => {
                failures = 0;
                conn
            }
            Err(err) => {
                let pause = accept_backoff(failures);
                failures = failures.saturating_add(1);
                error!(error = %err, failures, ?pause, "can't accept handoff connection");
                tokio::time::sleep(pause).await;
                continue;
            }
        };
        match serve_lease(conn, &runner).await {
            Ok(()) => {
                let served = leases.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(served, "lease over");
            }
            Err(err) => warn!(error = %err, "handoff failed"),
        }
    }
}

/// Runs one lease to completion. The runner stays lent, and unusable by
/// local callers, until the borrower closes the connection.
async fn serve_lease(mut conn: UnixStream, runner: &RunnerSlot) -> Result<(), HandoffError> {
    {
        let mut runner = runner.lock().await;
        let fds = runner.lend().ok_or(HandoffError::NotReady)?;
        if let Err(err) = rights::offer(&conn, fds).await {
            runner.unlend();
            return Err(err);
        }
        info!(runner = %runner.identifier(), "runner lent");
    }

    wait_closed(&mut conn).await;

    let mut runner = runner.lock().await;
    runner.reclaim().await?;
    info!(
        runner = %runner.identifier(),
        generation = runner.generation(),
        "runner reclaimed"
    );
    Ok(())
}

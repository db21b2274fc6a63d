use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};
use xqueue::QueueError;

use crate::launcher::{RunnerIo, SpawnError};
use crate::protocol::{InvocationArgs, RunResult, RunnerReply};
use crate::runner::Runner;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("runner not ready")]
    NotReady,
    #[error("can't send args: {0}")]
    Send(#[source] QueueError),
    #[error("can't read data back: {0}")]
    Transport(#[source] QueueError),
    #[error(transparent)]
    Restart(#[from] SpawnError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Deadline<T> {
    Completed(T),
    TimedOut,
}

/// Races `work` against `budget`. On expiry the work future is dropped first
/// and `terminate` runs before `TimedOut` is returned, so nothing produced by
/// the work after that point can be observed.
pub async fn with_deadline<F, T>(
    budget: Duration,
    work: F,
    terminate: impl FnOnce(),
) -> Deadline<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(budget, work).await {
        Ok(value) => Deadline::Completed(value),
        Err(_) => {
            terminate();
            Deadline::TimedOut
        }
    }
}

/// Runs one call against `runner`. The caller holds the run lock for the
/// whole call, so output drained here belongs to this call only, and any
/// restart is finished before the lock is released.
pub async fn invoke(
    runner: &mut Runner,
    args: &InvocationArgs,
    budget: Duration,
) -> Result<RunResult, InvokeError> {
    if !runner.ensure_started().await? {
        return Err(InvokeError::NotReady);
    }
    let started = Instant::now();
    let (io, backend) = runner.parts().ok_or(InvokeError::NotReady)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Err(err) = io.queue.send(args).await {
        drain(io, &mut stdout, &mut stderr);
        warn!(
            error = %err,
            stdout = %String::from_utf8_lossy(&stdout),
            stderr = %String::from_utf8_lossy(&stderr),
            "can't send args, restarting runner"
        );
        runner.restart().await?;
        return Err(InvokeError::Send(err));
    }

    let outcome = with_deadline(budget, receive(io, &mut stdout, &mut stderr), || {
        backend.abort()
    })
    .await;
    drain(io, &mut stdout, &mut stderr);

    let mut result = match outcome {
        Deadline::Completed(Ok(reply)) => RunResult::completed(reply),
        Deadline::Completed(Err(QueueError::Closed)) => {
            debug!("runner exited mid-call");
            runner.restart().await?;
            RunResult::exited()
        }
        Deadline::Completed(Err(err)) => {
            warn!(error = %err, "runner transport failed, restarting runner");
            runner.restart().await?;
            return Err(InvokeError::Transport(err));
        }
        Deadline::TimedOut => {
            debug!(budget_ms = budget.as_millis() as u64, "call timed out");
            runner.restart().await?;
            RunResult::timed_out()
        }
    };
    result.stdout = String::from_utf8_lossy(&stdout).into_owned();
    result.stderr = String::from_utf8_lossy(&stderr).into_owned();
    result.time = started.elapsed().as_micros() as u64;
    Ok(result)
}

/// Waits for the reply, moving pipe output into the buffers meanwhile so a
/// chatty child can't fill a pipe and stall.
async fn receive(
    io: &mut RunnerIo,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
) -> Result<RunnerReply, QueueError> {
    let RunnerIo {
        queue,
        stdout: out,
        stderr: err,
    } = io;
    let reply = queue.recv::<RunnerReply>();
    tokio::pin!(reply);
    loop {
        tokio::select! {
            reply = &mut reply => return reply,
            res = out.pump(stdout), if !out.is_eof() => {
                if let Err(e) = res {
                    debug!(error = %e, "stdout capture failed");
                }
            }
            res = err.pump(stderr), if !err.is_eof() => {
                if let Err(e) = res {
                    debug!(error = %e, "stderr capture failed");
                }
            }
        }
    }
}

fn drain(io: &mut RunnerIo, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) {
    if let Err(err) = io.stdout.drain(stdout) {
        debug!(error = %err, "stdout capture failed");
    }
    if let Err(err) = io.stderr.drain(stderr) {
        debug!(error = %err, "stderr capture failed");
    }
}

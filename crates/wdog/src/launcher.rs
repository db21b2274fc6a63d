use std::env;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;
use xqueue::{Queue, QueueError};

use crate::capture::{Capture, capture_pipe};

/// Environment prefix the watchdog reads its own configuration from. Never
/// passed down to tenant code.
pub const CONFIG_ENV_PREFIX: &str = "SWD_";

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("can't make output pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("can't make queue: {0}")]
    Queue(#[from] QueueError),
    #[error("can't start runner {program}: {source}")]
    Process {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Descriptors the watchdog talks to a runner through.
pub struct RunnerIo {
    pub queue: Queue,
    pub stdout: Capture,
    pub stderr: Capture,
}

/// A freshly launched runner process.
pub struct Process {
    pub child: Child,
    pub io: RunnerIo,
}

pub trait Launcher: Send + Sync {
    /// Starts a runner; `suffix` selects a build variant of the function.
    fn launch(&self, suffix: Option<&str>) -> Result<Process, SpawnError>;
}

/// Spawns runners as children of this process.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    program: PathBuf,
    env: Vec<(String, String)>,
}

impl LocalExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            env: runner_env(),
        }
    }
}

impl Launcher for LocalExecutor {
    fn launch(&self, suffix: Option<&str>) -> Result<Process, SpawnError> {
        let (stdout, out_wr) = capture_pipe().map_err(SpawnError::Pipe)?;
        let (stderr, err_wr) = capture_pipe().map_err(SpawnError::Pipe)?;
        let (queue, peer) = Queue::pair()?;

        let inherited = [peer.as_raw_fd(), out_wr.as_raw_fd(), err_wr.as_raw_fd()];
        let mut command = Command::new(&self.program);
        command
            .arg(peer.id())
            .arg(out_wr.as_raw_fd().to_string())
            .arg(err_wr.as_raw_fd().to_string());
        if let Some(suffix) = suffix {
            command.arg(suffix);
        }
        command
            .env_clear()
            .envs(self.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // SAFETY: only fcntl runs between fork and exec.
        unsafe {
            command.pre_exec(move || {
                for fd in inherited {
                    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }
        let child = command.spawn().map_err(|source| SpawnError::Process {
            program: self.program.display().to_string(),
            source,
        })?;

        // The child holds its own copies now.
        drop((OwnedFd::from(peer), out_wr, err_wr));
        debug!(pid = child.id(), queue = queue.as_raw_fd(), "started runner");
        Ok(Process {
            child,
            io: RunnerIo {
                queue,
                stdout,
                stderr,
            },
        })
    }
}

fn runner_env() -> Vec<(String, String)> {
    env::vars()
        .filter(|(key, _)| !key.starts_with(CONFIG_ENV_PREFIX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let executor = LocalExecutor::new("/nonexistent/runner");
        let err = executor.launch(None).err().unwrap();
        assert!(matches!(err, SpawnError::Process { .. }), "{err}");
    }

    #[test]
    fn config_variables_are_filtered() {
        let env = runner_env();
        assert!(env.iter().all(|(key, _)| !key.starts_with(CONFIG_ENV_PREFIX)));
    }
}

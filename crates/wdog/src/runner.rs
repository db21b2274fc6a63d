use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::launcher::{Launcher, RunnerIo, SpawnError};
use crate::proxy::{PinnedKey, ProxyCache};

/// Ownership of a local runner's descriptors with respect to handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// Only this process uses the descriptors.
    Owned,
    /// The descriptors were handed to a borrower; this process must not
    /// touch them until the borrower disconnects.
    Lent,
    /// The borrower disconnected and a fresh child replaced the lent one.
    Reclaimed,
}

/// The live child process executing tenant code, plus its descriptors.
///
/// A `Runner` always sits behind the run lock; every method assumes the
/// caller holds it.
pub struct Runner {
    io: Option<RunnerIo>,
    backend: Backend,
    generation: u64,
}

pub(crate) enum Backend {
    Local(LocalChild),
    Proxy(ProxyLease),
}

pub(crate) struct LocalChild {
    launcher: Arc<dyn Launcher>,
    child: Child,
    suffix: Option<String>,
    lease: Lease,
}

/// Borrower side of a handoff.
pub(crate) struct ProxyLease {
    pub(crate) key: PinnedKey,
    pub(crate) id: u64,
    release: Option<oneshot::Sender<()>>,
    cache: Weak<ProxyCache>,
}

impl ProxyLease {
    pub(crate) fn new(
        key: PinnedKey,
        id: u64,
        release: oneshot::Sender<()>,
        cache: Weak<ProxyCache>,
    ) -> Self {
        Self {
            key,
            id,
            release: Some(release),
            cache,
        }
    }

    /// Ends the lease; the watcher task closes the control connection and
    /// the owner reclaims its child.
    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }
}

impl Backend {
    /// Deadline terminator: stop the child as fast as this side can.
    pub(crate) fn abort(&mut self) {
        match self {
            Backend::Local(local) => {
                if let Err(err) = local.child.start_kill() {
                    debug!(error = %err, "runner already gone");
                }
            }
            Backend::Proxy(lease) => lease.release(),
        }
    }
}

impl Runner {
    pub fn launch(launcher: Arc<dyn Launcher>, suffix: Option<String>) -> Result<Self, SpawnError> {
        let process = launcher.launch(suffix.as_deref())?;
        Ok(Self {
            io: Some(process.io),
            backend: Backend::Local(LocalChild {
                launcher,
                child: process.child,
                suffix,
                lease: Lease::Owned,
            }),
            generation: 0,
        })
    }

    pub(crate) fn borrowed(io: RunnerIo, lease: ProxyLease) -> Self {
        Self {
            io: Some(io),
            backend: Backend::Proxy(lease),
            generation: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        match &self.backend {
            Backend::Local(local) => self.io.is_some() && local.lease != Lease::Lent,
            Backend::Proxy(_) => self.io.is_some(),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.backend, Backend::Proxy(_))
    }

    /// Handoff state; `None` for a borrowed runner.
    pub fn lease(&self) -> Option<Lease> {
        match &self.backend {
            Backend::Local(local) => Some(local.lease),
            Backend::Proxy(_) => None,
        }
    }

    /// Number of times the underlying child was replaced.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.backend {
            Backend::Local(local) => local.child.id(),
            Backend::Proxy(_) => None,
        }
    }

    pub fn identifier(&self) -> String {
        match &self.backend {
            Backend::Local(local) => match local.child.id() {
                Some(pid) => format!("pid:{pid}"),
                None => "pid:-".to_owned(),
            },
            Backend::Proxy(lease) => format!("proxy:{}#{}", lease.key, lease.id),
        }
    }

    pub(crate) fn lease_id(&self) -> Option<u64> {
        match &self.backend {
            Backend::Proxy(lease) if self.io.is_some() => Some(lease.id),
            _ => None,
        }
    }

    pub(crate) fn parts(&mut self) -> Option<(&mut RunnerIo, &mut Backend)> {
        let Runner { io, backend, .. } = self;
        io.as_mut().map(|io| (io, backend))
    }

    /// Brings back a local runner whose last restart failed. Borrowed
    /// runners cannot be brought back by this process.
    pub(crate) async fn ensure_started(&mut self) -> Result<bool, SpawnError> {
        if self.io.is_none() && !self.is_proxy() {
            self.restart().await?;
        }
        Ok(self.is_ready())
    }

    /// Replaces the child: respawn locally, or give the lease back.
    pub async fn restart(&mut self) -> Result<(), SpawnError> {
        let Runner {
            io,
            backend,
            generation,
        } = self;
        match backend {
            Backend::Local(local) => {
                if let Err(err) = local.child.start_kill() {
                    debug!(error = %err, "runner exited before kill");
                }
                match local.child.wait().await {
                    Ok(status) => debug!(%status, "runner reaped"),
                    Err(err) => warn!(error = %err, "can't reap runner"),
                }
                *io = None;
                let process = local.launcher.launch(local.suffix.as_deref())?;
                local.child = process.child;
                *io = Some(process.io);
                *generation += 1;
                if local.lease == Lease::Lent {
                    local.lease = Lease::Reclaimed;
                }
                debug!(generation = *generation, pid = local.child.id(), "runner restarted");
            }
            Backend::Proxy(lease) => {
                if io.take().is_some() {
                    info!(key = %lease.key, lease = lease.id, "stopping borrowed runner");
                }
                lease.release();
                if let Some(cache) = lease.cache.upgrade() {
                    cache.evict(&lease.key, lease.id);
                }
            }
        }
        Ok(())
    }

    /// Kills a local child for good. Used for throw-away runners.
    pub async fn stop(&mut self) {
        self.io = None;
        match &mut self.backend {
            Backend::Local(local) => {
                let _ = local.child.start_kill();
                if let Err(err) = local.child.wait().await {
                    warn!(error = %err, "can't reap runner");
                }
            }
            Backend::Proxy(lease) => lease.release(),
        }
    }

    /// Marks the runner lent and returns its descriptors in handoff order:
    /// stdout, stderr, queue.
    pub(crate) fn lend(&mut self) -> Option<[RawFd; 3]> {
        if !self.is_ready() {
            return None;
        }
        let Backend::Local(local) = &mut self.backend else {
            return None;
        };
        let io = self.io.as_ref()?;
        local.lease = Lease::Lent;
        Some([
            io.stdout.as_raw_fd(),
            io.stderr.as_raw_fd(),
            io.queue.as_raw_fd(),
        ])
    }

    /// Undoes `lend` when the descriptors never left this process.
    pub(crate) fn unlend(&mut self) {
        if let Backend::Local(local) = &mut self.backend
            && local.lease == Lease::Lent
        {
            local.lease = Lease::Owned;
        }
    }

    /// Restarts a lent runner after its borrower disconnected.
    pub(crate) async fn reclaim(&mut self) -> Result<(), SpawnError> {
        let result = self.restart().await;
        if let Backend::Local(local) = &mut self.backend {
            // A failed respawn leaves no descriptors to lend; the next local
            // call retries it.
            local.lease = Lease::Reclaimed;
        }
        result
    }
}

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::net::UnixStream;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};
use xqueue::Queue;

use crate::capture::Capture;
use crate::launcher::RunnerIo;
use crate::rights::{self, HandoffError, wait_closed};
use crate::runner::{ProxyLease, Runner};

/// A runner behind its run lock.
pub type RunnerSlot = Arc<AsyncMutex<Runner>>;

/// Identity of a logical function instance: the pod token of the owning
/// instance and that instance's address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PinnedKey {
    token: String,
    addr: String,
}

impl PinnedKey {
    pub fn new(token: impl Into<String>, addr: impl Into<String>) -> Result<Self, HandoffError> {
        let token = token.into();
        let addr = addr.into();
        for part in [&token, &addr] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\0'])
            {
                return Err(HandoffError::BadKey(format!("{token}/{addr}")));
            }
        }
        Ok(Self { token, addr })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Where the owning instance listens for handoffs.
    pub fn socket_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.token).join(self.addr.replace(['.', ':'], "_"))
    }
}

impl fmt::Display for PinnedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.token, self.addr)
    }
}

struct CachedRunner {
    lease: u64,
    slot: RunnerSlot,
}

/// Runners borrowed from owning instances, one per pinned key.
pub struct ProxyCache {
    dir: PathBuf,
    runners: Mutex<HashMap<PinnedKey, CachedRunner>>,
    handshake: AsyncMutex<()>,
    next_lease: AtomicU64,
}

impl ProxyCache {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            runners: Mutex::new(HashMap::new()),
            handshake: AsyncMutex::new(()),
            next_lease: AtomicU64::new(1),
        })
    }

    fn runners(&self) -> MutexGuard<'_, HashMap<PinnedKey, CachedRunner>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, key: &PinnedKey) -> Option<RunnerSlot> {
        self.runners().get(key).map(|cached| Arc::clone(&cached.slot))
    }

    pub fn len(&self) -> usize {
        self.runners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached runner for `key`, borrowing one from its owner if
    /// there is none. Concurrent first requests for a key perform a single
    /// handshake.
    pub async fn resolve(self: &Arc<Self>, key: &PinnedKey) -> Result<RunnerSlot, HandoffError> {
        if let Some(slot) = self.lookup(key) {
            return Ok(slot);
        }
        let _handshake = self.handshake.lock().await;
        if let Some(slot) = self.lookup(key) {
            return Ok(slot);
        }

        info!(%key, "proxifying");
        let path = key.socket_path(&self.dir);
        let conn = UnixStream::connect(&path)
            .await
            .map_err(|source| HandoffError::Connect { path, source })?;
        let (_info, [stdout, stderr, queue]) = rights::accept(&conn).await?;
        let io = RunnerIo {
            queue: Queue::from_owned_fd(queue)?,
            stdout: Capture::new(stdout)?,
            stderr: Capture::new(stderr)?,
        };

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let (release, released) = oneshot::channel();
        let runner = Runner::borrowed(
            io,
            ProxyLease::new(key.clone(), lease, release, Arc::downgrade(self)),
        );
        let slot = Arc::new(AsyncMutex::new(runner));
        self.runners().insert(
            key.clone(),
            CachedRunner {
                lease,
                slot: Arc::clone(&slot),
            },
        );
        tokio::spawn(watch_lease(conn, released, Arc::downgrade(&slot), lease));
        Ok(slot)
    }

    /// Drops the entry for `key` if it still belongs to `lease`.
    pub(crate) fn evict(&self, key: &PinnedKey, lease: u64) {
        let mut runners = self.runners();
        if runners.get(key).is_some_and(|cached| cached.lease == lease) {
            runners.remove(key);
            debug!(%key, lease, "evicted borrowed runner");
        }
    }
}

/// Holds the control connection for the length of a lease. Dropping it on
/// release tells the owner to reclaim; the owner closing it first means the
/// owner is gone and the borrowed runner must not be used again.
async fn watch_lease(
    mut conn: UnixStream,
    released: oneshot::Receiver<()>,
    slot: Weak<AsyncMutex<Runner>>,
    lease: u64,
) {
    tokio::select! {
        _ = released => debug!(lease, "lease released"),
        _ = wait_closed(&mut conn) => {
            warn!(lease, "owner closed handoff connection");
            if let Some(slot) = slot.upgrade() {
                let mut runner = slot.lock().await;
                if runner.lease_id() == Some(lease)
                    && let Err(err) = runner.restart().await
                {
                    warn!(error = %err, lease, "can't drop borrowed runner");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_maps_to_socket_under_token_dir() {
        let key = PinnedKey::new("tok", "10.0.0.7:8687").unwrap();
        assert_eq!(
            key.socket_path(Path::new("/run/swd")),
            PathBuf::from("/run/swd/tok/10_0_0_7_8687")
        );
        assert_eq!(key.to_string(), "tok/10.0.0.7:8687");
    }

    #[test]
    fn key_parts_cannot_escape_the_directory() {
        for (token, addr) in [("..", "a"), ("a/b", "c"), ("t", ""), ("t", "x/../y")] {
            assert!(
                PinnedKey::new(token, addr).is_err(),
                "{token}/{addr} accepted"
            );
        }
    }

    #[tokio::test]
    async fn missing_owner_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProxyCache::new(dir.path());
        let key = PinnedKey::new("tok", "127.0.0.1").unwrap();
        let err = cache.resolve(&key).await.err().unwrap();
        assert!(matches!(err, HandoffError::Connect { .. }), "{err}");
        assert!(cache.is_empty());
    }
}

//! Descriptor transfer over a Unix-domain control connection.
//!
//! A handoff is one message: a small JSON envelope with `SCM_RIGHTS`
//! ancillary data carrying the runner's stdout pipe, stderr pipe and queue,
//! in that order. After it the connection only signals liveness; either side
//! closing it ends the lease.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use thiserror::Error;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::UnixStream;
use xqueue::QueueError;

use crate::launcher::SpawnError;
use crate::protocol::RunnerInfo;

/// Descriptors carried by one handoff.
pub const HANDOFF_FDS: usize = 3;
const MAX_ENVELOPE_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("can't bind handoff socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can't connect handoff socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("handoff io error: {0}")]
    Io(#[from] io::Error),
    #[error("handoff connection closed")]
    Closed,
    #[error("expected 3 descriptors, got {0}")]
    Descriptors(usize),
    #[error("handoff control data truncated")]
    Truncated,
    #[error("bad runner info: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("bad pinned key: {0}")]
    BadKey(String),
    #[error("runner not ready for handoff")]
    NotReady,
    #[error("can't open received queue: {0}")]
    Queue(#[from] QueueError),
    #[error("can't reclaim runner: {0}")]
    Reclaim(#[from] SpawnError),
}

/// Owner side: sends the envelope and the runner's descriptors.
pub async fn offer(conn: &UnixStream, fds: [RawFd; HANDOFF_FDS]) -> Result<(), HandoffError> {
    let payload = serde_json::to_vec(&RunnerInfo::default())?;
    send_rights(conn, &payload, &fds).await?;
    Ok(())
}

/// Borrower side: receives the envelope and takes ownership of the
/// descriptors. Anything received is closed again on every error path.
pub async fn accept(
    conn: &UnixStream,
) -> Result<(RunnerInfo, [OwnedFd; HANDOFF_FDS]), HandoffError> {
    let (payload, fds, truncated) = recv_rights(conn).await?;
    if payload.is_empty() && fds.is_empty() {
        return Err(HandoffError::Closed);
    }
    if truncated {
        return Err(HandoffError::Truncated);
    }
    let fds: [OwnedFd; HANDOFF_FDS] = fds
        .try_into()
        .map_err(|fds: Vec<OwnedFd>| HandoffError::Descriptors(fds.len()))?;
    let info = serde_json::from_slice(&payload)?;
    Ok((info, fds))
}

async fn send_rights(conn: &UnixStream, payload: &[u8], fds: &[RawFd]) -> io::Result<()> {
    loop {
        conn.writable().await?;
        let sent = conn.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(payload)];
            let cmsgs = [ControlMessage::ScmRights(fds)];
            sendmsg::<()>(conn.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match sent {
            Ok(n) if n == payload.len() => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short handoff write: {n} of {} bytes", payload.len()),
                ));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

async fn recv_rights(conn: &UnixStream) -> io::Result<(Vec<u8>, Vec<OwnedFd>, bool)> {
    let mut buf = vec![0u8; MAX_ENVELOPE_BYTES];
    loop {
        conn.readable().await?;
        let received = conn.try_io(Interest::READABLE, || {
            let mut cmsg = nix::cmsg_space!([RawFd; 3]);
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(
                conn.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(io::Error::from)?;
            let mut fds = Vec::new();
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(rights) = cmsg {
                    // SAFETY: the kernel just installed these descriptors in
                    // this process; nothing else refers to them yet.
                    fds.extend(
                        rights
                            .into_iter()
                            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                    );
                }
            }
            let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
            Ok((msg.bytes, fds, truncated))
        });
        match received {
            Ok((len, fds, truncated)) => {
                buf.truncate(len);
                return Ok((buf, fds, truncated));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Resolves once the peer closes the connection. Bytes read meanwhile are
/// liveness pings and carry no meaning.
pub(crate) async fn wait_closed(conn: &mut UnixStream) {
    let mut byte = [0u8; 1];
    loop {
        match conn.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

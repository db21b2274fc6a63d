//! Synchronous request/response channel between a watchdog and its runner.
//!
//! A queue is one end of a connected `AF_UNIX` stream socket pair. Messages
//! are JSON documents framed by a 4-byte big-endian length. The watchdog side
//! ([`Queue`]) is async; runner processes use [`blocking::Endpoint`].

pub mod blocking;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed by peer")]
    Closed,
    #[error("queue io error: {0}")]
    Io(#[from] io::Error),
    #[error("encode message error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode message error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("bad queue id {0:?}")]
    BadId(String),
}

impl QueueError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Watchdog end of a queue.
#[derive(Debug)]
pub struct Queue {
    sk: UnixStream,
}

/// The child end of a freshly created queue, to be inherited by a runner.
#[derive(Debug)]
pub struct QueuePeer {
    fd: OwnedFd,
}

impl QueuePeer {
    /// Queue id as the runner sees it: the inherited descriptor number.
    pub fn id(&self) -> String {
        self.fd.as_raw_fd().to_string()
    }
}

impl AsRawFd for QueuePeer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<QueuePeer> for OwnedFd {
    fn from(peer: QueuePeer) -> Self {
        peer.fd
    }
}

impl Queue {
    /// Creates a connected pair. Both descriptors are close-on-exec; the
    /// launcher decides which one a child inherits.
    pub fn pair() -> Result<(Self, QueuePeer), QueueError> {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
        let queue = Self::from_std(ours)?;
        Ok((
            queue,
            QueuePeer {
                fd: OwnedFd::from(theirs),
            },
        ))
    }

    /// Wraps a descriptor received from another process.
    pub fn from_owned_fd(fd: OwnedFd) -> Result<Self, QueueError> {
        Self::from_std(std::os::unix::net::UnixStream::from(fd))
    }

    fn from_std(sk: std::os::unix::net::UnixStream) -> Result<Self, QueueError> {
        sk.set_nonblocking(true)?;
        Ok(Self {
            sk: UnixStream::from_std(sk)?,
        })
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(msg).map_err(QueueError::Encode)?;
        self.send_bytes(&payload).await
    }

    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        let header = frame_header(payload.len())?;
        self.sk.write_all(&header).await.map_err(map_write_err)?;
        self.sk.write_all(payload).await.map_err(map_write_err)?;
        self.sk.flush().await.map_err(map_write_err)
    }

    /// Receives one message. Not cancel-safe: a partially read frame is lost
    /// if the future is dropped, so callers must discard the queue then.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, QueueError> {
        let payload = self.recv_bytes().await?;
        serde_json::from_slice(&payload).map_err(QueueError::Decode)
    }

    pub async fn recv_bytes(&mut self) -> Result<Vec<u8>, QueueError> {
        let mut header = [0u8; 4];
        self.sk.read_exact(&mut header).await.map_err(map_read_err)?;
        let len = frame_len(header)?;
        let mut payload = vec![0u8; len];
        self.sk
            .read_exact(&mut payload)
            .await
            .map_err(map_read_err)?;
        Ok(payload)
    }
}

impl AsRawFd for Queue {
    fn as_raw_fd(&self) -> RawFd {
        self.sk.as_raw_fd()
    }
}

pub(crate) fn frame_header(len: usize) -> Result<[u8; 4], QueueError> {
    if len > MAX_FRAME_BYTES {
        return Err(QueueError::FrameTooLarge(len));
    }
    Ok((len as u32).to_be_bytes())
}

pub(crate) fn frame_len(header: [u8; 4]) -> Result<usize, QueueError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(QueueError::FrameTooLarge(len));
    }
    Ok(len)
}

pub(crate) fn map_read_err(err: io::Error) -> QueueError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => QueueError::Closed,
        _ => QueueError::Io(err),
    }
}

pub(crate) fn map_write_err(err: io::Error) -> QueueError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => QueueError::Closed,
        _ => QueueError::Io(err),
    }
}

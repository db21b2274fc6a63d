use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{QueueError, frame_header, frame_len, map_read_err, map_write_err};

/// Runner end of a queue. Blocking; one request in flight at a time.
pub struct Endpoint {
    sk: UnixStream,
}

impl Endpoint {
    /// Opens the queue a runner inherited; `id` is the descriptor number the
    /// watchdog passed on the command line.
    ///
    /// # Safety
    ///
    /// `id` must name a descriptor this process owns and nothing else uses.
    pub unsafe fn open(id: &str) -> Result<Self, QueueError> {
        let fd: RawFd = id
            .parse()
            .map_err(|_| QueueError::BadId(id.to_owned()))?;
        if fd < 0 {
            return Err(QueueError::BadId(id.to_owned()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_owned_fd(fd))
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            sk: UnixStream::from(fd),
        }
    }

    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(msg).map_err(QueueError::Encode)?;
        let header = frame_header(payload.len())?;
        self.sk.write_all(&header).map_err(map_write_err)?;
        self.sk.write_all(&payload).map_err(map_write_err)?;
        self.sk.flush().map_err(map_write_err)
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, QueueError> {
        let mut header = [0u8; 4];
        self.sk.read_exact(&mut header).map_err(map_read_err)?;
        let mut payload = vec![0u8; frame_len(header)?];
        self.sk.read_exact(&mut payload).map_err(map_read_err)?;
        serde_json::from_slice(&payload).map_err(QueueError::Decode)
    }
}

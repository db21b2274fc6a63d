use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::pipe2;
use tokio::io::unix::AsyncFd;

const CHUNK: usize = 4096;

/// Read end of a runner's stdout or stderr pipe.
pub struct Capture {
    fd: AsyncFd<File>,
    eof: bool,
}

/// Creates a pipe whose read end is wrapped for capture. Both ends are
/// close-on-exec; the write end is returned for the launcher to hand over.
pub fn capture_pipe() -> io::Result<(Capture, OwnedFd)> {
    let (rd, wr) = pipe2(OFlag::O_CLOEXEC)?;
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(rd), OwnedFd::from_raw_fd(wr)) };
    Ok((Capture::new(rd)?, wr))
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    fcntl(
        fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

impl Capture {
    /// Wraps a pipe read end, which may have been received from another
    /// process. Switches it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::new(File::from(fd))?,
            eof: false,
        })
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Appends whatever is buffered in the pipe right now. A hard read error
    /// ends the capture like EOF does.
    pub fn drain(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        let mut chunk = [0u8; CHUNK];
        loop {
            match self.fd.get_ref().read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.eof = true;
                    return Err(err);
                }
            }
        }
    }

    /// Waits until the pipe is readable, then drains it.
    pub async fn pump(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        let mut guard = self.fd.readable().await?;
        guard.clear_ready();
        drop(guard);
        self.drain(buf)
    }
}

impl AsRawFd for Capture {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

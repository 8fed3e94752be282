//! Pipe primitives for worker communication.
//!
//! Provides a close-on-exec pipe pair plus a file-descriptor wrapper with
//! EINTR handling, suitable for buffered stream I/O.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// Buffer size for the framed streams layered on top of a pipe (64KB).
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// One unidirectional OS pipe.
///
/// Both ends carry `O_CLOEXEC`; the end handed to a child is remapped by the
/// launcher, which clears the flag on the child's copy.
pub struct Pipe {
    /// The end data is read from.
    pub read: OwnedFd,
    /// The end data is written to.
    pub write: OwnedFd,
}

impl Pipe {
    /// Open a fresh pipe.
    pub fn new() -> io::Result<Self> {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(Self { read, write })
    }
}

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

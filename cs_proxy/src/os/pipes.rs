//! Unix `pipe` wrapper

use std::{
    io::{self, ErrorKind, Read, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use nix::unistd::{pipe, read, write};

use crate::Error;

/// A unidirectional pipe pair. Each end can be closed or handed off
/// independently, which the forkserver needs when splitting the pair
/// between the proxy and the spawned child.
#[derive(Debug)]
pub struct Pipe {
    read_end: Option<OwnedFd>,
    write_end: Option<OwnedFd>,
}

impl Pipe {
    /// Create a new [`Pipe`]
    pub fn new() -> Result<Self, Error> {
        let (read_end, write_end) = pipe()?;
        Ok(Self {
            read_end: Some(read_end),
            write_end: Some(write_end),
        })
    }

    /// The raw read fd, if the read end is still held
    #[must_use]
    pub fn read_end(&self) -> Option<RawFd> {
        self.read_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// The raw write fd, if the write end is still held
    #[must_use]
    pub fn write_end(&self) -> Option<RawFd> {
        self.write_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Hand off ownership of the read end
    pub fn take_read_end(&mut self) -> Option<OwnedFd> {
        self.read_end.take()
    }

    /// Hand off ownership of the write end
    pub fn take_write_end(&mut self) -> Option<OwnedFd> {
        self.write_end.take()
    }

    /// Close the read end
    pub fn close_read_end(&mut self) {
        // OwnedFd closes on drop
        self.read_end = None;
    }

    /// Close the write end
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }
}

impl Read for Pipe {
    /// Reads a few bytes
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match &self.read_end {
            Some(read_end) => match read(read_end.as_raw_fd(), buf) {
                Ok(res) => Ok(res),
                Err(e) => Err(io::Error::from(e)),
            },
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "Read pipe end was already closed",
            )),
        }
    }
}

impl Write for Pipe {
    /// Writes a few bytes
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match &self.write_end {
            Some(write_end) => match write(write_end, buf) {
                Ok(res) => Ok(res),
                Err(e) => Err(io::Error::from(e)),
            },
            None => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "Write pipe end was already closed",
            )),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

//! The 4-byte message exchange at the heart of the forkserver protocol.
//!
//! Every value on the wire is exactly four bytes in the host's native
//! integer layout. Meaning is positional: upstream sends control tokens,
//! the proxy answers with a pid word followed by a wait-status word. A
//! short read (including end-of-file) or short write means the peer died;
//! callers escalate that to a fatal exit, there is no partial-message
//! recovery.

use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::unistd::{read, write};

use crate::Error;

/// Control descriptor the invoking fuzzer hands us, by AFL convention.
/// `FORKSRV_FD + 1` is the matching status descriptor.
pub const FORKSRV_FD: RawFd = 198;

/// Control descriptor slot the spawned child sees for the downstream pair.
/// `PROXY_FORKSRV_FD + 1` is the child's status write slot. Offset from the
/// upstream pair so both can coexist in the child before it closes ours.
pub const PROXY_FORKSRV_FD: RawFd = FORKSRV_FD - 3;

/// Size of a wire message in bytes.
pub const MSG_SIZE: usize = 4;

/// Receive one message, blocking. Anything but a full message is an error.
pub fn read_msg<F: AsFd>(fd: F) -> Result<u32, Error> {
    let mut buf = [0u8; MSG_SIZE];
    let bytes_read = read(fd.as_fd().as_raw_fd(), &mut buf)?;
    if bytes_read != MSG_SIZE {
        return Err(Error::illegal_state(format!(
            "short read: expected {MSG_SIZE} bytes, got {bytes_read}"
        )));
    }
    Ok(u32::from_ne_bytes(buf))
}

/// Send one message, blocking. Anything but a full message is an error.
pub fn write_msg<F: AsFd>(fd: F, msg: u32) -> Result<(), Error> {
    let buf = msg.to_ne_bytes();
    let bytes_written = write(fd, &buf)?;
    if bytes_written != MSG_SIZE {
        return Err(Error::illegal_state(format!(
            "short write: expected {MSG_SIZE} bytes, wrote {bytes_written}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::{signal, SigHandler, Signal};

    use super::{read_msg, write_msg};
    use crate::os::pipes::Pipe;

    #[test]
    fn message_roundtrip() {
        let mut pipe = Pipe::new().unwrap();
        let tx = pipe.take_write_end().unwrap();
        let rx = pipe.take_read_end().unwrap();
        write_msg(&tx, 0xdead_beef).unwrap();
        write_msg(&tx, 0).unwrap();
        assert_eq!(read_msg(&rx).unwrap(), 0xdead_beef);
        assert_eq!(read_msg(&rx).unwrap(), 0);
    }

    #[test]
    fn eof_is_a_short_read() {
        let mut pipe = Pipe::new().unwrap();
        let rx = pipe.take_read_end().unwrap();
        pipe.close_write_end();
        assert!(read_msg(&rx).is_err());
    }

    #[test]
    fn dead_peer_write_is_an_error() {
        // Keep EPIPE an error return instead of a process kill.
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.unwrap();
        let mut pipe = Pipe::new().unwrap();
        let tx = pipe.take_write_end().unwrap();
        pipe.close_read_end();
        assert!(write_msg(&tx, 0).is_err());
    }
}

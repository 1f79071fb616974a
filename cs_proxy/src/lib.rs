//! A forkserver proxy for fuzzing with ARM CoreSight instruction tracing.
//!
//! The proxy sits between an AFL-style fuzzer and the target under test.
//! Per execution it relays the fuzzer's control token downstream, obtains a
//! fresh child (or resumes a stopped one in persistent mode), brackets the
//! run with the hardware tracer's start/stop hooks, and relays the child's
//! identity and wait status back upstream over the classic 4-byte pipe
//! protocol.
//!
//! Anomalies are never recovered from: every failure point terminates the
//! process with a distinct exit code (see [`forkserver::Fatal`]) so the
//! supervising fuzzer can tell the failure stages apart.

use core::fmt;

pub mod boards;
pub mod config;
pub mod forkserver;
pub mod message;
pub mod os;
pub mod shmem;
pub mod trace;

/// Main error enum for the proxy library.
#[derive(Debug)]
pub enum Error {
    /// An OS call went wrong
    Os(nix::errno::Errno),
    /// You're holding it wrong
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String),
}

impl Error {
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }

    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Os(errno) => write!(f, "OS error: {errno}"),
            Error::IllegalState(s) => write!(f, "Illegal state: {s}"),
            Error::IllegalArgument(s) => write!(f, "Illegal argument: {s}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Os(err)
    }
}

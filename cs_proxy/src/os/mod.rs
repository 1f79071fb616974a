//! Thin wrappers over the process primitives the proxy needs.

use libc::pid_t;

use crate::Error;

pub mod pipes;

/// Child Process Handle
#[derive(Debug)]
pub struct ChildHandle {
    /// The pid of the child
    pub pid: pid_t,
}

/// The `ForkResult` (result of a fork)
#[derive(Debug)]
pub enum ForkResult {
    /// The fork finished, we are the parent process.
    /// The child has the handle `ChildHandle`.
    Parent(ChildHandle),
    /// The fork finished, we are the child process.
    Child,
}

/// Unix has forks.
///
/// # Safety
/// A normal fork. Runs on in two processes. Should be memory safe in general.
pub unsafe fn fork() -> Result<ForkResult, Error> {
    match libc::fork() {
        pid if pid > 0 => Ok(ForkResult::Parent(ChildHandle { pid })),
        pid if pid < 0 => Err(Error::Os(nix::errno::Errno::last())),
        _ => Ok(ForkResult::Child),
    }
}

//! The `cs_proxy` binary: forkserver proxy between an AFL-style fuzzer
//! and a CoreSight-traced target.
//!
//! Usage: `cs_proxy <target> [args...]`, invoked by the fuzzer with the
//! forkserver descriptor pair already in place.

use std::{
    env,
    ffi::CString,
    os::fd::{FromRawFd, OwnedFd},
    process,
};

use cs_proxy::{
    config::{DEBUG_ENV_VAR, ProxyConfig},
    forkserver::{Fatal, Session, UnixChildControl},
    message::FORKSRV_FD,
    shmem::CoverageMap,
    Error,
};
#[cfg(feature = "coresight")]
use cs_proxy::trace::CoreSightTracer;
#[cfg(not(feature = "coresight"))]
use cs_proxy::trace::NullTracer;
use nix::fcntl::{fcntl, FcntlArg};

fn main() {
    let default_level = if env::var_os(DEBUG_ENV_VAR).is_some() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let fatal = proxy_main();
    log::error!("{fatal}");
    process::exit(fatal.exit_code());
}

/// Returns only on a fatal condition; the loop itself never ends.
fn proxy_main() -> Fatal {
    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => return Fatal::Precondition(e),
    };

    let argv = match target_argv() {
        Ok(argv) => argv,
        Err(e) => return Fatal::Precondition(e),
    };

    // Resolved once; stays attached for the whole session.
    let coverage = match CoverageMap::from_config(&config) {
        Ok(map) => map,
        Err(e) => return Fatal::Precondition(e),
    };
    if !coverage.is_shared() {
        log::warn!("no coverage map id in the environment, coverage will not be observed");
    }

    let (ctl, st) = match upstream_channel() {
        Ok(fds) => fds,
        Err(e) => return Fatal::Precondition(e),
    };

    let mut session = match Session::spawn(ctl, st, &argv, config.persistent) {
        Ok(session) => session,
        Err(fatal) => return fatal,
    };
    if let Err(fatal) = session.handshake() {
        return fatal;
    }

    #[cfg(feature = "coresight")]
    let mut tracer = CoreSightTracer::new();
    #[cfg(not(feature = "coresight"))]
    let mut tracer = {
        log::warn!("built without the coresight feature, trace hooks are no-ops");
        NullTracer
    };

    match session.run(&mut tracer, &mut UnixChildControl) {
        Ok(never) => match never {},
        Err(fatal) => fatal,
    }
}

/// The target command line is our own argv, minus the proxy itself.
fn target_argv() -> Result<Vec<CString>, Error> {
    let argv: Vec<CString> = env::args()
        .skip(1)
        .map(|arg| {
            CString::new(arg).map_err(|_| Error::illegal_argument("NUL byte in target argv"))
        })
        .collect::<Result<_, _>>()?;
    if argv.is_empty() {
        return Err(Error::illegal_argument(
            "usage: cs_proxy <target> [args...]",
        ));
    }
    Ok(argv)
}

/// Claim the fuzzer-established descriptor pair, after checking the
/// descriptors are actually open rather than assuming the magic numbers.
fn upstream_channel() -> Result<(OwnedFd, OwnedFd), Error> {
    for fd in [FORKSRV_FD, FORKSRV_FD + 1] {
        fcntl(fd, FcntlArg::F_GETFD).map_err(|e| {
            Error::illegal_state(format!("upstream descriptor {fd} is not open: {e}"))
        })?;
    }
    let ctl = unsafe { OwnedFd::from_raw_fd(FORKSRV_FD) };
    let st = unsafe { OwnedFd::from_raw_fd(FORKSRV_FD + 1) };
    Ok((ctl, st))
}

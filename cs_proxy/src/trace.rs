//! Hooks into the hardware trace session.
//!
//! The trace subsystem itself (device topology, sink selection, decoding)
//! lives outside this crate. The control loop only ever brackets a single
//! execution: start capturing for a pid, stop, then check whether the
//! capture came out unusable and the run must be rerun. `stop` is called
//! exactly once per `start`, and the rerun flag is read immediately after
//! `stop` returns.

use nix::unistd::Pid;

/// One execution's worth of trace bracketing.
pub trait Tracer {
    /// Begin capturing for `pid`. The control loop ignores problems here,
    /// a broken capture surfaces through [`Tracer::rerun_required`].
    fn start(&mut self, pid: Pid);

    /// Stop the capture started by the last [`Tracer::start`].
    fn stop(&mut self);

    /// Whether the last capture is invalid and its status must not be
    /// trusted. Only meaningful right after [`Tracer::stop`].
    fn rerun_required(&self) -> bool;
}

/// Tracer that does nothing. Stands in when the proxy is built without
/// the CoreSight hooks linked, and in tests.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn start(&mut self, _pid: Pid) {}

    fn stop(&mut self) {}

    fn rerun_required(&self) -> bool {
        false
    }
}

#[cfg(feature = "coresight")]
mod coresight {
    use nix::unistd::Pid;

    use super::Tracer;

    #[allow(non_upper_case_globals)]
    extern "C" {
        fn afl_start_trace(pid: libc::pid_t);
        fn afl_stop_trace();
        static mut needs_rerun: bool;
    }

    /// Adapter over the external CoreSight trace session.
    #[derive(Debug, Default)]
    pub struct CoreSightTracer {
        rerun: bool,
    }

    impl CoreSightTracer {
        /// Create the adapter. The trace subsystem must already be
        /// configured for the board.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Tracer for CoreSightTracer {
        fn start(&mut self, pid: Pid) {
            self.rerun = false;
            unsafe {
                afl_start_trace(pid.as_raw());
            }
        }

        fn stop(&mut self) {
            // Latch the flag here so it refers to the capture we just
            // closed, then reset the external side.
            unsafe {
                afl_stop_trace();
                self.rerun = needs_rerun;
                needs_rerun = false;
            }
        }

        fn rerun_required(&self) -> bool {
            self.rerun
        }
    }
}

#[cfg(feature = "coresight")]
pub use coresight::CoreSightTracer;

//! The forkserver control loop and the target spawner.
//!
//! One [`Session`] lives for the lifetime of the proxy process. It spawns
//! the target once, then per iteration: relays the fuzzer's control token
//! downstream, obtains a fresh child pid (or resumes a stopped child in
//! persistent mode), brackets the execution with the tracer, and relays
//! pid and wait status back upstream. Any anomaly terminates the process;
//! the supervising fuzzer restarts the whole forkserver.

use std::{
    convert::Infallible,
    ffi::CString,
    os::fd::OwnedFd,
    process,
};

use nix::{
    sys::{signal, signal::Signal, wait::waitpid},
    unistd::{close, dup2, execvp, Pid},
};

use crate::{
    message::{read_msg, write_msg, FORKSRV_FD, PROXY_FORKSRV_FD},
    os::{fork, pipes::Pipe, ForkResult},
    trace::Tracer,
    Error,
};

/// Status word substituted when the trace capture was invalid. Never
/// reported upstream, the session dies first.
pub const RERUN_STATUS_SENTINEL: u32 = u32::MAX;

/// A fatal condition. There is no local recovery anywhere in the proxy:
/// each failure point exits the process with its own stable code so the
/// supervising fuzzer can diagnose the stage from the exit status alone.
///
/// | code | stage |
/// |------|-------|
/// | 1    | environment precondition violated, coverage map attach failed, or bad invocation |
/// | 2    | upstream control read failed |
/// | 3    | downstream control write failed |
/// | 4    | downstream pid read failed |
/// | 5    | upstream pid write failed |
/// | 6    | downstream status read failed |
/// | 7    | upstream status write failed |
/// | 8    | reap of a parked child failed |
/// | 9    | trace capture invalid, rerun required |
/// | 12   | persistent-mode contract violation |
/// | 13   | downstream pipe creation failed |
/// | 14   | fork failed |
/// | 15   | descriptor rewire failed in the child |
/// | 16   | handshake downstream read failed |
/// | 17   | handshake upstream write failed |
#[derive(Debug)]
pub enum Fatal {
    /// Startup validation failed
    Precondition(Error),
    /// The upstream fuzzer stopped sending control tokens
    UpstreamControlRead(Error),
    /// The downstream control channel is gone
    DownstreamControlWrite(Error),
    /// No child identity arrived on the downstream status channel
    DownstreamPidRead(Error),
    /// The upstream fuzzer stopped accepting pid reports
    UpstreamPidWrite(Error),
    /// No wait status arrived on the downstream status channel
    DownstreamStatusRead(Error),
    /// The upstream fuzzer stopped accepting status reports
    UpstreamStatusWrite(Error),
    /// Waiting for a killed parked child failed
    ReapParkedChild(Error),
    /// The trace capture is unusable and the status cannot be trusted
    TraceRerun,
    /// Persistent mode was requested but the target never parked itself
    PersistentContract,
    /// Creating the downstream pipe pair failed
    CreatePipes(Error),
    /// Forking the target failed
    Fork(Error),
    /// The child could not move the pipe ends onto the fixed slots
    RewireDescriptors(Error),
    /// The spawned target never reported in
    HandshakeRead(Error),
    /// The upstream fuzzer did not accept the handshake
    HandshakeWrite(Error),
}

impl Fatal {
    /// The stable process exit code for this failure stage.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Fatal::Precondition(_) => 1,
            Fatal::UpstreamControlRead(_) => 2,
            Fatal::DownstreamControlWrite(_) => 3,
            Fatal::DownstreamPidRead(_) => 4,
            Fatal::UpstreamPidWrite(_) => 5,
            Fatal::DownstreamStatusRead(_) => 6,
            Fatal::UpstreamStatusWrite(_) => 7,
            Fatal::ReapParkedChild(_) => 8,
            Fatal::TraceRerun => 9,
            Fatal::PersistentContract => 12,
            Fatal::CreatePipes(_) => 13,
            Fatal::Fork(_) => 14,
            Fatal::RewireDescriptors(_) => 15,
            Fatal::HandshakeRead(_) => 16,
            Fatal::HandshakeWrite(_) => 17,
        }
    }
}

impl core::fmt::Display for Fatal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fatal::Precondition(e) => write!(f, "startup precondition failed: {e}"),
            Fatal::UpstreamControlRead(e) => write!(f, "reading control token failed: {e}"),
            Fatal::DownstreamControlWrite(e) => write!(f, "forwarding control token failed: {e}"),
            Fatal::DownstreamPidRead(e) => write!(f, "reading child pid failed: {e}"),
            Fatal::UpstreamPidWrite(e) => write!(f, "reporting child pid failed: {e}"),
            Fatal::DownstreamStatusRead(e) => write!(f, "reading child status failed: {e}"),
            Fatal::UpstreamStatusWrite(e) => write!(f, "reporting child status failed: {e}"),
            Fatal::ReapParkedChild(e) => write!(f, "reaping parked child failed: {e}"),
            Fatal::TraceRerun => write!(f, "failed to retrieve coverage, rerun required"),
            Fatal::PersistentContract => write!(f, "no persistent iteration executed"),
            Fatal::CreatePipes(e) => write!(f, "pipe() failed: {e}"),
            Fatal::Fork(e) => write!(f, "fork() failed: {e}"),
            Fatal::RewireDescriptors(e) => write!(f, "dup2() failed: {e}"),
            Fatal::HandshakeRead(e) => write!(f, "handshake read failed: {e}"),
            Fatal::HandshakeWrite(e) => write!(f, "handshake write failed: {e}"),
        }
    }
}

/// Where the one in-flight child currently is. Parking and waking are
/// explicit states here, not implicit signal side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// No live child is tracked; the next iteration reads a fresh pid
    Gone,
    /// The child is executing (or about to, once resumed)
    Running(Pid),
    /// The child stopped itself after a persistent iteration and waits
    /// for a continue signal
    Parked(Pid),
}

/// Signal-level control over the in-flight child. A seam so the control
/// loop can be driven in tests without real processes.
pub trait ChildControl {
    /// Wake `pid` with a continue signal. Failures are not acted upon;
    /// a dead child surfaces through the downstream status channel.
    fn resume(&mut self, pid: Pid);

    /// Block until the killed, parked `pid` is reaped.
    fn reap(&mut self, pid: Pid) -> Result<(), Error>;
}

/// The production [`ChildControl`], backed by `kill` and `waitpid`.
#[derive(Debug, Default)]
pub struct UnixChildControl;

impl ChildControl for UnixChildControl {
    fn resume(&mut self, pid: Pid) {
        if let Err(e) = signal::kill(pid, Signal::SIGCONT) {
            log::debug!("SIGCONT to {pid} failed: {e}");
        }
    }

    fn reap(&mut self, pid: Pid) -> Result<(), Error> {
        waitpid(pid, None)?;
        Ok(())
    }
}

/// One forkserver session: the four channel descriptors, the child
/// bookkeeping, and the persistent-mode flags. Created once at startup,
/// lives until a fatal condition ends the process.
#[derive(Debug)]
pub struct Session {
    /// Upstream control channel, read side
    ctl: OwnedFd,
    /// Upstream status channel, write side
    st: OwnedFd,
    /// Downstream control channel, write side
    proxy_ctl: OwnedFd,
    /// Downstream status channel, read side
    proxy_st: OwnedFd,
    child: ChildState,
    first_run: bool,
    persistent: bool,
}

impl Session {
    /// Assemble a session from already-established channel ends.
    #[must_use]
    pub fn new(
        ctl: OwnedFd,
        st: OwnedFd,
        proxy_ctl: OwnedFd,
        proxy_st: OwnedFd,
        persistent: bool,
    ) -> Self {
        Self {
            ctl,
            st,
            proxy_ctl,
            proxy_st,
            child: ChildState::Gone,
            first_run: true,
            persistent,
        }
    }

    /// Spawn the target and wire it to a fresh downstream channel pair.
    ///
    /// The child gets the control read end on [`PROXY_FORKSRV_FD`] and the
    /// status write end one above it, closes every other forkserver
    /// descriptor, and execs `argv`. An exec failure is not handled here,
    /// it surfaces to the loop through the child's own exit status.
    pub fn spawn(
        ctl: OwnedFd,
        st: OwnedFd,
        argv: &[CString],
        persistent: bool,
    ) -> Result<Self, Fatal> {
        let mut ctl_pipe = Pipe::new().map_err(Fatal::CreatePipes)?;
        let mut st_pipe = Pipe::new().map_err(Fatal::CreatePipes)?;

        match unsafe { fork() }.map_err(Fatal::Fork)? {
            ForkResult::Child => exec_target(&ctl_pipe, &st_pipe, argv),
            ForkResult::Parent(handle) => {
                log::info!("spawned target forkserver, pid {}", handle.pid);
                // unwrap here: both ends are still held, the pipes are fresh
                let proxy_ctl = ctl_pipe.take_write_end().unwrap();
                let proxy_st = st_pipe.take_read_end().unwrap();
                drop(ctl_pipe);
                drop(st_pipe);
                Ok(Self::new(ctl, st, proxy_ctl, proxy_st, persistent))
            }
        }
    }

    /// One-time exchange before the steady-state loop: relay the first
    /// status word from the target to the fuzzer. A liveness probe, both
    /// ends must be up before any token is consumed.
    pub fn handshake(&mut self) -> Result<(), Fatal> {
        let status = read_msg(&self.proxy_st).map_err(Fatal::HandshakeRead)?;
        log::debug!("sending handshake status {status:#010x}");
        write_msg(&self.st, status).map_err(Fatal::HandshakeWrite)?;
        Ok(())
    }

    /// The steady-state control loop. Runs forever; the only way out is a
    /// fatal condition, which the caller turns into a process exit.
    pub fn run<T, C>(&mut self, tracer: &mut T, control: &mut C) -> Result<Infallible, Fatal>
    where
        T: Tracer,
        C: ChildControl,
    {
        loop {
            // Await orders. A failure here means the fuzzer is gone.
            let token = read_msg(&self.ctl).map_err(Fatal::UpstreamControlRead)?;
            write_msg(&self.proxy_ctl, token).map_err(Fatal::DownstreamControlWrite)?;

            // If the child parked itself but the fuzzer already issued a
            // kill, the downstream forkserver never sees that child again.
            // Write it off here so exactly one reap happens.
            if let ChildState::Parked(pid) = self.child {
                if token != 0 {
                    control.reap(pid).map_err(Fatal::ReapParkedChild)?;
                    self.child = ChildState::Gone;
                }
            }

            let pid = match self.child {
                ChildState::Parked(pid) => {
                    // Persistent reuse: the child is alive, just stopped.
                    control.resume(pid);
                    pid
                }
                ChildState::Gone | ChildState::Running(_) => {
                    let raw = read_msg(&self.proxy_st).map_err(Fatal::DownstreamPidRead)?;
                    Pid::from_raw(raw as i32)
                }
            };
            self.child = ChildState::Running(pid);

            tracer.start(pid);
            control.resume(pid);

            write_msg(&self.st, pid.as_raw() as u32).map_err(Fatal::UpstreamPidWrite)?;

            let mut status = read_msg(&self.proxy_st).map_err(Fatal::DownstreamStatusRead)?;

            tracer.stop();
            if tracer.rerun_required() {
                status = RERUN_STATUS_SENTINEL;
                log::error!("capture for pid {pid} is invalid, discarding status {status:#010x}");
                return Err(Fatal::TraceRerun);
            }

            // A self-stop is the persistent-mode success signal. Anything
            // else on the very first run of a persistent target means the
            // target never completed a single persistent iteration.
            if libc::WIFSTOPPED(status as i32) {
                self.child = ChildState::Parked(pid);
            } else {
                self.child = ChildState::Gone;
                if self.first_run && self.persistent {
                    return Err(Fatal::PersistentContract);
                }
            }
            self.first_run = false;

            write_msg(&self.st, status).map_err(Fatal::UpstreamStatusWrite)?;
        }
    }
}

/// Child side of [`Session::spawn`]. Never returns.
fn exec_target(ctl_pipe: &Pipe, st_pipe: &Pipe, argv: &[CString]) -> ! {
    // unwrap here: both ends are still held, the pipes are fresh
    let rewired = dup2(ctl_pipe.read_end().unwrap(), PROXY_FORKSRV_FD)
        .and_then(|_| dup2(st_pipe.write_end().unwrap(), PROXY_FORKSRV_FD + 1));
    if let Err(e) = rewired {
        let fatal = Fatal::RewireDescriptors(e.into());
        log::error!("{fatal}");
        process::exit(fatal.exit_code());
    }

    for fd in [
        ctl_pipe.read_end().unwrap(),
        ctl_pipe.write_end().unwrap(),
        st_pipe.read_end().unwrap(),
        st_pipe.write_end().unwrap(),
        FORKSRV_FD,
        FORKSRV_FD + 1,
    ] {
        let _ = close(fd);
    }

    let _ = execvp(&argv[0], argv);
    // Reached only when the exec itself failed; our exit status is the
    // signal the loop sees.
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use std::os::fd::OwnedFd;

    use nix::unistd::Pid;

    use super::{ChildControl, ChildState, Fatal, Session};
    use crate::{
        message::{read_msg, write_msg},
        os::pipes::Pipe,
        trace::Tracer,
        Error,
    };

    /// A stopped-by-SIGSTOP wait status, the persistent success signal.
    const STOPPED: u32 = 0x137f;
    /// A clean exit(0) wait status.
    const EXITED_OK: u32 = 0;

    #[derive(Default)]
    struct RecordingTracer {
        started: Vec<i32>,
        stops: usize,
        rerun_on_stop: Option<usize>,
    }

    impl Tracer for RecordingTracer {
        fn start(&mut self, pid: Pid) {
            self.started.push(pid.as_raw());
        }

        fn stop(&mut self) {
            self.stops += 1;
        }

        fn rerun_required(&self) -> bool {
            self.rerun_on_stop == Some(self.stops)
        }
    }

    #[derive(Default)]
    struct RecordingControl {
        resumed: Vec<i32>,
        reaped: Vec<i32>,
        fail_reap: bool,
    }

    impl ChildControl for RecordingControl {
        fn resume(&mut self, pid: Pid) {
            self.resumed.push(pid.as_raw());
        }

        fn reap(&mut self, pid: Pid) -> Result<(), Error> {
            if self.fail_reap {
                return Err(Error::illegal_state("waitpid failed"));
            }
            self.reaped.push(pid.as_raw());
            Ok(())
        }
    }

    /// The proxy's four channel ends plus the test-side counterparts.
    struct Harness {
        session: Session,
        up_ctl: OwnedFd,
        up_st: OwnedFd,
        down_ctl: OwnedFd,
        down_st: OwnedFd,
    }

    fn harness(persistent: bool) -> Harness {
        let mut up_ctl_pipe = Pipe::new().unwrap();
        let mut up_st_pipe = Pipe::new().unwrap();
        let mut down_ctl_pipe = Pipe::new().unwrap();
        let mut down_st_pipe = Pipe::new().unwrap();
        let session = Session::new(
            up_ctl_pipe.take_read_end().unwrap(),
            up_st_pipe.take_write_end().unwrap(),
            down_ctl_pipe.take_write_end().unwrap(),
            down_st_pipe.take_read_end().unwrap(),
            persistent,
        );
        Harness {
            session,
            up_ctl: up_ctl_pipe.take_write_end().unwrap(),
            up_st: up_st_pipe.take_read_end().unwrap(),
            down_ctl: down_ctl_pipe.take_read_end().unwrap(),
            down_st: down_st_pipe.take_write_end().unwrap(),
        }
    }

    fn drain(fd: &OwnedFd) -> Vec<u32> {
        let mut msgs = Vec::new();
        while let Ok(msg) = read_msg(fd) {
            msgs.push(msg);
        }
        msgs
    }

    /// Run the loop until the prewritten tokens run out; the closed
    /// upstream control channel then ends it.
    fn run_scripted(
        mut h: Harness,
        tokens: &[u32],
        downstream: &[u32],
        tracer: &mut RecordingTracer,
        control: &mut RecordingControl,
    ) -> (Fatal, Vec<u32>, Vec<u32>) {
        for token in tokens {
            write_msg(&h.up_ctl, *token).unwrap();
        }
        for msg in downstream {
            write_msg(&h.down_st, *msg).unwrap();
        }
        drop(h.up_ctl);

        let fatal = h.session.run(tracer, control).unwrap_err();
        drop(h.session);
        (fatal, drain(&h.up_st), drain(&h.down_ctl))
    }

    #[test]
    fn cold_start_relays_pid_and_status() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        let (fatal, upstream, forwarded) = run_scripted(
            harness(false),
            &[0],
            &[4321, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert!(matches!(fatal, Fatal::UpstreamControlRead(_)));
        assert_eq!(upstream, vec![4321, EXITED_OK]);
        assert_eq!(forwarded, vec![0]);
        assert_eq!(tracer.started, vec![4321]);
        assert_eq!(tracer.stops, 1);
        assert_eq!(control.resumed, vec![4321]);
        assert!(control.reaped.is_empty());
    }

    #[test]
    fn one_report_pair_per_token() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        let (_, upstream, forwarded) = run_scripted(
            harness(false),
            &[0, 0, 0],
            &[4321, EXITED_OK, 4322, EXITED_OK, 4323, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        // Exactly one pid and one status per token, in that order.
        assert_eq!(upstream, vec![4321, 0, 4322, 0, 4323, 0]);
        assert_eq!(forwarded, vec![0, 0, 0]);
        assert_eq!(tracer.started, vec![4321, 4322, 4323]);
        assert_eq!(tracer.stops, 3);
    }

    #[test]
    fn persistent_reuse_skips_pid_read() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        // Only one pid on the downstream channel: the second iteration
        // must not consume one.
        let (fatal, upstream, _) = run_scripted(
            harness(true),
            &[0, 0],
            &[4321, STOPPED, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert!(matches!(fatal, Fatal::UpstreamControlRead(_)));
        assert_eq!(upstream, vec![4321, STOPPED, 4321, EXITED_OK]);
        // Wake from parked, plus the unconditional resume each iteration.
        assert_eq!(control.resumed, vec![4321, 4321, 4321]);
        assert!(control.reaped.is_empty());
    }

    #[test]
    fn kill_race_reaps_parked_child_once() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        let (_, upstream, forwarded) = run_scripted(
            harness(true),
            &[0, 1],
            &[4321, STOPPED, 4322, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert_eq!(control.reaped, vec![4321]);
        assert_eq!(upstream, vec![4321, STOPPED, 4322, EXITED_OK]);
        assert_eq!(forwarded, vec![0, 1]);
        assert_eq!(control.resumed, vec![4321, 4322]);
    }

    #[test]
    fn kill_token_without_parked_child_reaps_nothing() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        let (_, upstream, _) = run_scripted(
            harness(false),
            &[1],
            &[4321, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert!(control.reaped.is_empty());
        assert_eq!(upstream, vec![4321, EXITED_OK]);
    }

    #[test]
    fn reap_failure_is_fatal() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl {
            fail_reap: true,
            ..RecordingControl::default()
        };
        let (fatal, upstream, _) = run_scripted(
            harness(true),
            &[0, 1],
            &[4321, STOPPED],
            &mut tracer,
            &mut control,
        );

        assert!(matches!(fatal, Fatal::ReapParkedChild(_)));
        assert_eq!(fatal.exit_code(), 8);
        assert_eq!(upstream, vec![4321, STOPPED]);
    }

    #[test]
    fn rerun_required_exits_before_status_report() {
        let mut tracer = RecordingTracer {
            rerun_on_stop: Some(1),
            ..RecordingTracer::default()
        };
        let mut control = RecordingControl::default();
        let (fatal, upstream, _) = run_scripted(
            harness(false),
            &[0],
            &[4321, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert!(matches!(fatal, Fatal::TraceRerun));
        assert_eq!(fatal.exit_code(), 9);
        // The pid went out, the untrustworthy status must not.
        assert_eq!(upstream, vec![4321]);
    }

    #[test]
    fn persistent_contract_violation_on_first_run() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        let (fatal, upstream, _) = run_scripted(
            harness(true),
            &[0],
            &[4321, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert!(matches!(fatal, Fatal::PersistentContract));
        assert_eq!(fatal.exit_code(), 12);
        assert_eq!(upstream, vec![4321]);
    }

    #[test]
    fn normal_exit_after_first_persistent_iteration_is_fine() {
        let mut tracer = RecordingTracer::default();
        let mut control = RecordingControl::default();
        // First iteration parks, the second exits for real: allowed.
        let (fatal, upstream, _) = run_scripted(
            harness(true),
            &[0, 0],
            &[4321, STOPPED, EXITED_OK],
            &mut tracer,
            &mut control,
        );

        assert!(matches!(fatal, Fatal::UpstreamControlRead(_)));
        assert_eq!(upstream, vec![4321, STOPPED, 4321, EXITED_OK]);
    }

    #[test]
    fn handshake_relays_first_status() {
        let mut h = harness(false);
        write_msg(&h.down_st, 0xc0ff_ee00).unwrap();
        h.session.handshake().unwrap();
        assert_eq!(read_msg(&h.up_st).unwrap(), 0xc0ff_ee00);
    }

    #[test]
    fn handshake_with_dead_target_is_fatal() {
        let mut h = harness(false);
        drop(h.down_st);
        let fatal = h.session.handshake().unwrap_err();
        assert!(matches!(fatal, Fatal::HandshakeRead(_)));
        assert_eq!(fatal.exit_code(), 16);
    }

    #[test]
    fn child_state_starts_gone() {
        let h = harness(false);
        assert_eq!(h.session.child, ChildState::Gone);
        assert!(h.session.first_run);
    }
}

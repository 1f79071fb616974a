//! Environment-derived session configuration.
//!
//! The proxy is configured entirely through the environment the fuzzer
//! sets up, the same surface the AFL runtime reads. Two settings are hard
//! preconditions for hardware tracing and are validated here rather than
//! auto-corrected: the tracer owns CPU affinity, and max CPU frequency
//! overflows the trace sink buffer on some boards.

use std::env;

use crate::{shmem::MAP_SIZE, Error};

/// The supervising fuzzer must disable its own CPU pinning.
pub const NO_AFFINITY_ENV_VAR: &str = "AFL_NO_AFFINITY";
/// CPU frequency scaling must be left alone by the fuzzer.
pub const SKIP_CPUFREQ_ENV_VAR: &str = "AFL_SKIP_CPUFREQ";
/// Optional instrumentation density percentage, clamped to `[1, 100]`.
pub const INST_RATIO_ENV_VAR: &str = "AFL_INST_RATIO";
/// Optional SysV id of the fuzzer's coverage map.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// Present iff the target was built for persistent mode.
pub const PERSIST_ENV_VAR: &str = "__AFL_PERSISTENT";
/// Optional verbose-debug flag.
pub const DEBUG_ENV_VAR: &str = "AFL_DEBUG";

/// Everything the session derives from the environment at startup.
/// Immutable after [`ProxyConfig::from_env`] returns.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Instrumentation density in percent, if requested
    pub inst_ratio: Option<u32>,
    /// How many bytes of the coverage map are considered live
    pub live_coverage_bytes: usize,
    /// SysV shared memory id of the fuzzer's coverage map, if provided
    pub shm_id: Option<i32>,
    /// Whether the target signals iteration completion by stopping itself
    pub persistent: bool,
    /// Verbose debug output requested
    pub debug: bool,
}

impl ProxyConfig {
    /// Read and validate the session configuration.
    ///
    /// Missing hard preconditions are errors, the caller exits on them.
    pub fn from_env() -> Result<Self, Error> {
        if env::var_os(NO_AFFINITY_ENV_VAR).is_none() {
            return Err(Error::illegal_state(format!(
                "{NO_AFFINITY_ENV_VAR} must be set to use CoreSight mode"
            )));
        }
        if env::var_os(SKIP_CPUFREQ_ENV_VAR).is_none() {
            return Err(Error::illegal_state(format!(
                "{SKIP_CPUFREQ_ENV_VAR} must be set to use CoreSight mode"
            )));
        }

        let inst_ratio = match env::var(INST_RATIO_ENV_VAR) {
            Ok(val) => {
                let ratio: u32 = val.parse().map_err(|_| {
                    Error::illegal_argument(format!("invalid {INST_RATIO_ENV_VAR} value {val:?}"))
                })?;
                Some(ratio.clamp(1, 100))
            }
            Err(_) => None,
        };
        let live_coverage_bytes = match inst_ratio {
            Some(ratio) => MAP_SIZE * ratio as usize / 100,
            None => MAP_SIZE,
        };

        let shm_id = match env::var(SHM_ENV_VAR) {
            Ok(val) => Some(val.parse().map_err(|_| {
                Error::illegal_argument(format!("invalid {SHM_ENV_VAR} value {val:?}"))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            inst_ratio,
            live_coverage_bytes,
            shm_id,
            persistent: env::var_os(PERSIST_ENV_VAR).is_some(),
            debug: env::var_os(DEBUG_ENV_VAR).is_some(),
        })
    }
}

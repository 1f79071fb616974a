//! Coverage map attachment.
//!
//! The fuzzer passes a SysV shared memory id through the environment; the
//! hardware trace decoder fills the mapped region with edge coverage. When
//! no id is supplied the proxy keeps a private buffer in its place, so
//! tracing still runs but nobody observes the coverage. The map is resolved
//! once at startup and has no lifecycle management afterwards, the segment
//! belongs to the fuzzer.

use std::ptr;

use crate::{config::ProxyConfig, Error};

/// Size of the coverage map shared with the fuzzer.
pub const MAP_SIZE: usize = 65536;

enum MapBacking {
    /// Attached to the fuzzer's SysV segment
    Shared(*mut u8),
    /// Private inert fallback
    Private(Box<[u8; MAP_SIZE]>),
}

/// The coverage byte map, shared with the fuzzer when an id was supplied.
pub struct CoverageMap {
    backing: MapBacking,
}

impl CoverageMap {
    /// Resolve the coverage map for this session.
    ///
    /// Attaches the shared segment named by the configuration, or falls
    /// back to a private buffer. With an instrumentation ratio configured,
    /// a shared map gets its first byte touched so the fuzzer does not
    /// give up on a session that produces few edges.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, Error> {
        let mut map = match config.shm_id {
            Some(shm_id) => {
                let addr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
                if addr as isize == -1 {
                    return Err(Error::Os(nix::errno::Errno::last()));
                }
                Self {
                    backing: MapBacking::Shared(addr.cast()),
                }
            }
            None => Self {
                backing: MapBacking::Private(Box::new([0; MAP_SIZE])),
            },
        };
        if config.inst_ratio.is_some() && map.is_shared() {
            map.as_mut_slice()[0] = 1;
        }
        Ok(map)
    }

    /// Whether the fuzzer observes this map
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.backing, MapBacking::Shared(_))
    }

    /// The full coverage map
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            MapBacking::Shared(ptr) => unsafe { core::slice::from_raw_parts(*ptr, MAP_SIZE) },
            MapBacking::Private(map) => map.as_ref(),
        }
    }

    /// The full coverage map, mutable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            MapBacking::Shared(ptr) => unsafe { core::slice::from_raw_parts_mut(*ptr, MAP_SIZE) },
            MapBacking::Private(map) => map.as_mut(),
        }
    }
}

//! Per-board trace stream identities.
//!
//! Each supported board assigns its ETMs trace-stream ids by its own
//! scheme. The topology configuration living outside this crate looks the
//! ids up here when it programs the trace sources.

/// A board the trace subsystem knows how to drive.
#[derive(Debug, Clone, Copy)]
pub struct Board {
    /// Hardware name as reported by the platform
    pub hardware: &'static str,
    /// Number of CPUs with initialized trace sources
    pub n_cpu: usize,
}

/// Boards with a known trace topology.
pub const KNOWN_BOARDS: &[Board] = &[
    Board {
        // Trace source init is limited to the first 32 CPUs on this one.
        hardware: "Marvell ThunderX2",
        n_cpu: 32,
    },
    Board {
        hardware: "Jetson Nano",
        n_cpu: 4,
    },
    Board {
        hardware: "Jetson TX2",
        n_cpu: 4,
    },
    Board {
        hardware: "ZCU104",
        n_cpu: 4,
    },
];

/// Look a known board up by hardware name.
#[must_use]
pub fn board(hardware: &str) -> Option<&'static Board> {
    KNOWN_BOARDS.iter().find(|b| b.hardware == hardware)
}

/// The trace-stream id of `cpu`'s trace source on `hardware`, or `None`
/// when the board is unknown or the CPU has no usable trace source.
#[must_use]
pub fn trace_id(hardware: &str, cpu: usize) -> Option<u8> {
    match hardware {
        "Marvell ThunderX2" => Some((0x10 + (cpu % 28) * 4 + cpu / 28) as u8),
        "Jetson TX2" => match cpu {
            // The Denver cores in between have no supported trace source.
            0 => Some(0x10),
            3..=5 => Some((0x10 + cpu - 2) as u8),
            _ => None,
        },
        "Jetson Nano" | "ZCU104" => Some((0x10 + cpu) as u8),
        _ => None,
    }
}

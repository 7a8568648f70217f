//! Tuning constants shared across the engine.

/// Timing constants for the liveness monitor.
pub mod timing {
    use std::time::Duration;

    /// Interval between liveness/drift checks.
    pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Delay between attach attempts while the target process is missing.
    pub const REATTACH_DELAY: Duration = Duration::from_secs(5);

    /// Frame length assumed when packing effect durations (30 fps target).
    pub const FRAME_MILLIS: u32 = 33;
}

/// Code cave sizing.
pub mod cave {
    /// Every code cave is allocated at this fixed size. Generated contents
    /// longer than this are rejected before any memory is touched.
    pub const STANDARD_CAVE_SIZE: usize = 1024;

    /// Size of a pointer slot cave (one 64-bit pointer).
    pub const POINTER_SLOT_SIZE: usize = 8;
}

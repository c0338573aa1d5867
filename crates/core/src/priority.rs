//! Scheduling priority for read requests.

/// Signed scheduling priority.
///
/// Higher values are served first; ties break by issue order (FIFO). The
/// named anchors are stable reference points for callers that want
/// relative adjustments (for example `IoPriority::MEDIUM + 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoPriority(pub i32);

impl IoPriority {
    /// Lowest possible priority
    pub const MIN: IoPriority = IoPriority(i32::MIN);
    /// Background work
    pub const LOW: IoPriority = IoPriority(-1_000_000);
    /// Default priority
    pub const MEDIUM: IoPriority = IoPriority(0);
    /// Latency-sensitive work
    pub const HIGH: IoPriority = IoPriority(1_000_000);
    /// Highest possible priority
    pub const MAX: IoPriority = IoPriority(i32::MAX);

    /// The raw priority value.
    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for IoPriority {
    fn default() -> Self {
        IoPriority::MEDIUM
    }
}

impl std::ops::Add<i32> for IoPriority {
    type Output = IoPriority;

    fn add(self, delta: i32) -> IoPriority {
        IoPriority(self.0.saturating_add(delta))
    }
}

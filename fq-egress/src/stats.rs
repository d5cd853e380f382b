use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for an egress pair.
/// These are shared between the driver and the front-end handle.
#[derive(Debug, Default)]
pub struct EgressStats {
    /// Packets offered to the scheduler.
    offered: AtomicU64,
    /// Packets that left the scheduler.
    sent: AtomicU64,
    /// Packets the scheduler refused.
    dropped: AtomicU64,
}

impl EgressStats {
    #[inline]
    pub(crate) fn increment_offered(&self) {
        self.offered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn offered(&self) -> u64 {
        self.offered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

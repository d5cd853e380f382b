/// Counters accumulated over the scheduler's lifetime. Owned by the
/// scheduler; never reset by [`reset`](crate::FqScheduler::reset).
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub gc_flows: u64,
    pub highprio_packets: u64,
    pub throttled: u64,
    pub flows_plimit_drops: u64,
    pub pkts_too_long: u64,
    pub allocation_errors: u64,
    pub tail_drops: u64,
    pub ce_mark: u64,
    pub horizon_drops: u64,
    pub horizon_caps: u64,
    /// EWMA (alpha = 1/8) of how late throttled flows were released.
    pub unthrottle_latency_ns: u64,
}

impl Counters {
    /// Feeds one unthrottle-latency sample into the EWMA.
    pub fn observe_unthrottle_latency(&mut self, sample_ns: u64) {
        self.unthrottle_latency_ns -= self.unthrottle_latency_ns >> 3;
        self.unthrottle_latency_ns += sample_ns >> 3;
    }
}

/// Snapshot of scheduler statistics, as returned by
/// [`dump_stats`](crate::FqScheduler::dump_stats).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FqStats {
    /// Flows reclaimed by garbage collection.
    pub gc_flows: u64,
    /// Packets served through the high-priority internal flow.
    pub highprio_packets: u64,
    /// Times a flow was parked in the throttle tree.
    pub throttled: u64,
    /// Packets dropped by the per-flow limit.
    pub flows_plimit_drops: u64,
    /// Pacing delays clamped to one second.
    pub pkts_too_long: u64,
    /// Flow allocation failures redirected to the internal flow.
    pub allocation_errors: u64,
    /// Packets dropped by the global limit, including `change()` trimming.
    pub tail_drops: u64,
    /// Packets congestion-marked for departing late.
    pub ce_mark: u64,
    /// Packets dropped for being beyond the horizon.
    pub horizon_drops: u64,
    /// Packet timestamps capped to the horizon.
    pub horizon_caps: u64,
    /// EWMA of throttle release lateness, ns.
    pub unthrottle_latency_ns: u64,
    /// Next throttled-flow deadline relative to now (plus timer slack);
    /// `i64::MAX` when no flow is throttled.
    pub time_next_delayed_flow: i64,
    /// Currently known flows, active or not.
    pub flows: u32,
    /// Flows with an empty queue awaiting garbage collection.
    pub inactive_flows: u32,
    /// Flows currently parked in the throttle tree.
    pub throttled_flows: u32,
}

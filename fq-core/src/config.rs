use std::time::Duration;

use thiserror::Error;

/// Ethernet MTU plus the hard header, matching what the kernel reports for a
/// standard interface. MTU-derived defaults are computed from this.
pub const DEFAULT_MTU: u32 = 1514;

pub(crate) const NSEC_PER_SEC: u64 = 1_000_000_000;

const MAX_BUCKETS_LOG: u32 = 18;
const MAX_QUANTUM: u32 = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("buckets_log {0} out of range 1..={MAX_BUCKETS_LOG}")]
    BucketsLog(u32),
    #[error("quantum {0} out of range 1..={MAX_QUANTUM}")]
    Quantum(u32),
    #[error("plimit must be non-zero")]
    Plimit,
}

/// Scheduler tunables.
///
/// Every knob can be changed at runtime through
/// [`FqScheduler::change`](crate::FqScheduler::change); the whole update is
/// rejected if any value is out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FqConfig {
    /// Global queue cap, packets.
    pub plimit: u32,
    /// Per-flow queue cap, packets. The internal flow is exempt.
    pub flow_plimit: u32,
    /// Bytes of credit added per round-robin round.
    pub quantum: u32,
    /// Credit granted to a freshly created flow.
    pub initial_quantum: u32,
    /// Hard per-flow rate cap, bytes per second. `u64::MAX` disables it.
    pub flow_max_rate: u64,
    /// Flows at or below this rate get exactly one packet per round.
    pub low_rate_threshold: u32,
    /// log2 of the flow hash table size.
    pub buckets_log: u32,
    /// Idle period after which a returning flow has its credit refreshed.
    pub flow_refill_delay: Duration,
    /// Mask applied to the header hash when synthesizing orphan flow keys.
    pub orphan_mask: u32,
    /// Departure lateness beyond which packets are congestion-marked.
    pub ce_threshold: Duration,
    /// Slack added to watchdog wakeups.
    pub timer_slack: Duration,
    /// Maximum accepted distance of a packet timestamp into the future.
    pub horizon: Duration,
    /// Beyond-horizon packets are dropped when true, capped when false.
    pub horizon_drop: bool,
    /// Enables rate-based pacing.
    pub rate_enable: bool,
    /// Source ports identifying the two co-flows.
    pub f1_source: u32,
    pub f2_source: u32,
    /// Destination ports of the co-flows; accepted and dumped, not used by
    /// the scheduling policy.
    pub f1_dest: u32,
    pub f2_dest: u32,
    /// Number of co-flow promotions that triggers preferential service of
    /// the co list.
    pub coflow_breach: u32,
}

impl Default for FqConfig {
    fn default() -> Self {
        Self {
            plimit: 10_000,
            flow_plimit: 100,
            quantum: 2 * DEFAULT_MTU,
            initial_quantum: 10 * DEFAULT_MTU,
            flow_max_rate: u64::MAX,
            low_rate_threshold: 550_000 / 8,
            buckets_log: 10,
            flow_refill_delay: Duration::from_millis(40),
            orphan_mask: 1024 - 1,
            // Effectively infinite: ~4294 seconds.
            ce_threshold: Duration::from_micros(u32::MAX as u64),
            timer_slack: Duration::from_micros(10),
            horizon: Duration::from_secs(10),
            horizon_drop: true,
            rate_enable: true,
            f1_source: 0,
            f2_source: 0,
            f1_dest: 0,
            f2_dest: 0,
            coflow_breach: 2,
        }
    }
}

impl FqConfig {
    pub fn with_plimit(mut self, plimit: u32) -> Self {
        self.plimit = plimit;
        self
    }

    pub fn with_flow_plimit(mut self, flow_plimit: u32) -> Self {
        self.flow_plimit = flow_plimit;
        self
    }

    pub fn with_quantum(mut self, quantum: u32) -> Self {
        self.quantum = quantum;
        self
    }

    pub fn with_initial_quantum(mut self, initial_quantum: u32) -> Self {
        self.initial_quantum = initial_quantum;
        self
    }

    pub fn with_flow_max_rate(mut self, rate: u64) -> Self {
        self.flow_max_rate = rate;
        self
    }

    pub fn with_low_rate_threshold(mut self, threshold: u32) -> Self {
        self.low_rate_threshold = threshold;
        self
    }

    pub fn with_buckets_log(mut self, log: u32) -> Self {
        self.buckets_log = log;
        self
    }

    pub fn with_flow_refill_delay(mut self, delay: Duration) -> Self {
        self.flow_refill_delay = delay;
        self
    }

    pub fn with_orphan_mask(mut self, mask: u32) -> Self {
        self.orphan_mask = mask;
        self
    }

    pub fn with_ce_threshold(mut self, threshold: Duration) -> Self {
        self.ce_threshold = threshold;
        self
    }

    pub fn with_timer_slack(mut self, slack: Duration) -> Self {
        self.timer_slack = slack;
        self
    }

    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_horizon_drop(mut self, drop: bool) -> Self {
        self.horizon_drop = drop;
        self
    }

    pub fn with_rate_enable(mut self, enable: bool) -> Self {
        self.rate_enable = enable;
        self
    }

    pub fn with_coflow_sources(mut self, f1: u32, f2: u32) -> Self {
        self.f1_source = f1;
        self.f2_source = f2;
        self
    }

    pub fn with_coflow_dests(mut self, f1: u32, f2: u32) -> Self {
        self.f1_dest = f1;
        self.f2_dest = f2;
        self
    }

    pub fn with_coflow_breach(mut self, breach: u32) -> Self {
        self.coflow_breach = breach;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets_log < 1 || self.buckets_log > MAX_BUCKETS_LOG {
            return Err(ConfigError::BucketsLog(self.buckets_log));
        }
        if self.quantum == 0 || self.quantum > MAX_QUANTUM {
            return Err(ConfigError::Quantum(self.quantum));
        }
        if self.plimit == 0 {
            return Err(ConfigError::Plimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = FqConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.quantum, 3028);
        assert_eq!(cfg.initial_quantum, 15140);
        assert_eq!(cfg.low_rate_threshold, 68_750);
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(
            FqConfig::default().with_buckets_log(0).validate(),
            Err(ConfigError::BucketsLog(0))
        );
        assert_eq!(
            FqConfig::default().with_buckets_log(19).validate(),
            Err(ConfigError::BucketsLog(19))
        );
        assert_eq!(
            FqConfig::default().with_quantum(0).validate(),
            Err(ConfigError::Quantum(0))
        );
        assert_eq!(
            FqConfig::default().with_quantum((1 << 20) + 1).validate(),
            Err(ConfigError::Quantum((1 << 20) + 1))
        );
        assert_eq!(FqConfig::default().with_plimit(0).validate(), Err(ConfigError::Plimit));
    }
}

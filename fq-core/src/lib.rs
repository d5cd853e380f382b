//! Per-flow fair queueing packet scheduler with rate pacing.
//!
//! Packets are classified into flows keyed by their owning endpoint (or a
//! header-hash key for packets without one), buffered per flow in
//! departure-time order, and served round-robin under a deficit credit
//! discipline. Flows whose next transmit time lies in the future are parked
//! in a throttle tree until a watchdog wakeup. A configured pair of
//! *co-flows* gets a bounded, interleaved share of dispatch opportunities on
//! top of the regular rotation.
//!
//! The scheduler is single-threaded by design: the host serializes all calls
//! on one instance, and separate instances share nothing. See
//! [`FqScheduler`] for the operation surface and `fq-egress` for an async
//! driver that pairs it with a tokio timer.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod clock;
mod config;
mod flow;
mod packet;
mod rr;
mod scheduler;
mod stats;
mod table;
mod throttle;
mod watchdog;

pub use clock::{Clock, MonotonicClock, TestClock};
pub use config::{ConfigError, FqConfig, DEFAULT_MTU};
pub use packet::{Endpoint, EndpointState, FlowKey, Packet, PRIO_CONTROL, PRIO_MAX};
pub use scheduler::{EnqueueError, FqScheduler};
pub use stats::FqStats;
pub use watchdog::Watchdog;

//! Async egress driver for the [`fq-core`](fq_core) scheduler.
//!
//! [`Egress`] is the front-end handle: it feeds packets over a bounded
//! channel to an [`EgressDriver`] that owns the scheduler, sleeps on its
//! watchdog deadline, and yields paced packets as a [`futures::Stream`].

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use thiserror::Error;

mod driver;
mod stats;

pub use driver::{Egress, EgressDriver};
pub use stats::EgressStats;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("egress driver has shut down")]
    DriverClosed,
    #[error("ingress queue full")]
    Full,
}

/// Options for an egress pair.
#[derive(Debug, Clone)]
pub struct EgressOptions {
    /// Capacity of the ingress channel between handle and driver.
    ingress_buffer: usize,
}

impl Default for EgressOptions {
    fn default() -> Self {
        Self { ingress_buffer: 1024 }
    }
}

impl EgressOptions {
    /// Sets the capacity of the ingress channel.
    pub fn ingress_buffer(mut self, capacity: usize) -> Self {
        self.ingress_buffer = capacity;
        self
    }
}

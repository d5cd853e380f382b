pub use fq_core::*;
pub use fq_egress::{Egress, EgressDriver, EgressError, EgressOptions, EgressStats};

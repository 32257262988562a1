//! Target link tracking.

pub mod monitor;
pub mod state;

pub use monitor::{FlashLease, LeaseOutcome, LinkMonitor, LinkSettings};
pub use state::LinkState;

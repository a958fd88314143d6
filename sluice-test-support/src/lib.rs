//! Test helpers for sluice: exactly-once bookkeeping and fault injection.

pub mod chaos;
pub mod verify;

pub use chaos::{Fault, FaultInjector};
pub use verify::{DeliveryLedger, LedgerReport};

//! Allocations: pricing, prepaid pools and the write-session change pipeline.

pub mod changes;
mod collector;
mod pool;
mod pricing;

pub use changes::{ChangeContext, ChangeProcessor, OperationTag};
pub use collector::{AllocationChange, AllocationChangeCollector, ConnectionStatus, SessionRecord};
pub use pool::{Pending, ReadPool, WritePool, WriteReservation, get_pending, reserve_write};
pub use pricing::{Allocation, Terms, Timestamp};

//! Grid data structures: slot records, the frozen master array, and
//! the copy-on-write planning view.

pub mod master;
pub mod types;
pub mod working;

pub use master::Grid;
pub use types::{FillEvent, OrderRecord, OrderRole, OrderState, QueuedFill, RawOnChain};
pub use working::WorkingGrid;

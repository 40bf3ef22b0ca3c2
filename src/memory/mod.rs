//! Device-memory management
//!
//! [`Suballocator`] serves every per-step device allocation from a single
//! fixed pool sized by the planner. [`SlotTable`] is the owner/alias
//! bookkeeping for the executor's activation and gradient handle tables.

pub mod slots;
pub mod suballocator;

pub use slots::SlotTable;
pub use suballocator::{align_up, Suballocator, POOL_ALIGNMENT};

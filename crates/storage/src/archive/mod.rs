//! Remote tar archives built by concurrent producers.

pub mod append;
pub mod header;
pub mod slots;

pub use append::{AppendOutcome, ArchiveAppendEngine, ReopenPlan, plan_reopen};
pub use header::{BLOCK_SIZE, end_of_archive, member_header, padding_len};
pub use slots::{ExtensionSlotPool, SlotGuard};

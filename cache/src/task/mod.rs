//! Background and inline maintenance: the compaction pass, the janitor
//! thread that schedules it, and the write-behind saver thread.

pub mod compactor;
pub(crate) mod janitor;
pub(crate) mod saver;

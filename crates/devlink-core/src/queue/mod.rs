//! Work-queue building blocks shared by every instruction pool.

pub mod priority;
pub mod sequence;

pub use priority::{BoundedPriorityQueue, Enqueued, Prioritized};
pub use sequence::SequenceCounter;

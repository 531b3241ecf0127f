//! Flow cache: directional 5-tuple map plus an O(1) recency queue.

mod queue;
mod table;

pub use queue::{FlowArena, FlowHandle, RecencyQueue};
pub use table::FlowTable;

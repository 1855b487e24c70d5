//! Transfer queue and the items it owns

pub mod item;
pub mod stats;
pub mod transfer;

pub use item::TransferItem;
pub use stats::{AtomicQueueStats, QueueStats};
pub use transfer::TransferQueue;

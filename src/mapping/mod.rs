//! Zero-copy mapping of the head transfer item
//!
//! At most one mapping is live at a time. It is recorded in a [`MappingSlot`]
//! together with the session that requested it, and it keeps the page
//! referenced until that session unmaps, closes, or is replaced by a newer
//! mapping.

pub mod region;
pub mod slot;

pub use region::MappedRegion;
pub use slot::{ActiveMapping, MappingSlot, SessionId};

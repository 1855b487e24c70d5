//! Long-running consumer that drains the transfer queue
//!
//! The daemon polls the queue depth, fetches head metadata, maps (or copies)
//! the head page, inspects it read-only and releases it. All of that runs as
//! an explicit state machine so every transition can be tested without a
//! real clock or a real peer.

pub mod clock;
pub mod config;
pub mod inspect;
pub mod machine;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccessMode, DaemonConfig};
pub use inspect::{hex_dump, safe_preview, Verification};
pub use machine::ConsumerDaemon;
pub use state::{DaemonState, DaemonStats, Tick};

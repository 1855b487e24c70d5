//! # Pagebridge - Zero-Copy Page Transfer Queue
//!
//! Pagebridge moves page-sized payloads from producers to a consumer without
//! copying them. A producer hands over a buffer that lives in a shared
//! memfd-backed arena; the queue pins the page and records where the payload
//! starts. A consumer asks for the queue depth and the head item's metadata
//! over a small control protocol, maps the head page read-only, inspects it
//! and releases it, which unpins the page.
//!
//! ## Features
//!
//! - **Zero-copy and copy acquisition**: pin an arena page in place or copy into a fresh one
//! - **Bounded FIFO**: strict ordering, explicit backpressure when full
//! - **Control protocol**: GetCount, GetInfo and ReleaseHead over a local or Unix socket channel
//! - **Read-only mapping**: one live mapping per session, descriptor passing across processes
//! - **Readiness notification**: condvar waiters plus an eventfd for poll loops
//! - **Consumer daemon**: an explicit state machine with backoff and health checks
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  write   ┌──────────────────────────────┐
//! │  Producer    │ ───────▶ │  XferContext                 │
//! └──────────────┘          │  - FrameArena (memfd pages)  │
//!                           │  - TransferQueue (FIFO)      │
//!                           │  - MappingSlot               │
//!                           │  - ReadinessNotifier         │
//!                           └──────────────────────────────┘
//!                                  │ ControlChannel
//!                     ┌────────────┴────────────┐
//!                     ▼                         ▼
//!            ┌─────────────────┐      ┌──────────────────┐
//!            │  LocalChannel   │      │  ControlServer   │
//!            │  (in process)   │      │  (Unix socket)   │
//!            └─────────────────┘      └──────────────────┘
//!                     │                         │
//!                     └──────────┬──────────────┘
//!                                ▼
//!                       ┌──────────────────┐
//!                       │  ConsumerDaemon  │
//!                       └──────────────────┘
//! ```

// Core modules
pub mod error;
pub mod memory;
pub mod queue;
pub mod mapping;
pub mod subsystem;

// Control surface
pub mod protocol;
pub mod transport;

// Readiness and shutdown primitives
pub mod sync;

// Consumer side
pub mod daemon;

// Main API re-exports
pub use error::{ErrorClass, Result, XferError};
pub use memory::{AcquireMode, ArenaConfig, FrameArena, PageAcquirer, PageHandle, SharedPage};
pub use queue::{QueueStats, TransferItem, TransferQueue};
pub use mapping::{MappedRegion, SessionId};
pub use subsystem::{Settings, SubsystemConfig, TeardownReport, XferContext, XferFile};
pub use protocol::{ControlOp, ControlReply, MapGrant, XferInfo};
pub use transport::{
    ControlChannel, ControlServer, Connector, LocalChannel, LocalConnector, ServerConfig, UnixChannel,
    UnixConnector,
};
pub use sync::{ReadinessNotifier, ShutdownFlag};
pub use daemon::{AccessMode, ConsumerDaemon, DaemonConfig, DaemonState, DaemonStats};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Default number of page frames in an arena
    pub const DEFAULT_ARENA_FRAMES: usize = 256;

    /// Default bound on queued items
    pub const DEFAULT_MAX_ITEMS: usize = 128;

    /// Largest single mapping a consumer asks for (100 MiB)
    pub const MAX_MAP_LEN: usize = 100 * 1024 * 1024;

    /// Consumer wait when the queue is empty
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

    /// Interval between consumer health checks
    pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

    /// Consecutive consumer failures before the long cool-down
    pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

    pub const DEFAULT_SHORT_BACKOFF: Duration = Duration::from_secs(1);
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

    /// Bytes of an item shown in consumer logs
    pub const DEFAULT_PREVIEW_LEN: usize = 128;
}

//! Transfer subsystem: context, configuration and the file adapter

pub mod config;
pub mod context;
pub mod file;
pub mod stats;

pub use config::{Settings, SubsystemConfig};
pub use context::{TeardownReport, XferContext};
pub use file::XferFile;
pub use stats::{ErrorCounters, ErrorStats};

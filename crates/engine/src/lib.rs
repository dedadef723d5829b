//! Powerhouse download engine
//!
//! Tracks media downloads from every dashboard source, moves them through
//! their lifecycle and publishes snapshots for the UI.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod simulator;
pub mod store;

pub use config::Config;
pub use coordinator::{Coordinator, Observer};
pub use error::{EngineError, Rejection};
pub use simulator::TickSummary;
pub use store::{Snapshot, Store};

pub use bridge::{
    format_size, Category, DownloadEntry, DownloadEvent, DownloadFilter, DownloadId,
    DownloadStats, DownloadStatus, Driver,
};

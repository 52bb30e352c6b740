//! tray-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod daemon;
pub mod dir_transport;
pub mod persistence;

// Re-export key types for convenience
pub use daemon::{Daemon, DaemonOptions};
pub use dir_transport::DirTransport;
pub use persistence::{CredentialFile, DataDir, FileBackupLog, FileBaselineStore, TreeFile};

//! tray-core: tree-consistency and synchronization engine for tray hierarchies.
//!
//! This crate provides:
//! - `TreeGraph`, the tray hierarchy with its tree invariants
//! - Change-detection hashes and baseline-diff conflict classification
//! - Checksummed backups, validation and recovery
//! - A bounded-concurrency sync scheduler with retry/backoff
//! - Transport, serializer, credential and store trait abstractions

pub mod baseline;
pub mod config;
pub mod conflict;
pub mod credentials;
pub mod driver;
pub mod events;
pub mod graph;
pub mod hash;
pub mod integrity;
pub mod node;
pub mod queue;
pub mod scheduler;
pub mod serializer;
pub mod transport;

pub use baseline::{BaselineSnapshot, BaselineStore, InMemoryBaselineStore};
pub use config::{RetentionPolicy, SyncConfig};
pub use conflict::{ConflictDetector, ConflictKind, Resolution, SyncAction, SyncDecision};
pub use credentials::{CredentialStore, StaticCredentials, normalize_server_url};
pub use driver::{DriverHandle, SyncDriver};
pub use events::{EventBus, NotificationLevel, Subscription, SyncEvent, SyncStatus};
pub use graph::{GraphError, GraphIssue, SharedTree, TreeGraph};
pub use hash::{SnapshotHash, snapshot_hash};
pub use integrity::{
    BackupLog, BackupOperation, BackupRecord, InMemoryBackupLog, IntegrityError, IntegrityManager,
    ValidationReport,
};
pub use node::{FlexDirection, PropertyValue, TrayNode, TrayTree};
pub use queue::{SyncQueue, SyncQueueEntry};
pub use scheduler::{
    Notification, PendingConflict, SchedulerStats, SyncError, SyncOutcome, SyncScheduler,
    SyncServices, SyncTicket,
};
pub use serializer::{JsonSerializer, TraySerializer};
pub use transport::{InMemoryTransport, Transport, TransportError};

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

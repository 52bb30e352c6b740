//! Composition root: wires the engine to the daemon's files and transport.

use crate::dir_transport::DirTransport;
use crate::persistence::{CredentialFile, DataDir, FileBackupLog, FileBaselineStore, TreeFile};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tray_core::config::{RetentionPolicy, SyncConfig};
use tray_core::driver::{DriverHandle, SyncDriver};
use tray_core::events::{EventBus, NotificationLevel, Subscription, SyncEvent};
use tray_core::graph::{SharedTree, TreeGraph};
use tray_core::integrity::{CleanupReport, IntegrityManager};
use tray_core::node::TrayNode;
use tray_core::scheduler::{SyncError, SyncOutcome, SyncScheduler, SyncServices};
use tray_core::serializer::{JsonSerializer, TraySerializer};
use tray_core::now_ms;

/// Name of the root tray created for an empty data directory.
pub const DEFAULT_ROOT_NAME: &str = "Trays";

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub data_dir: PathBuf,
    pub remote_root: PathBuf,
    pub sync: SyncConfig,
    pub retention: RetentionPolicy,
    /// Global auto-sync switch
    pub auto_sync: bool,
}

impl DaemonOptions {
    pub fn new(data_dir: PathBuf, remote_root: PathBuf) -> Self {
        Self {
            data_dir,
            remote_root,
            sync: SyncConfig::default(),
            retention: RetentionPolicy::default(),
            auto_sync: true,
        }
    }
}

pub struct Daemon {
    tree: SharedTree,
    tree_file: TreeFile,
    baselines: Arc<FileBaselineStore>,
    scheduler: Arc<SyncScheduler>,
    integrity: Arc<IntegrityManager>,
    events: Arc<EventBus>,
    _log_subscription: Subscription,
}

impl Daemon {
    /// Load state from the data directory and build the scheduler.
    pub fn open(options: DaemonOptions) -> Result<Self> {
        let data = DataDir::new(options.data_dir);
        let tree_file = TreeFile::new(data.tree());

        let graph = match tree_file.load()? {
            Some(graph) => {
                info!("Loaded {} trays", graph.len());
                graph
            }
            None => {
                info!("No saved tree, starting with an empty root");
                let graph =
                    TreeGraph::with_root(TrayNode::with_generated_id(DEFAULT_ROOT_NAME, now_ms()))?;
                tree_file.save(&graph)?;
                graph
            }
        };
        let issues = graph.validate();
        for issue in &issues {
            warn!("Tree issue: {}", issue);
        }

        let credentials = CredentialFile::new(data.credentials()).load()?;
        let serializer: Arc<dyn TraySerializer> = Arc::new(JsonSerializer);
        let integrity = Arc::new(IntegrityManager::new(
            Arc::new(FileBackupLog::open(data.backups())?),
            serializer.clone(),
            options.retention,
        ));
        let events = Arc::new(EventBus::new());
        let log_subscription = events.subscribe(log_event);

        let baselines = Arc::new(FileBaselineStore::open(data.baselines())?);
        let tree = graph.into_shared();
        let services = SyncServices {
            transport: Arc::new(DirTransport::new(options.remote_root)),
            credentials: Arc::new(credentials),
            baselines: baselines.clone(),
            integrity: integrity.clone(),
            serializer,
            events: events.clone(),
        };
        let scheduler = Arc::new(SyncScheduler::new(tree.clone(), services, options.sync));
        scheduler.set_auto_sync_enabled(options.auto_sync);

        Ok(Self {
            tree,
            tree_file,
            baselines,
            scheduler,
            integrity,
            events,
            _log_subscription: log_subscription,
        })
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn integrity(&self) -> &Arc<IntegrityManager> {
        &self.integrity
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run a single tick to completion.
    pub async fn run_once(&self, now: u64) -> Vec<(String, std::result::Result<SyncOutcome, SyncError>)> {
        self.scheduler.start();
        let results = self.scheduler.tick(now).await;
        self.scheduler.prune_backups(now).await;
        self.scheduler.stop();
        results
    }

    /// Start the periodic driver.
    pub fn spawn_driver(&self) -> DriverHandle {
        SyncDriver::spawn(Arc::clone(&self.scheduler), self.scheduler.config().tick_interval)
    }

    /// Save the tree, then the baselines that describe it.
    ///
    /// The read lock keeps syncs from moving either one in between. If the
    /// process dies after the tree write, the older baselines on disk turn a
    /// remote edit into a conflict instead of an upload.
    pub fn save(&self) -> Result<()> {
        let graph = self.tree.read().unwrap_or_else(|e| e.into_inner());
        self.tree_file.save(&graph)?;
        self.baselines.flush()
    }

    pub async fn cleanup_backups(&self, now: u64) -> Result<CleanupReport> {
        Ok(self.integrity.cleanup(now).await?)
    }

    /// Log and clear queued notifications and pending conflicts.
    pub fn report(&self) {
        for notification in self.scheduler.drain_notifications() {
            info!(
                "[{}] {}: {}",
                level_label(notification.level),
                notification.node_id,
                notification.message
            );
        }
        for conflict in self.scheduler.pending_conflicts() {
            warn!(
                "Unresolved {} on {} (backup {})",
                conflict.kind,
                conflict.node_id,
                conflict.backup_id.as_deref().unwrap_or("none")
            );
        }
    }
}

fn level_label(level: NotificationLevel) -> &'static str {
    match level {
        NotificationLevel::Info => "info",
        NotificationLevel::Warning => "warning",
        NotificationLevel::Error => "error",
    }
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::StatusChanged {
            node_id, status, ..
        } => {
            info!("{} is {}", node_id, status);
        }
        SyncEvent::Notification {
            node_id,
            level,
            message,
            ..
        } => match level {
            NotificationLevel::Info => info!("{}: {}", node_id, message),
            NotificationLevel::Warning => warn!("{}: {}", node_id, message),
            NotificationLevel::Error => error!("{}: {}", node_id, message),
        },
    }
}

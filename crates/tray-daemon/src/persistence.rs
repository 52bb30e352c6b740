//! JSON persistence for the daemon.
//!
//! Everything lives in one data directory:
//! - `tree.json` - the whole tray hierarchy in nested form
//! - `baselines.json` - last synchronized state per tray
//! - `backups.json` - checksummed backup records
//! - `credentials.json` - shared secret per server URL

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;
use tray_core::baseline::{self, BaselineSnapshot, BaselineStore};
use tray_core::credentials::StaticCredentials;
use tray_core::graph::TreeGraph;
use tray_core::integrity::{BackupLog, BackupLogError, BackupRecord};
use tray_core::node::TrayTree;

pub const TREE_FILE: &str = "tree.json";
pub const BASELINES_FILE: &str = "baselines.json";
pub const BACKUPS_FILE: &str = "backups.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Paths inside the daemon's data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree(&self) -> PathBuf {
        self.root.join(TREE_FILE)
    }

    pub fn baselines(&self) -> PathBuf {
        self.root.join(BASELINES_FILE)
    }

    pub fn backups(&self) -> PathBuf {
        self.root.join(BACKUPS_FILE)
    }

    pub fn credentials(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }
}

/// Read a JSON file, or `None` if it does not exist.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// ==================== Tree ====================

/// The tray hierarchy on disk.
pub struct TreeFile {
    path: PathBuf,
}

impl TreeFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the graph, or `None` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<TreeGraph>> {
        let Some(tree) = load_json::<TrayTree>(&self.path)? else {
            return Ok(None);
        };
        let graph = TreeGraph::from_tree(&tree)
            .with_context(|| format!("rebuilding tree from {}", self.path.display()))?;
        Ok(Some(graph))
    }

    pub fn save(&self, graph: &TreeGraph) -> Result<()> {
        let root = graph.root_id().context("tree has no root")?;
        let tree = graph.export_subtree(root)?;
        save_json(&self.path, &tree)?;
        debug!("Saved {} trays to {}", graph.len(), self.path.display());
        Ok(())
    }
}

// ==================== Baselines ====================

/// Baselines kept in memory and written to `baselines.json` by
/// [`flush`](Self::flush).
///
/// Flush only right after `tree.json` was saved. A baseline on disk must
/// never be newer than the tree on disk: paired with a stale tree it makes
/// the stale content look like a local edit, which would then be uploaded
/// over the remote change.
pub struct FileBaselineStore {
    path: PathBuf,
    baselines: RwLock<BTreeMap<String, BaselineSnapshot>>,
}

impl FileBaselineStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let baselines = load_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            baselines: RwLock::new(baselines),
        })
    }

    pub fn len(&self) -> usize {
        self.baselines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current baselines to disk.
    pub fn flush(&self) -> Result<()> {
        let baselines = self.baselines.read().unwrap_or_else(|e| e.into_inner());
        save_json(&self.path, &*baselines)?;
        debug!("Saved {} baselines to {}", baselines.len(), self.path.display());
        Ok(())
    }
}

impl BaselineStore for FileBaselineStore {
    fn get(&self, node_id: &str) -> baseline::Result<Option<BaselineSnapshot>> {
        Ok(self
            .baselines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned())
    }

    fn put(&self, snapshot: BaselineSnapshot) -> baseline::Result<()> {
        self.baselines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.node_id.clone(), snapshot);
        Ok(())
    }

    fn remove(&self, node_id: &str) -> baseline::Result<()> {
        self.baselines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        Ok(())
    }
}

// ==================== Backups ====================

/// Backup records kept in memory and written through to `backups.json`.
///
/// The async mutex is held across the file write so concurrent syncs cannot
/// reorder writes.
pub struct FileBackupLog {
    path: PathBuf,
    records: tokio::sync::Mutex<Vec<BackupRecord>>,
}

impl FileBackupLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = load_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            records: tokio::sync::Mutex::new(records),
        })
    }

    async fn persist(&self, records: &[BackupRecord]) -> std::result::Result<(), BackupLogError> {
        let storage = |e: String| BackupLogError::Storage(format!("{}: {}", self.path.display(), e));
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(records).map_err(|e| storage(e.to_string()))?;
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| storage(e.to_string()))
    }
}

#[async_trait]
impl BackupLog for FileBackupLog {
    async fn append(&self, record: BackupRecord) -> std::result::Result<(), BackupLogError> {
        let mut records = self.records.lock().await;
        records.push(record);
        self.persist(&records).await
    }

    async fn get(&self, id: &str) -> std::result::Result<Option<BackupRecord>, BackupLogError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn list(&self) -> std::result::Result<Vec<BackupRecord>, BackupLogError> {
        Ok(self.records.lock().await.clone())
    }

    async fn list_for_node(
        &self,
        node_id: &str,
    ) -> std::result::Result<Vec<BackupRecord>, BackupLogError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|record| record.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> std::result::Result<usize, BackupLogError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|record| !ids.contains(&record.id));
        let removed = before - records.len();
        if removed > 0 {
            self.persist(&records).await?;
        }
        Ok(removed)
    }
}

// ==================== Credentials ====================

/// `credentials.json`: a map of server URL to shared secret.
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<StaticCredentials> {
        let entries: BTreeMap<String, String> = load_json(&self.path)?.unwrap_or_default();
        Ok(StaticCredentials::from_entries(entries))
    }

    pub fn save(&self, credentials: &StaticCredentials) -> Result<()> {
        save_json(&self.path, &credentials.entries())
    }
}

//! Checksummed backups, structural validation, recovery and retention.
//!
//! Every sync attempt takes a `pre-sync` backup and every surfaced conflict a
//! `pre-conflict` one. A backup stores the serialized subtree together with
//! its SHA-256 checksum; recovery refuses data whose checksum no longer
//! matches. Nothing here mutates the source tree.

use crate::config::{RetentionPolicy, millis};
use crate::node::TrayTree;
use crate::serializer::TraySerializer;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subtrees with more descendants than this get a warning.
pub const MAX_DESCENDANTS: usize = 1000;

/// Serialized subtrees larger than this get a warning.
pub const MAX_SERIALIZED_BYTES: usize = 1024 * 1024;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

static COLOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#([0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("color pattern is valid")
});

#[derive(Debug, Error)]
pub enum BackupLogError {
    #[error("Backup log error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Checksum mismatch for backup {backup_id}")]
    IntegrityCheckFailed { backup_id: String },

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Recovered tray is invalid: {0}")]
    RecoveredInvalid(String),

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] crate::serializer::SerializeError),

    #[error(transparent)]
    Log(#[from] BackupLogError),
}

pub type Result<T> = std::result::Result<T, IntegrityError>;

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupOperation {
    PreSync,
    PreConflict,
    Manual,
    Scheduled,
}

impl fmt::Display for BackupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackupOperation::PreSync => "pre-sync",
            BackupOperation::PreConflict => "pre-conflict",
            BackupOperation::Manual => "manual",
            BackupOperation::Scheduled => "scheduled",
        };
        f.write_str(label)
    }
}

/// One stored backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub node_id: String,
    pub node_name: String,
    pub operation: BackupOperation,
    pub serialized_data: String,
    /// SHA-256 of `serialized_data`, hex encoded
    pub checksum: String,
    pub captured_at: u64,
    pub size_bytes: usize,
    pub descendant_count: usize,
}

/// A backup without its payload, as offered in a recovery list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub id: String,
    pub node_id: String,
    pub node_name: String,
    pub operation: BackupOperation,
    pub captured_at: u64,
    pub size_bytes: usize,
    pub descendant_count: usize,
}

impl From<&BackupRecord> for BackupSummary {
    fn from(record: &BackupRecord) -> Self {
        Self {
            id: record.id.clone(),
            node_id: record.node_id.clone(),
            node_name: record.node_name.clone(),
            operation: record.operation,
            captured_at: record.captured_at,
            size_bytes: record.size_bytes,
            descendant_count: record.descendant_count,
        }
    }
}

/// Append-mostly storage for backup records.
///
/// Implementations:
/// - `InMemoryBackupLog` - For testing
/// - `FileBackupLog` (in tray-daemon) - JSON file
#[async_trait]
pub trait BackupLog: Send + Sync {
    async fn append(&self, record: BackupRecord) -> std::result::Result<(), BackupLogError>;

    async fn get(&self, id: &str) -> std::result::Result<Option<BackupRecord>, BackupLogError>;

    /// All records in append order.
    async fn list(&self) -> std::result::Result<Vec<BackupRecord>, BackupLogError>;

    async fn list_for_node(
        &self,
        node_id: &str,
    ) -> std::result::Result<Vec<BackupRecord>, BackupLogError>;

    /// Delete the given records. Returns how many existed.
    async fn delete(&self, ids: &[String]) -> std::result::Result<usize, BackupLogError>;
}

/// In-memory backup log for testing
#[derive(Default)]
pub struct InMemoryBackupLog {
    records: RwLock<Vec<BackupRecord>>,
}

impl InMemoryBackupLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BackupLog for InMemoryBackupLog {
    async fn append(&self, record: BackupRecord) -> std::result::Result<(), BackupLogError> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> std::result::Result<Option<BackupRecord>, BackupLogError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn list(&self) -> std::result::Result<Vec<BackupRecord>, BackupLogError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn list_for_node(
        &self,
        node_id: &str,
    ) -> std::result::Result<Vec<BackupRecord>, BackupLogError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|record| record.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> std::result::Result<usize, BackupLogError> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|record| !ids.contains(record.id.as_str()));
        Ok(before - records.len())
    }
}

/// Problems that make a tray unfit to sync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Tray has an empty id")]
    EmptyId,

    #[error("{node_id} lists {listed} children but holds {actual}")]
    ChildCountMismatch {
        node_id: String,
        listed: usize,
        actual: usize,
    },

    #[error("{node_id} lists its children in a different order than it holds them")]
    ChildOrderMismatch { node_id: String },

    #[error("{node_id} lists child {child_id} more than once")]
    DuplicateChild { node_id: String, child_id: String },

    #[error("{child_id} is held by {expected} but points at {found:?}")]
    ParentMismatch {
        child_id: String,
        expected: String,
        found: Option<String>,
    },
}

/// Quality problems that are reported but do not block a sync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationWarning {
    #[error("{node_id} has malformed border color {color:?}")]
    MalformedColor { node_id: String, color: String },

    #[error("{node_id} has implausible creation time {created_at}")]
    ImplausibleTimestamp { node_id: String, created_at: u64 },

    #[error("{node_id} has {count} descendants")]
    TooManyDescendants { node_id: String, count: usize },

    #[error("Serialized tray is {bytes} bytes")]
    TooLarge { bytes: usize },

    #[error("{node_id} has an empty name")]
    EmptyName { node_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// All errors joined into one line.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Deleted for being older than the retention window
    pub expired: usize,
    /// Deleted to respect the per-tray cap
    pub over_tray_limit: usize,
    /// Deleted to respect the global cap
    pub over_total_limit: usize,
    /// Records left afterwards
    pub remaining: usize,
}

impl CleanupReport {
    pub fn deleted(&self) -> usize {
        self.expired + self.over_tray_limit + self.over_total_limit
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub count: usize,
    pub total_bytes: usize,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

/// SHA-256 of `data`, hex encoded.
pub fn checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Takes, checks and prunes backups.
pub struct IntegrityManager {
    log: Arc<dyn BackupLog>,
    serializer: Arc<dyn TraySerializer>,
    retention: RetentionPolicy,
}

impl IntegrityManager {
    pub fn new(
        log: Arc<dyn BackupLog>,
        serializer: Arc<dyn TraySerializer>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            log,
            serializer,
            retention,
        }
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Serialize `tree`, checksum it and append it to the log.
    ///
    /// Returns the new backup id.
    pub async fn backup(
        &self,
        tree: &TrayTree,
        operation: BackupOperation,
        now: u64,
    ) -> Result<String> {
        let serialized_data = self
            .serializer
            .serialize(tree)
            .map_err(|e| IntegrityError::BackupFailed(e.to_string()))?;

        let record = BackupRecord {
            id: Uuid::new_v4().to_string(),
            node_id: tree.node.id.clone(),
            node_name: tree.node.name.clone(),
            operation,
            checksum: checksum(&serialized_data),
            size_bytes: serialized_data.len(),
            serialized_data,
            captured_at: now,
            descendant_count: tree.descendant_count(),
        };
        let id = record.id.clone();

        self.log
            .append(record)
            .await
            .map_err(|e| IntegrityError::BackupFailed(e.to_string()))?;

        debug!("Backed up {} ({}) as {}", tree.node.id, operation, id);
        Ok(id)
    }

    /// Check `tree` recursively.
    pub fn validate(&self, tree: &TrayTree, now: u64) -> ValidationReport {
        let mut report = ValidationReport::default();
        validate_node(tree, now, &mut report);

        let count = tree.descendant_count();
        if count > MAX_DESCENDANTS {
            report.warnings.push(ValidationWarning::TooManyDescendants {
                node_id: tree.node.id.clone(),
                count,
            });
        }

        match self.serializer.serialize(tree) {
            Ok(data) if data.len() > MAX_SERIALIZED_BYTES => {
                report
                    .warnings
                    .push(ValidationWarning::TooLarge { bytes: data.len() });
            }
            Ok(_) => {}
            Err(e) => warn!("Could not measure {}: {}", tree.node.id, e),
        }

        report.is_valid = report.errors.is_empty();
        report
    }

    /// Restore the tree stored in a backup.
    ///
    /// Fails if the stored checksum no longer matches or the restored tree
    /// does not validate.
    pub async fn recover(&self, backup_id: &str, now: u64) -> Result<TrayTree> {
        let record = self
            .log
            .get(backup_id)
            .await?
            .ok_or_else(|| IntegrityError::BackupNotFound(backup_id.to_string()))?;

        if checksum(&record.serialized_data) != record.checksum {
            warn!("Backup {} failed its integrity check", backup_id);
            return Err(IntegrityError::IntegrityCheckFailed {
                backup_id: backup_id.to_string(),
            });
        }

        let tree = self.serializer.deserialize(&record.serialized_data)?;
        let report = self.validate(&tree, now);
        if !report.is_valid {
            return Err(IntegrityError::RecoveredInvalid(report.error_summary()));
        }

        info!(
            "Recovered {} from backup {} ({})",
            record.node_id, backup_id, record.operation
        );
        Ok(tree)
    }

    /// Apply the retention policy: age first, then the per-tray cap, then
    /// the global cap. Newest records survive.
    pub async fn cleanup(&self, now: u64) -> Result<CleanupReport> {
        let records = self.log.list().await?;
        let max_age = millis(self.retention.max_age);

        // Newest first; later appends win ties
        let mut ordered: Vec<(usize, &BackupRecord)> = records.iter().enumerate().collect();
        ordered.sort_by(|(ia, a), (ib, b)| b.captured_at.cmp(&a.captured_at).then(ib.cmp(ia)));

        let mut report = CleanupReport::default();
        let mut doomed = Vec::new();
        let mut per_tray: HashMap<&str, usize> = HashMap::new();
        let mut kept = 0;

        for (_, record) in ordered {
            if now.saturating_sub(record.captured_at) > max_age {
                report.expired += 1;
                doomed.push(record.id.clone());
                continue;
            }
            let seen = per_tray.entry(record.node_id.as_str()).or_insert(0);
            if *seen >= self.retention.max_per_tray {
                report.over_tray_limit += 1;
                doomed.push(record.id.clone());
                continue;
            }
            *seen += 1;
            if kept >= self.retention.max_total {
                report.over_total_limit += 1;
                doomed.push(record.id.clone());
                continue;
            }
            kept += 1;
        }

        if !doomed.is_empty() {
            self.log.delete(&doomed).await?;
            info!("Backup cleanup removed {} records", doomed.len());
        }
        report.remaining = kept;
        Ok(report)
    }

    /// Delete every backup of the given trays. Returns the number removed.
    pub async fn forget(&self, node_ids: &[String]) -> Result<usize> {
        let mut doomed = Vec::new();
        for node_id in node_ids {
            doomed.extend(
                self.log
                    .list_for_node(node_id)
                    .await?
                    .into_iter()
                    .map(|record| record.id),
            );
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let removed = self.log.delete(&doomed).await?;
        debug!("Deleted {} backups of {} removed trays", removed, node_ids.len());
        Ok(removed)
    }

    /// Backups of one tray, newest first.
    pub async fn backups_for(&self, node_id: &str) -> Result<Vec<BackupSummary>> {
        let mut summaries: Vec<BackupSummary> = self
            .log
            .list_for_node(node_id)
            .await?
            .iter()
            .rev()
            .map(BackupSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        Ok(summaries)
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        let records = self.log.list().await?;
        Ok(BackupStats {
            count: records.len(),
            total_bytes: records.iter().map(|r| r.size_bytes).sum(),
            oldest: records.iter().map(|r| r.captured_at).min(),
            newest: records.iter().map(|r| r.captured_at).max(),
        })
    }
}

fn validate_node(tree: &TrayTree, now: u64, report: &mut ValidationReport) {
    let node = &tree.node;

    if node.id.is_empty() {
        report.errors.push(ValidationError::EmptyId);
    }

    let held: Vec<&str> = tree.children.iter().map(|c| c.node.id.as_str()).collect();
    let mut seen = HashSet::new();
    for child_id in &node.child_ids {
        if !seen.insert(child_id.as_str()) {
            report.errors.push(ValidationError::DuplicateChild {
                node_id: node.id.clone(),
                child_id: child_id.clone(),
            });
        }
    }
    if node.child_ids.len() != held.len() {
        report.errors.push(ValidationError::ChildCountMismatch {
            node_id: node.id.clone(),
            listed: node.child_ids.len(),
            actual: held.len(),
        });
    } else if node.child_ids.iter().map(String::as_str).ne(held.iter().copied()) {
        report.errors.push(ValidationError::ChildOrderMismatch {
            node_id: node.id.clone(),
        });
    }

    for child in &tree.children {
        if child.node.parent_id.as_deref() != Some(node.id.as_str()) {
            report.errors.push(ValidationError::ParentMismatch {
                child_id: child.node.id.clone(),
                expected: node.id.clone(),
                found: child.node.parent_id.clone(),
            });
        }
    }

    if !COLOR_PATTERN.is_match(&node.border_color) {
        report.warnings.push(ValidationWarning::MalformedColor {
            node_id: node.id.clone(),
            color: node.border_color.clone(),
        });
    }
    if node.created_at == 0 || node.created_at > now.saturating_add(DAY_MS) {
        report.warnings.push(ValidationWarning::ImplausibleTimestamp {
            node_id: node.id.clone(),
            created_at: node.created_at,
        });
    }
    if node.name.trim().is_empty() {
        report.warnings.push(ValidationWarning::EmptyName {
            node_id: node.id.clone(),
        });
    }

    for child in &tree.children {
        validate_node(child, now, report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TrayNode;
    use crate::serializer::JsonSerializer;

    const NOW: u64 = 1_700_000_000_000;

    fn manager() -> (IntegrityManager, Arc<InMemoryBackupLog>) {
        let log = Arc::new(InMemoryBackupLog::new());
        let manager = IntegrityManager::new(
            log.clone(),
            Arc::new(JsonSerializer),
            RetentionPolicy::default(),
        );
        (manager, log)
    }

    fn tree_with(descendants: usize) -> TrayTree {
        let mut root = TrayTree::leaf(TrayNode::new("root", "Root @inbox", NOW));
        for i in 0..descendants {
            let mut child = TrayNode::new(format!("c{i}"), format!("Item {i}"), NOW);
            child.parent_id = Some("root".into());
            root.node.child_ids.push(child.id.clone());
            root.children.push(TrayTree::leaf(child));
        }
        root
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_backup_round_trip_empty_subtree() {
        let (manager, log) = manager();
        let tree = tree_with(0);

        let id = manager.backup(&tree, BackupOperation::Manual, NOW).await.unwrap();
        let record = log.get(&id).await.unwrap().unwrap();
        assert_eq!(record.descendant_count, 0);
        assert_eq!(record.size_bytes, record.serialized_data.len());

        let recovered = manager.recover(&id, NOW).await.unwrap();
        assert_eq!(recovered, tree);
        assert_eq!(
            JsonSerializer.serialize(&recovered).unwrap(),
            record.serialized_data
        );
    }

    #[tokio::test]
    async fn test_backup_round_trip_500_descendants() {
        let (manager, log) = manager();
        let tree = tree_with(500);

        let id = manager.backup(&tree, BackupOperation::PreSync, NOW).await.unwrap();
        let record = log.get(&id).await.unwrap().unwrap();
        assert_eq!(record.descendant_count, 500);

        let recovered = manager.recover(&id, NOW).await.unwrap();
        assert_eq!(
            JsonSerializer.serialize(&recovered).unwrap(),
            record.serialized_data
        );
    }

    #[tokio::test]
    async fn test_tampered_backup_is_rejected() {
        let (manager, log) = manager();
        let id = manager
            .backup(&tree_with(2), BackupOperation::Manual, NOW)
            .await
            .unwrap();

        let mut record = log.get(&id).await.unwrap().unwrap();
        record.id = "tampered".into();
        record.serialized_data = record.serialized_data.replace("Item 0", "Item X");
        log.append(record).await.unwrap();

        let err = manager.recover("tampered", NOW).await.unwrap_err();
        assert!(matches!(err, IntegrityError::IntegrityCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_recover_unknown_backup() {
        let (manager, _log) = manager();
        let err = manager.recover("nope", NOW).await.unwrap_err();
        assert!(matches!(err, IntegrityError::BackupNotFound(_)));
    }

    #[tokio::test]
    async fn test_recovered_invalid_tree_is_rejected() {
        let (manager, log) = manager();
        let mut tree = tree_with(1);
        tree.node.child_ids.push("ghost".into());

        let id = manager.backup(&tree, BackupOperation::Manual, NOW).await.unwrap();
        assert_eq!(log.len(), 1);

        let err = manager.recover(&id, NOW).await.unwrap_err();
        assert!(matches!(err, IntegrityError::RecoveredInvalid(_)));
    }

    #[test]
    fn test_validate_errors() {
        let (manager, _log) = manager();

        let mut tree = tree_with(2);
        tree.node.child_ids.reverse();
        let report = manager.validate(&tree, NOW);
        assert!(!report.is_valid);
        assert_eq!(
            report.errors,
            vec![ValidationError::ChildOrderMismatch {
                node_id: "root".into()
            }]
        );

        let mut tree = tree_with(1);
        tree.children[0].node.parent_id = Some("elsewhere".into());
        let report = manager.validate(&tree, NOW);
        assert!(matches!(
            report.errors.as_slice(),
            [ValidationError::ParentMismatch { .. }]
        ));

        let mut tree = tree_with(1);
        tree.node.child_ids.push("c0".into());
        let report = manager.validate(&tree, NOW);
        assert!(report.errors.contains(&ValidationError::DuplicateChild {
            node_id: "root".into(),
            child_id: "c0".into()
        }));
        assert!(report.errors.contains(&ValidationError::ChildCountMismatch {
            node_id: "root".into(),
            listed: 2,
            actual: 1
        }));

        let mut tree = tree_with(0);
        tree.node.id.clear();
        assert!(manager.validate(&tree, NOW).errors.contains(&ValidationError::EmptyId));
    }

    #[test]
    fn test_validate_warnings_do_not_invalidate() {
        let (manager, _log) = manager();
        let mut tree = tree_with(1);
        tree.node.border_color = "red".into();
        tree.node.name = "  ".into();
        tree.children[0].node.created_at = NOW + 2 * DAY_MS;

        let report = manager.validate(&tree, NOW);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 3);

        tree.node.border_color = "#abc".into();
        tree.node.name = "Root".into();
        tree.children[0].node.created_at = NOW;
        assert!(manager.validate(&tree, NOW).warnings.is_empty());
    }

    #[test]
    fn test_validate_large_tree_warns() {
        let (manager, _log) = manager();
        let report = manager.validate(&tree_with(1001), NOW);
        assert!(report.is_valid);
        assert!(report.warnings.contains(&ValidationWarning::TooManyDescendants {
            node_id: "root".into(),
            count: 1001
        }));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest_per_tray() {
        let (manager, log) = manager();
        let tree = tree_with(0);
        for i in 0..150 {
            manager
                .backup(&tree, BackupOperation::PreSync, NOW + i)
                .await
                .unwrap();
        }

        let report = manager.cleanup(NOW + 150).await.unwrap();
        assert_eq!(report.over_tray_limit, 140);
        assert_eq!(report.remaining, 10);
        assert_eq!(log.len(), 10);

        let kept = manager.backups_for("root").await.unwrap();
        let times: Vec<u64> = kept.iter().map(|s| s.captured_at).collect();
        let expected: Vec<u64> = (140..150).rev().map(|i| NOW + i).collect();
        assert_eq!(times, expected);
    }

    #[tokio::test]
    async fn test_forget_deletes_only_named_trays() {
        let (manager, log) = manager();
        for id in ["a", "b", "c"] {
            let tree = TrayTree::leaf(TrayNode::new(id, "Tray", NOW));
            manager.backup(&tree, BackupOperation::PreSync, NOW).await.unwrap();
            manager.backup(&tree, BackupOperation::Manual, NOW + 1).await.unwrap();
        }

        let removed = manager
            .forget(&["a".to_string(), "c".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 4);
        assert_eq!(log.len(), 2);
        assert!(manager.backups_for("a").await.unwrap().is_empty());
        assert_eq!(manager.backups_for("b").await.unwrap().len(), 2);
        assert_eq!(manager.forget(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_age_and_global_cap() {
        let log = Arc::new(InMemoryBackupLog::new());
        let manager = IntegrityManager::new(
            log.clone(),
            Arc::new(JsonSerializer),
            RetentionPolicy {
                max_total: 5,
                ..RetentionPolicy::default()
            },
        );

        let old = TrayTree::leaf(TrayNode::new("old", "Old", NOW));
        manager.backup(&old, BackupOperation::Scheduled, NOW).await.unwrap();

        let later = NOW + 8 * DAY_MS;
        for i in 0..8 {
            let tree = TrayTree::leaf(TrayNode::new(format!("t{i}"), "Tray", NOW));
            manager
                .backup(&tree, BackupOperation::Manual, later + i)
                .await
                .unwrap();
        }

        let report = manager.cleanup(later + 10).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.over_total_limit, 3);
        assert_eq!(report.remaining, 5);
        assert_eq!(report.deleted(), 4);
        assert!(manager.backups_for("t0").await.unwrap().is_empty());
        assert_eq!(manager.backups_for("t7").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let (manager, _log) = manager();
        assert_eq!(manager.stats().await.unwrap(), BackupStats::default());

        manager.backup(&tree_with(0), BackupOperation::Manual, 10).await.unwrap();
        manager.backup(&tree_with(3), BackupOperation::Manual, 20).await.unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.oldest, Some(10));
        assert_eq!(stats.newest, Some(20));
        assert!(stats.total_bytes > 0);
    }

    #[test]
    fn test_operation_labels() {
        assert_eq!(
            serde_json::to_string(&BackupOperation::PreConflict).unwrap(),
            "\"pre-conflict\""
        );
        assert_eq!(BackupOperation::PreSync.to_string(), "pre-sync");
    }
}

//! Baseline-diff conflict detection and manual resolution.
//!
//! For one tray and one sync attempt, the detector compares the local tray
//! and the remote copy against the last synchronized baseline:
//!
//! | baseline | local changed | remote changed | action   |
//! |----------|---------------|----------------|----------|
//! | absent   | -             | remote exists  | download |
//! | absent   | -             | remote missing | upload   |
//! | present  | yes           | no             | upload   |
//! | present  | no            | yes            | download |
//! | present  | no            | no             | nothing  |
//! | present  | yes           | yes            | conflict |
//!
//! Conflicts are subtyped in a fixed order: structure first, then creation
//! timestamp, then plain "both updated". Conflicts are never resolved
//! automatically; [`resolve`] implements the user's explicit choice.

use crate::baseline::BaselineSnapshot;
use crate::hash::snapshot_hash;
use crate::node::TrayTree;
use crate::node::TrayNode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Creation timestamps further apart than this are a timestamp conflict.
pub const DEFAULT_TIMESTAMP_WINDOW_MS: u64 = 1_000;

/// Why both sides disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Local and remote children/parent differ
    StructureConflict,
    /// Same structure, but creation times differ by more than the window
    TimestampConflict,
    /// Same structure and creation time, both edited
    BothUpdated,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictKind::StructureConflict => "structure_conflict",
            ConflictKind::TimestampConflict => "timestamp_conflict",
            ConflictKind::BothUpdated => "both_updated",
        };
        f.write_str(label)
    }
}

/// What to do with one tray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Upload,
    Download,
    Conflict(ConflictKind),
    Nothing,
}

/// A field that drifted from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedField {
    ContentHash,
    StructureHash,
    Name,
    Done,
    Properties,
    Hooks,
}

/// Result of classifying one tray.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDecision {
    pub action: SyncAction,
    pub reason: &'static str,
    /// Local fields that drifted from the baseline
    pub local_changes: Vec<ChangedField>,
    /// Remote fields that drifted from the baseline
    pub remote_changes: Vec<ChangedField>,
}

impl SyncDecision {
    fn new(action: SyncAction, reason: &'static str) -> Self {
        Self {
            action,
            reason,
            local_changes: Vec::new(),
            remote_changes: Vec::new(),
        }
    }
}

/// User decision for a reported conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Merge,
}

impl Resolution {
    /// Every option offered for a conflict.
    pub const ALL: [Resolution; 3] = [Resolution::KeepLocal, Resolution::KeepRemote, Resolution::Merge];
}

/// Classifies sync situations.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    timestamp_window_ms: u64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self {
            timestamp_window_ms: DEFAULT_TIMESTAMP_WINDOW_MS,
        }
    }
}

impl ConflictDetector {
    pub fn new(timestamp_window_ms: u64) -> Self {
        Self {
            timestamp_window_ms,
        }
    }

    /// Decide what to do with `local` given the remote copy and the baseline.
    ///
    /// `remote` is `None` when the server has no file for this tray. A failed
    /// fetch must not be passed as `None`; the caller reports it separately.
    pub fn classify(
        &self,
        local: &TrayNode,
        remote: Option<&TrayNode>,
        baseline: Option<&BaselineSnapshot>,
    ) -> SyncDecision {
        let Some(baseline) = baseline else {
            return match remote {
                Some(_) => SyncDecision::new(
                    SyncAction::Download,
                    "no local baseline, remote authoritative",
                ),
                None => SyncDecision::new(SyncAction::Upload, "new local node"),
            };
        };

        let local_changes = changes_since(local, baseline);

        let Some(remote) = remote else {
            let mut decision =
                SyncDecision::new(SyncAction::Upload, "remote copy missing, recreating it");
            decision.local_changes = local_changes;
            return decision;
        };

        let remote_changes = changes_since(remote, baseline);

        let (action, reason) = match (!local_changes.is_empty(), !remote_changes.is_empty()) {
            (true, false) => (SyncAction::Upload, "local changes only"),
            (false, true) => (SyncAction::Download, "remote changes only"),
            (false, false) => (SyncAction::Nothing, "in sync"),
            (true, true) => {
                let kind = self.conflict_kind(local, remote);
                (SyncAction::Conflict(kind), "both sides changed since last sync")
            }
        };

        SyncDecision {
            action,
            reason,
            local_changes,
            remote_changes,
        }
    }

    fn conflict_kind(&self, local: &TrayNode, remote: &TrayNode) -> ConflictKind {
        if snapshot_hash(local).structure != snapshot_hash(remote).structure {
            ConflictKind::StructureConflict
        } else if local.created_at.abs_diff(remote.created_at) > self.timestamp_window_ms {
            ConflictKind::TimestampConflict
        } else {
            ConflictKind::BothUpdated
        }
    }
}

/// Fields of `node` that differ from `baseline`.
pub fn changes_since(node: &TrayNode, baseline: &BaselineSnapshot) -> Vec<ChangedField> {
    let hash = snapshot_hash(node);
    let mut changes = Vec::new();
    if hash.content != baseline.content_hash {
        changes.push(ChangedField::ContentHash);
    }
    if hash.structure != baseline.structure_hash {
        changes.push(ChangedField::StructureHash);
    }
    if node.name != baseline.name {
        changes.push(ChangedField::Name);
    }
    if node.is_done() != baseline.is_done {
        changes.push(ChangedField::Done);
    }
    if node.properties != baseline.properties {
        changes.push(ChangedField::Properties);
    }
    if node.hooks() != baseline.hooks {
        changes.push(ChangedField::Hooks);
    }
    changes
}

/// Apply a user's resolution choice.
///
/// The resolved tree always carries the local tray's id and parent link so it
/// can be written back into the local graph. The caller updates the baseline
/// to the result.
pub fn resolve(local: &TrayTree, remote: &TrayTree, choice: Resolution) -> TrayTree {
    let mut resolved = match choice {
        Resolution::KeepLocal => local.clone(),
        Resolution::KeepRemote => remote.clone(),
        Resolution::Merge => merge(local, remote),
    };
    resolved.node.id = local.node.id.clone();
    resolved.node.parent_id = local.node.parent_id.clone();
    resolved.node.child_ids = resolved
        .children
        .iter()
        .map(|child| child.node.id.clone())
        .collect();
    resolved
}

/// Union of both sides: remote properties overlaid by local ones, hooks from
/// both, the newer creation time, everything else from local.
fn merge(local: &TrayTree, remote: &TrayTree) -> TrayTree {
    let mut merged = local.clone();

    let mut properties = remote.node.properties.clone();
    properties.extend(local.node.properties.clone());
    merged.node.properties = properties;

    let local_hooks = local.node.hooks();
    for hook in remote.node.hooks() {
        if !local_hooks.contains(&hook) {
            merged.node.name = format!("{} @{}", merged.node.name, hook);
        }
    }

    merged.node.created_at = local.node.created_at.max(remote.node.created_at);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_node() -> TrayNode {
        let mut node = TrayNode::new("n1", "Groceries @home", 10_000);
        node.parent_id = Some("root".into());
        node.child_ids = vec!["c1".into()];
        node.properties.insert("store".into(), "corner".into());
        node
    }

    fn baseline() -> BaselineSnapshot {
        BaselineSnapshot::capture(&base_node(), 0)
    }

    fn detector() -> ConflictDetector {
        ConflictDetector::default()
    }

    #[test]
    fn test_no_baseline_remote_present_downloads() {
        let decision = detector().classify(&base_node(), Some(&base_node()), None);
        assert_eq!(decision.action, SyncAction::Download);
    }

    #[test]
    fn test_no_baseline_remote_absent_uploads() {
        let decision = detector().classify(&base_node(), None, None);
        assert_eq!(decision.action, SyncAction::Upload);
        assert_eq!(decision.reason, "new local node");
    }

    #[test]
    fn test_remote_changed_downloads() {
        let mut remote = base_node();
        remote.name = "Groceries @home ✓".into();

        let decision = detector().classify(&base_node(), Some(&remote), Some(&baseline()));
        assert_eq!(decision.action, SyncAction::Download);
        assert!(decision.local_changes.is_empty());
        assert!(decision.remote_changes.contains(&ChangedField::Done));
    }

    #[test]
    fn test_local_changed_uploads() {
        let mut local = base_node();
        local.properties.insert("store".into(), "market".into());

        let decision = detector().classify(&local, Some(&base_node()), Some(&baseline()));
        assert_eq!(decision.action, SyncAction::Upload);
        assert!(decision.local_changes.contains(&ChangedField::Properties));
    }

    #[test]
    fn test_unchanged_is_nothing() {
        let decision = detector().classify(&base_node(), Some(&base_node()), Some(&baseline()));
        assert_eq!(decision.action, SyncAction::Nothing);
    }

    #[test]
    fn test_structure_conflict() {
        let mut local = base_node();
        local.name = "Local edit".into();
        local.child_ids.push("c2".into());
        let mut remote = base_node();
        remote.name = "Remote edit".into();

        let decision = detector().classify(&local, Some(&remote), Some(&baseline()));
        assert_eq!(
            decision.action,
            SyncAction::Conflict(ConflictKind::StructureConflict)
        );
    }

    #[test]
    fn test_structure_takes_precedence_over_timestamp() {
        let mut local = base_node();
        local.child_ids.clear();
        let mut remote = base_node();
        remote.name = "Remote edit".into();
        remote.created_at += 5_000;

        let decision = detector().classify(&local, Some(&remote), Some(&baseline()));
        assert_eq!(
            decision.action,
            SyncAction::Conflict(ConflictKind::StructureConflict)
        );
    }

    #[test]
    fn test_timestamp_conflict() {
        let mut local = base_node();
        local.name = "Local edit".into();
        let mut remote = base_node();
        remote.name = "Remote edit".into();
        remote.created_at += 2_000;

        let decision = detector().classify(&local, Some(&remote), Some(&baseline()));
        assert_eq!(
            decision.action,
            SyncAction::Conflict(ConflictKind::TimestampConflict)
        );
    }

    #[test]
    fn test_both_updated_within_window() {
        let mut local = base_node();
        local.name = "Local edit".into();
        let mut remote = base_node();
        remote.name = "Remote edit".into();
        remote.created_at += 1_000;

        let decision = detector().classify(&local, Some(&remote), Some(&baseline()));
        assert_eq!(decision.action, SyncAction::Conflict(ConflictKind::BothUpdated));
    }

    #[test]
    fn test_remote_missing_with_baseline_uploads() {
        let decision = detector().classify(&base_node(), None, Some(&baseline()));
        assert_eq!(decision.action, SyncAction::Upload);
    }

    #[test]
    fn test_conflict_kind_labels() {
        assert_eq!(ConflictKind::StructureConflict.to_string(), "structure_conflict");
        assert_eq!(ConflictKind::TimestampConflict.to_string(), "timestamp_conflict");
        assert_eq!(ConflictKind::BothUpdated.to_string(), "both_updated");
    }

    fn conflicting_trees() -> (TrayTree, TrayTree) {
        let mut local = TrayTree::leaf(base_node());
        local.node.name = "Groceries @home @weekly".into();
        local.node.properties.insert("store".into(), "market".into());
        local.node.properties.insert("budget".into(), 40.0.into());
        local.children.push(TrayTree::leaf(TrayNode::new("c1", "Milk", 0)));
        local.node.child_ids = vec!["c1".into()];

        let mut remote = TrayTree::leaf(base_node());
        remote.node.id = "server-copy".into();
        remote.node.parent_id = None;
        remote.node.name = "Groceries @home @urgent".into();
        remote.node.properties.insert("note".into(), "bring bags".into());
        remote.node.created_at = 20_000;
        remote.children.push(TrayTree::leaf(TrayNode::new("r1", "Eggs", 0)));
        remote.node.child_ids = vec!["r1".into()];

        (local, remote)
    }

    #[test]
    fn test_resolve_keep_local() {
        let (local, remote) = conflicting_trees();
        assert_eq!(resolve(&local, &remote, Resolution::KeepLocal), local);
    }

    #[test]
    fn test_resolve_keep_remote_keeps_local_identity() {
        let (local, remote) = conflicting_trees();
        let resolved = resolve(&local, &remote, Resolution::KeepRemote);

        assert_eq!(resolved.node.id, "n1");
        assert_eq!(resolved.node.parent_id.as_deref(), Some("root"));
        assert_eq!(resolved.node.name, "Groceries @home @urgent");
        assert_eq!(resolved.node.child_ids, vec!["r1"]);
    }

    #[test]
    fn test_resolve_merge() {
        let (local, remote) = conflicting_trees();
        let resolved = resolve(&local, &remote, Resolution::Merge);

        // Local wins on collision, remote-only keys survive
        assert_eq!(resolved.node.properties.get("store"), Some(&"market".into()));
        assert_eq!(resolved.node.properties.get("note"), Some(&"bring bags".into()));
        assert_eq!(resolved.node.properties.get("budget"), Some(&40.0.into()));

        assert_eq!(resolved.node.hooks(), vec!["home", "weekly", "urgent"]);
        assert_eq!(resolved.node.created_at, 20_000);
        assert_eq!(resolved.node.child_ids, vec!["c1"]);
        assert_eq!(resolved.node.id, "n1");
    }
}

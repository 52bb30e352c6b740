//! Baselines: the last known-synchronized state of each tray.
//!
//! A baseline keeps both hashes plus the fields they were computed from, so
//! the upload/download/conflict decision can be re-derived from stored data
//! alone.

use crate::hash::{content_hash_of, snapshot_hash, structure_hash_of};
use crate::node::{PropertyValue, TrayNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("Baseline store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, BaselineError>;

/// Last synchronized state of one tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineSnapshot {
    pub node_id: String,
    pub content_hash: String,
    pub structure_hash: String,
    pub name: String,
    pub is_done: bool,
    pub hooks: Vec<String>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub child_ids: Vec<String>,
    pub parent_id: Option<String>,
    /// When the snapshot was taken (ms since epoch)
    pub captured_at: u64,
}

impl BaselineSnapshot {
    /// Capture the current state of a tray.
    pub fn capture(node: &TrayNode, captured_at: u64) -> Self {
        let hash = snapshot_hash(node);
        Self {
            node_id: node.id.clone(),
            content_hash: hash.content,
            structure_hash: hash.structure,
            name: node.name.clone(),
            is_done: node.is_done(),
            hooks: node.hooks(),
            properties: node.properties.clone(),
            child_ids: node.child_ids.clone(),
            parent_id: node.parent_id.clone(),
            captured_at,
        }
    }

    /// Whether the stored hashes still match the stored fields.
    pub fn is_consistent(&self) -> bool {
        self.content_hash
            == content_hash_of(&self.name, &self.properties, &self.hooks, self.is_done)
            && self.structure_hash == structure_hash_of(&self.child_ids, self.parent_id.as_deref())
    }
}

/// Persistent map of node id → baseline.
///
/// Implementations:
/// - `InMemoryBaselineStore` - For testing
/// - `FileBaselineStore` (in tray-daemon) - JSON file
pub trait BaselineStore: Send + Sync {
    fn get(&self, node_id: &str) -> Result<Option<BaselineSnapshot>>;

    fn put(&self, snapshot: BaselineSnapshot) -> Result<()>;

    fn remove(&self, node_id: &str) -> Result<()>;
}

/// In-memory baseline store for testing
#[derive(Default)]
pub struct InMemoryBaselineStore {
    baselines: RwLock<HashMap<String, BaselineSnapshot>>,
}

impl InMemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
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
}

impl BaselineStore for InMemoryBaselineStore {
    fn get(&self, node_id: &str) -> Result<Option<BaselineSnapshot>> {
        Ok(self
            .baselines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned())
    }

    fn put(&self, snapshot: BaselineSnapshot) -> Result<()> {
        self.baselines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.node_id.clone(), snapshot);
        Ok(())
    }

    fn remove(&self, node_id: &str) -> Result<()> {
        self.baselines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id);
        Ok(())
    }
}

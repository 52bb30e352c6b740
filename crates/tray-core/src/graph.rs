//! TreeGraph: the tray hierarchy as an arena of nodes keyed by id.
//!
//! Every node lives in one table. Relationships are two adjacency lists kept
//! in lockstep: `child_ids` on the parent (forward edges, display order) and
//! `parent_id` on the child (back edges). All mutations check their
//! preconditions first and only then touch the table, so a rejected
//! operation never leaves a half-applied change behind.
//!
//! The graph is purely synchronous. When shared with the scheduler it lives
//! behind a `std::sync::RwLock` (see [`SharedTree`]) that must never be held
//! across an `.await`.

use crate::node::{FlexDirection, PropertyValue, TrayNode, TrayTree};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors for structural mutations that would break the tree invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Tray not found: {0}")]
    NotFound(String),

    #[error("Tray already exists: {0}")]
    DuplicateId(String),

    #[error("Graph already has a root ({0})")]
    RootExists(String),

    #[error("Invalid tray: {0}")]
    InvalidNode(String),

    #[error("Tray id {0} is already used outside the replaced subtree")]
    IdCollision(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// A consistency problem reported by [`TreeGraph::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphIssue {
    #[error("{parent} lists unknown child {child}")]
    MissingChild { parent: String, child: String },

    #[error("{child} points at unknown parent {parent}")]
    MissingParent { child: String, parent: String },

    #[error("{parent} lists {child}, but {child} does not point back")]
    ChildNotBackLinked { parent: String, child: String },

    #[error("{child} points at {parent}, but {parent} does not list it")]
    ParentNotForwardLinked { child: String, parent: String },

    #[error("{parent} lists {child} more than once")]
    DuplicateChild { parent: String, child: String },

    #[error("{0} is its own parent")]
    SelfParent(String),

    #[error("{0} is part of a cycle")]
    Cycle(String),

    #[error("{0} is not reachable from the root")]
    Unreachable(String),

    #[error("Root {0} has a parent")]
    RootHasParent(String),

    #[error("{0} has no parent but is not the root")]
    ExtraRoot(String),

    #[error("Root {0} is not in the graph")]
    MissingRoot(String),
}

/// Tree shared between the application and the sync scheduler.
pub type SharedTree = Arc<RwLock<TreeGraph>>;

/// The tray hierarchy.
#[derive(Debug, Clone, Default)]
pub struct TreeGraph {
    nodes: HashMap<String, TrayNode>,
    root_id: Option<String>,
}

impl TreeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a graph holding a single root tray.
    pub fn with_root(root: TrayNode) -> Result<Self> {
        let mut graph = Self::new();
        graph.add_node(root, None)?;
        Ok(graph)
    }

    /// Wrap in the lock used to share the tree with the scheduler.
    pub fn into_shared(self) -> SharedTree {
        Arc::new(RwLock::new(self))
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&TrayNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TrayNode> {
        self.nodes.values()
    }

    // ==================== Structural mutations ====================

    /// Insert a tray, appending it to `parent_id`'s children if given.
    ///
    /// A parentless tray becomes the root; only one root is allowed.
    pub fn add_node(&mut self, mut node: TrayNode, parent_id: Option<&str>) -> Result<()> {
        if node.id.is_empty() {
            return Err(GraphError::InvalidNode("empty id".into()));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateId(node.id));
        }
        if !node.child_ids.is_empty() {
            return Err(GraphError::InvalidNode(format!(
                "{} already lists children; add them individually",
                node.id
            )));
        }

        match parent_id {
            Some(parent) => {
                let parent_node = self
                    .nodes
                    .get_mut(parent)
                    .ok_or_else(|| GraphError::NotFound(parent.to_string()))?;
                parent_node.child_ids.push(node.id.clone());
                node.parent_id = Some(parent.to_string());
            }
            None => {
                if let Some(root) = &self.root_id {
                    return Err(GraphError::RootExists(root.clone()));
                }
                node.parent_id = None;
                self.root_id = Some(node.id.clone());
            }
        }

        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a tray and its whole subtree.
    ///
    /// Returns every removed id in post-order (children before parents) so
    /// callers can cascade-clean baselines, queue entries and backups.
    pub fn remove_node(&mut self, id: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::NotFound(id.to_string()));
        }

        let removed = self.post_order(id);

        let parent = self.nodes.get(id).and_then(|n| n.parent_id.clone());
        if let Some(parent) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.child_ids.retain(|c| c != id);
            }
        }
        if self.root_id.as_deref() == Some(id) {
            self.root_id = None;
        }

        for removed_id in &removed {
            self.nodes.remove(removed_id);
        }
        Ok(removed)
    }

    /// Move a tray under a new parent, appending it to the parent's children.
    ///
    /// Returns false (and changes nothing) if the target is the tray itself,
    /// one of its descendants, or unknown.
    pub fn move_node(&mut self, id: &str, new_parent_id: Option<&str>) -> bool {
        self.move_node_at(id, new_parent_id, None)
    }

    /// Move a tray under a new parent at a display position.
    ///
    /// `position` is clamped to the parent's child count; `None` appends.
    /// Moving to `None` only succeeds for the current root (a no-op).
    pub fn move_node_at(
        &mut self,
        id: &str,
        new_parent_id: Option<&str>,
        position: Option<usize>,
    ) -> bool {
        if !self.nodes.contains_key(id) {
            return false;
        }

        let Some(new_parent) = new_parent_id else {
            return self.root_id.as_deref() == Some(id);
        };

        if new_parent == id || !self.nodes.contains_key(new_parent) {
            return false;
        }
        if self.is_descendant(new_parent, id) {
            return false;
        }

        let old_parent = self.nodes.get(id).and_then(|n| n.parent_id.clone());
        if let Some(old_parent) = &old_parent {
            if let Some(old_parent_node) = self.nodes.get_mut(old_parent) {
                old_parent_node.child_ids.retain(|c| c != id);
            }
        }

        if let Some(parent_node) = self.nodes.get_mut(new_parent) {
            let index = position
                .unwrap_or(parent_node.child_ids.len())
                .min(parent_node.child_ids.len());
            parent_node.child_ids.insert(index, id.to_string());
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent_id = Some(new_parent.to_string());
        }
        true
    }

    // ==================== Queries ====================

    /// Direct children in display order.
    pub fn children(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.child_ids.clone())
            .unwrap_or_default()
    }

    pub fn parent(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).and_then(|n| n.parent_id.as_deref())
    }

    /// Ancestors, nearest first.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut current = self.parent(id);
        while let Some(parent) = current {
            if result.len() > self.nodes.len() {
                break;
            }
            result.push(parent.to_string());
            current = self.parent(parent);
        }
        result
    }

    /// All descendants in pre-order (display order).
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut stack: Vec<&str> = self
            .nodes
            .get(id)
            .map(|n| n.child_ids.iter().rev().map(String::as_str).collect())
            .unwrap_or_default();
        let mut seen = HashSet::new();

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            result.push(current.to_string());
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.child_ids.iter().rev().map(String::as_str));
            }
        }
        result
    }

    /// Other children of the same parent, in display order.
    pub fn siblings(&self, id: &str) -> Vec<String> {
        match self.parent(id) {
            Some(parent) => self
                .children(parent)
                .into_iter()
                .filter(|c| c != id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether `candidate` lies strictly below `ancestor`.
    pub fn is_descendant(&self, candidate: &str, ancestor: &str) -> bool {
        self.ancestors(candidate).iter().any(|a| a == ancestor)
    }

    /// Number of descendants below a tray.
    pub fn subtree_size(&self, id: &str) -> usize {
        self.descendants(id).len()
    }

    /// Ids of every network-bound tray, in pre-order from the root.
    pub fn network_nodes(&self) -> Vec<String> {
        let Some(root) = &self.root_id else {
            return Vec::new();
        };
        std::iter::once(root.clone())
            .chain(self.descendants(root))
            .filter(|id| {
                self.nodes
                    .get(id)
                    .map(TrayNode::is_network_bound)
                    .unwrap_or(false)
            })
            .collect()
    }

    // ==================== Validation ====================

    /// Check adjacency consistency, root reachability and acyclicity.
    ///
    /// Never mutates. An empty result means the graph is a well-formed tree.
    pub fn validate(&self) -> Vec<GraphIssue> {
        let mut issues = Vec::new();

        for node in self.nodes.values() {
            if node.parent_id.as_deref() == Some(node.id.as_str()) {
                issues.push(GraphIssue::SelfParent(node.id.clone()));
            }

            let mut seen = HashSet::new();
            for child in &node.child_ids {
                if !seen.insert(child) {
                    issues.push(GraphIssue::DuplicateChild {
                        parent: node.id.clone(),
                        child: child.clone(),
                    });
                    continue;
                }
                match self.nodes.get(child) {
                    None => issues.push(GraphIssue::MissingChild {
                        parent: node.id.clone(),
                        child: child.clone(),
                    }),
                    Some(child_node) if child_node.parent_id.as_ref() != Some(&node.id) => {
                        issues.push(GraphIssue::ChildNotBackLinked {
                            parent: node.id.clone(),
                            child: child.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }

            match &node.parent_id {
                Some(parent) => match self.nodes.get(parent) {
                    None => issues.push(GraphIssue::MissingParent {
                        child: node.id.clone(),
                        parent: parent.clone(),
                    }),
                    Some(parent_node) if !parent_node.child_ids.contains(&node.id) => {
                        issues.push(GraphIssue::ParentNotForwardLinked {
                            child: node.id.clone(),
                            parent: parent.clone(),
                        })
                    }
                    Some(_) => {}
                },
                None => {
                    if self.root_id.as_ref() != Some(&node.id) {
                        issues.push(GraphIssue::ExtraRoot(node.id.clone()));
                    }
                }
            }
        }

        issues.extend(self.cycle_issues());

        match &self.root_id {
            Some(root) => match self.nodes.get(root) {
                None => issues.push(GraphIssue::MissingRoot(root.clone())),
                Some(root_node) => {
                    if root_node.parent_id.is_some() {
                        issues.push(GraphIssue::RootHasParent(root.clone()));
                    }
                    let mut reachable: HashSet<String> =
                        self.descendants(root).into_iter().collect();
                    reachable.insert(root.clone());
                    let mut unreachable: Vec<_> = self
                        .nodes
                        .keys()
                        .filter(|id| !reachable.contains(*id))
                        .cloned()
                        .collect();
                    unreachable.sort();
                    issues.extend(unreachable.into_iter().map(GraphIssue::Unreachable));
                }
            },
            None => {
                let mut ids: Vec<_> = self.nodes.keys().cloned().collect();
                ids.sort();
                issues.extend(ids.into_iter().map(GraphIssue::Unreachable));
            }
        }

        issues
    }

    /// Follow back edges from every node; a walk longer than the node count
    /// can only be a cycle.
    fn cycle_issues(&self) -> Vec<GraphIssue> {
        let mut in_cycle = Vec::new();
        for id in self.nodes.keys() {
            let mut steps = 0;
            let mut current = self.parent(id);
            while let Some(parent) = current {
                if parent == id {
                    in_cycle.push(id.clone());
                    break;
                }
                steps += 1;
                if steps > self.nodes.len() {
                    break;
                }
                current = self.parent(parent);
            }
        }
        in_cycle.sort();
        in_cycle.into_iter().map(GraphIssue::Cycle).collect()
    }

    // ==================== Content operations ====================

    fn node_mut(&mut self, id: &str) -> Result<&mut TrayNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))
    }

    pub fn rename(&mut self, id: &str, name: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.name = name.into();
        Ok(())
    }

    pub fn set_property(
        &mut self,
        id: &str,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.node_mut(id)?
            .properties
            .insert(key.into(), value.into());
        Ok(())
    }

    pub fn remove_property(&mut self, id: &str, key: &str) -> Result<Option<PropertyValue>> {
        Ok(self.node_mut(id)?.properties.remove(key))
    }

    /// Bind a tray to a remote file.
    pub fn bind_network(
        &mut self,
        id: &str,
        host_url: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Result<()> {
        let node = self.node_mut(id)?;
        node.host_url = Some(host_url.into());
        node.file_name = Some(file_name.into());
        Ok(())
    }

    pub fn unbind_network(&mut self, id: &str) -> Result<()> {
        let node = self.node_mut(id)?;
        node.host_url = None;
        node.file_name = None;
        node.auto_sync = false;
        Ok(())
    }

    pub fn set_auto_sync(&mut self, id: &str, enabled: bool) -> Result<()> {
        self.node_mut(id)?.auto_sync = enabled;
        Ok(())
    }

    pub fn set_folded(&mut self, id: &str, folded: bool) -> Result<()> {
        self.node_mut(id)?.is_folded = folded;
        Ok(())
    }

    pub fn set_border_color(&mut self, id: &str, color: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.border_color = color.into();
        Ok(())
    }

    pub fn set_flex_direction(&mut self, id: &str, direction: FlexDirection) -> Result<()> {
        self.node_mut(id)?.flex_direction = direction;
        Ok(())
    }

    // ==================== Subtree I/O ====================

    /// Export a tray and its subtree in nested form.
    pub fn export_subtree(&self, id: &str) -> Result<TrayTree> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        let children = node
            .child_ids
            .iter()
            .map(|child| self.export_subtree(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(TrayTree {
            node: node.clone(),
            children,
        })
    }

    /// Build a graph from a root tree.
    ///
    /// Stored `parent_id` / `child_ids` are ignored in favor of the nesting.
    pub fn from_tree(tree: &TrayTree) -> Result<Self> {
        let mut graph = Self::new();
        check_unique_ids(tree)?;
        graph.insert_tree(tree, None);
        Ok(graph)
    }

    /// Replace a tray's content and whole subtree with `tree`.
    ///
    /// The tray keeps its id, its place under its parent, its server binding
    /// and its auto-sync flag; those fields of `tree`'s root are ignored.
    /// Fails without changes if any id below the root of `tree` is already
    /// used outside the current subtree.
    ///
    /// Returns the ids that were removed and are not part of the new subtree.
    pub fn replace_subtree(&mut self, id: &str, tree: &TrayTree) -> Result<Vec<String>> {
        let current = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        let parent_id = current.parent_id.clone();
        let host_url = current.host_url.clone();
        let file_name = current.file_name.clone();
        let auto_sync = current.auto_sync;

        check_unique_ids(tree)?;
        let old_descendants: HashSet<String> = self.descendants(id).into_iter().collect();
        let mut new_ids = HashSet::new();
        for child in &tree.children {
            let mut collision = None;
            child.walk(&mut |t| {
                let child_id = &t.node.id;
                if collision.is_none()
                    && (child_id == id
                        || (self.nodes.contains_key(child_id)
                            && !old_descendants.contains(child_id)))
                {
                    collision = Some(child_id.clone());
                }
                new_ids.insert(child_id.clone());
            });
            if let Some(collision) = collision {
                return Err(GraphError::IdCollision(collision));
            }
        }

        for old in &old_descendants {
            self.nodes.remove(old);
        }

        let mut node = tree.node.clone();
        node.id = id.to_string();
        node.parent_id = parent_id;
        node.host_url = host_url;
        node.file_name = file_name;
        node.auto_sync = auto_sync;
        node.child_ids = tree.children.iter().map(|c| c.node.id.clone()).collect();
        self.nodes.insert(id.to_string(), node);
        for child in &tree.children {
            self.insert_tree(child, Some(id));
        }

        let mut gone: Vec<String> = old_descendants
            .into_iter()
            .filter(|old| !new_ids.contains(old))
            .collect();
        gone.sort();
        Ok(gone)
    }

    /// Insert a pre-checked tree without further validation.
    fn insert_tree(&mut self, tree: &TrayTree, parent_id: Option<&str>) {
        let mut node = tree.node.clone();
        node.parent_id = parent_id.map(str::to_string);
        node.child_ids = tree.children.iter().map(|c| c.node.id.clone()).collect();
        if parent_id.is_none() {
            self.root_id = Some(node.id.clone());
        }
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        for child in &tree.children {
            self.insert_tree(child, Some(&id));
        }
    }

    fn post_order(&self, id: &str) -> Vec<String> {
        let mut result = Vec::new();
        if let Some(node) = self.nodes.get(id) {
            for child in &node.child_ids {
                result.extend(self.post_order(child));
            }
            result.push(id.to_string());
        }
        result
    }
}

fn check_unique_ids(tree: &TrayTree) -> Result<()> {
    let mut seen = HashSet::new();
    let mut duplicate = None;
    tree.walk(&mut |t| {
        if t.node.id.is_empty() && duplicate.is_none() {
            duplicate = Some(GraphError::InvalidNode("empty id".into()));
        } else if !seen.insert(t.node.id.as_str()) && duplicate.is_none() {
            duplicate = Some(GraphError::DuplicateId(t.node.id.clone()));
        }
    });
    match duplicate {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tray(id: &str) -> TrayNode {
        TrayNode::new(id, format!("Tray {}", id), 1_000)
    }

    /// root
    /// ├── a
    /// │   ├── a1
    /// │   └── a2
    /// └── b
    fn sample() -> TreeGraph {
        let mut graph = TreeGraph::with_root(tray("root")).unwrap();
        graph.add_node(tray("a"), Some("root")).unwrap();
        graph.add_node(tray("a1"), Some("a")).unwrap();
        graph.add_node(tray("a2"), Some("a")).unwrap();
        graph.add_node(tray("b"), Some("root")).unwrap();
        graph
    }

    /// Small deterministic generator so the invariant test is reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn pick<'a>(&mut self, items: &'a [String]) -> &'a String {
            &items[(self.next() % items.len() as u64) as usize]
        }
    }

    #[test]
    fn test_add_appends_in_order() {
        let graph = sample();
        assert_eq!(graph.children("root"), vec!["a", "b"]);
        assert_eq!(graph.children("a"), vec!["a1", "a2"]);
        assert_eq!(graph.parent("a1"), Some("a"));
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_add_unknown_parent_fails() {
        let mut graph = sample();
        let err = graph.add_node(tray("x"), Some("missing")).unwrap_err();
        assert_eq!(err, GraphError::NotFound("missing".into()));
        assert!(!graph.contains("x"));
    }

    #[test]
    fn test_add_duplicate_and_second_root_fail() {
        let mut graph = sample();
        assert_eq!(
            graph.add_node(tray("a"), Some("b")).unwrap_err(),
            GraphError::DuplicateId("a".into())
        );
        assert_eq!(
            graph.add_node(tray("other"), None).unwrap_err(),
            GraphError::RootExists("root".into())
        );
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_add_node_with_children_rejected() {
        let mut graph = sample();
        let mut node = tray("x");
        node.child_ids.push("ghost".into());
        assert!(matches!(
            graph.add_node(node, Some("root")),
            Err(GraphError::InvalidNode(_))
        ));
    }

    #[test]
    fn test_remove_returns_post_order() {
        let mut graph = sample();
        let removed = graph.remove_node("a").unwrap();
        assert_eq!(removed, vec!["a1", "a2", "a"]);
        assert_eq!(graph.children("root"), vec!["b"]);
        assert_eq!(graph.len(), 2);
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_remove_root_empties_graph() {
        let mut graph = sample();
        let removed = graph.remove_node("root").unwrap();
        assert_eq!(removed.len(), 5);
        assert!(graph.is_empty());
        assert!(graph.root_id().is_none());
    }

    #[test]
    fn test_move_reattaches() {
        let mut graph = sample();
        assert!(graph.move_node("a2", Some("b")));
        assert_eq!(graph.children("a"), vec!["a1"]);
        assert_eq!(graph.children("b"), vec!["a2"]);
        assert_eq!(graph.parent("a2"), Some("b"));
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_move_at_position_reorders() {
        let mut graph = sample();
        assert!(graph.move_node_at("a2", Some("a"), Some(0)));
        assert_eq!(graph.children("a"), vec!["a2", "a1"]);

        assert!(graph.move_node_at("b", Some("a"), Some(99)));
        assert_eq!(graph.children("a"), vec!["a2", "a1", "b"]);
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_move_into_descendant_rejected() {
        let mut graph = sample();
        let before = graph.export_subtree("root").unwrap();

        assert!(!graph.move_node("a", Some("a1")));
        assert!(!graph.move_node("a", Some("a")));
        assert!(!graph.move_node("root", Some("b")));
        assert!(!graph.move_node("a", Some("missing")));
        assert!(!graph.move_node("missing", Some("a")));
        assert!(!graph.move_node("a", None));

        assert_eq!(graph.export_subtree("root").unwrap(), before);
    }

    #[test]
    fn test_queries() {
        let graph = sample();
        assert_eq!(graph.ancestors("a1"), vec!["a", "root"]);
        assert_eq!(graph.descendants("root"), vec!["a", "a1", "a2", "b"]);
        assert_eq!(graph.siblings("a1"), vec!["a2"]);
        assert!(graph.siblings("root").is_empty());
        assert!(graph.is_descendant("a2", "root"));
        assert!(!graph.is_descendant("b", "a"));
        assert_eq!(graph.subtree_size("a"), 2);
    }

    #[test]
    fn test_network_nodes_in_pre_order() {
        let mut graph = sample();
        graph.bind_network("b", "https://h", "b.json").unwrap();
        graph.bind_network("a1", "https://h", "a1.json").unwrap();
        // Only the host is set: not network-bound
        graph.nodes.get_mut("a2").unwrap().host_url = Some("https://h".into());

        assert_eq!(graph.network_nodes(), vec!["a1", "b"]);
    }

    #[test]
    fn test_validate_reports_broken_links() {
        let mut graph = sample();
        graph.nodes.get_mut("a1").unwrap().parent_id = Some("b".into());
        graph
            .nodes
            .get_mut("root")
            .unwrap()
            .child_ids
            .push("ghost".into());

        let issues = graph.validate();
        assert!(issues.contains(&GraphIssue::ChildNotBackLinked {
            parent: "a".into(),
            child: "a1".into()
        }));
        assert!(issues.contains(&GraphIssue::ParentNotForwardLinked {
            child: "a1".into(),
            parent: "b".into()
        }));
        assert!(issues.contains(&GraphIssue::MissingChild {
            parent: "root".into(),
            child: "ghost".into()
        }));
    }

    #[test]
    fn test_validate_reports_cycle_and_self_parent() {
        let mut graph = sample();
        graph.nodes.get_mut("a").unwrap().parent_id = Some("a1".into());
        graph.nodes.get_mut("b").unwrap().parent_id = Some("b".into());

        let issues = graph.validate();
        assert!(issues.contains(&GraphIssue::Cycle("a".into())));
        assert!(issues.contains(&GraphIssue::SelfParent("b".into())));
    }

    #[test]
    fn test_random_operations_keep_invariant() {
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        let mut graph = TreeGraph::with_root(tray("root")).unwrap();
        let mut next_id = 0;

        for _ in 0..2_000 {
            let ids: Vec<String> = graph.nodes.keys().cloned().collect();
            match rng.next() % 4 {
                0 | 1 => {
                    let parent = rng.pick(&ids).clone();
                    next_id += 1;
                    graph
                        .add_node(tray(&format!("n{}", next_id)), Some(&parent))
                        .unwrap();
                }
                2 => {
                    let id = rng.pick(&ids).clone();
                    if Some(id.as_str()) != graph.root_id() {
                        graph.remove_node(&id).unwrap();
                    }
                }
                _ => {
                    let id = rng.pick(&ids).clone();
                    let target = rng.pick(&ids).clone();
                    let forbidden = id == target || graph.is_descendant(&target, &id);
                    let before = graph.export_subtree("root").unwrap();
                    let moved = graph.move_node(&id, Some(&target));
                    if forbidden {
                        assert!(!moved);
                        assert_eq!(graph.export_subtree("root").unwrap(), before);
                    } else {
                        assert!(moved);
                    }
                }
            }
            assert_eq!(graph.validate(), Vec::<GraphIssue>::new());
        }
    }

    #[test]
    fn test_content_operations() {
        let mut graph = sample();
        graph.rename("a", "Renamed @tag").unwrap();
        graph.set_property("a", "priority", 2.0).unwrap();
        graph.set_folded("a", true).unwrap();
        graph.set_border_color("a", "#ff0000").unwrap();
        graph.set_flex_direction("a", FlexDirection::Row).unwrap();

        let node = graph.get("a").unwrap();
        assert_eq!(node.hooks(), vec!["tag"]);
        assert_eq!(node.properties.get("priority"), Some(&PropertyValue::Number(2.0)));
        assert!(node.is_folded);
        assert_eq!(node.flex_direction, FlexDirection::Row);

        assert_eq!(
            graph.remove_property("a", "priority").unwrap(),
            Some(PropertyValue::Number(2.0))
        );
        assert_eq!(
            graph.rename("missing", "x").unwrap_err(),
            GraphError::NotFound("missing".into())
        );
    }

    #[test]
    fn test_export_and_rebuild() {
        let graph = sample();
        let tree = graph.export_subtree("root").unwrap();
        assert_eq!(tree.descendant_count(), 4);

        let rebuilt = TreeGraph::from_tree(&tree).unwrap();
        assert!(rebuilt.validate().is_empty());
        assert_eq!(rebuilt.descendants("root"), graph.descendants("root"));
    }

    #[test]
    fn test_replace_subtree() {
        let mut graph = sample();

        let mut incoming = TrayTree::leaf(TrayNode::new("remote-id", "From server", 5));
        incoming.children.push(TrayTree::leaf(tray("a1")));
        incoming.children.push(TrayTree::leaf(tray("a3")));

        let gone = graph.replace_subtree("a", &incoming).unwrap();
        assert_eq!(gone, vec!["a2"]);

        let node = graph.get("a").unwrap();
        assert_eq!(node.name, "From server");
        assert_eq!(node.parent_id.as_deref(), Some("root"));
        assert_eq!(graph.children("a"), vec!["a1", "a3"]);
        assert!(!graph.contains("remote-id"));
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_replace_subtree_keeps_local_binding() {
        let mut graph = sample();
        graph.bind_network("a", "https://trays.example.com", "a.json").unwrap();
        graph.set_auto_sync("a", true).unwrap();

        let mut incoming = TrayTree::leaf(TrayNode::new("a", "Renamed elsewhere", 5));
        incoming.node.host_url = Some("https://other.example.com".into());
        incoming.node.auto_sync = false;
        graph.replace_subtree("a", &incoming).unwrap();

        let node = graph.get("a").unwrap();
        assert_eq!(node.name, "Renamed elsewhere");
        assert_eq!(node.host_url.as_deref(), Some("https://trays.example.com"));
        assert_eq!(node.file_name.as_deref(), Some("a.json"));
        assert!(node.auto_sync);
        assert_eq!(graph.network_nodes(), vec!["a"]);

        // An unbound copy does not unbind the tray either
        let unbound = TrayTree::leaf(TrayNode::new("a", "Unbound copy", 5));
        graph.replace_subtree("a", &unbound).unwrap();
        assert!(graph.get("a").unwrap().is_network_bound());
    }

    #[test]
    fn test_replace_subtree_rejects_collision() {
        let mut graph = sample();
        let before = graph.export_subtree("root").unwrap();

        let mut incoming = TrayTree::leaf(tray("a"));
        incoming.children.push(TrayTree::leaf(tray("b")));

        assert_eq!(
            graph.replace_subtree("a", &incoming).unwrap_err(),
            GraphError::IdCollision("b".into())
        );
        assert_eq!(graph.export_subtree("root").unwrap(), before);
    }
}

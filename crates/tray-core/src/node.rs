//! TrayNode: one entry in the tray hierarchy.
//!
//! Nodes refer to their relatives by id only. The graph (`crate::graph`)
//! owns every node in a single table and keeps `parent_id` / `child_ids`
//! consistent; this module only describes the data.
//!
//! Two things are derived from `name` rather than stored:
//! - `hooks`: every `@token` in the name, in order of first appearance
//! - `done`: whether the name carries a check mark (✓ or ✔)

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use uuid::Uuid;

/// Glyphs that mark a tray as done.
pub const DONE_MARKS: [char; 2] = ['\u{2713}', '\u{2714}'];

/// Border color given to freshly created trays.
pub const DEFAULT_BORDER_COLOR: &str = "#cccccc";

static HOOK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("hook pattern is valid"));

/// Layout direction of a tray's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlexDirection {
    #[default]
    Column,
    Row,
}

/// A value in a tray's open-schema property map.
///
/// Maps use `BTreeMap` so that serialization (and therefore hashing) never
/// depends on insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// A single tray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrayNode {
    /// Unique, immutable identifier
    pub id: String,
    /// Parent tray (None only for the root)
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Children in display order
    #[serde(default)]
    pub child_ids: Vec<String>,
    /// Display name; hooks and the done mark are parsed out of it
    pub name: String,
    #[serde(default = "default_border_color")]
    pub border_color: String,
    #[serde(default)]
    pub flex_direction: FlexDirection,
    #[serde(default)]
    pub is_folded: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Server this tray is bound to
    #[serde(default)]
    pub host_url: Option<String>,
    /// Remote file this tray is bound to
    #[serde(default)]
    pub file_name: Option<String>,
    /// Per-tray opt-in for background sync
    #[serde(default)]
    pub auto_sync: bool,
    /// Creation time in milliseconds since Unix epoch
    pub created_at: u64,
}

fn default_border_color() -> String {
    DEFAULT_BORDER_COLOR.to_string()
}

impl TrayNode {
    /// Create a detached tray with a caller-supplied id.
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            child_ids: Vec::new(),
            name: name.into(),
            border_color: default_border_color(),
            flex_direction: FlexDirection::default(),
            is_folded: false,
            properties: BTreeMap::new(),
            host_url: None,
            file_name: None,
            auto_sync: false,
            created_at,
        }
    }

    /// Create a detached tray with a generated UUID v4 id.
    pub fn with_generated_id(name: impl Into<String>, created_at: u64) -> Self {
        Self::new(Uuid::new_v4().to_string(), name, created_at)
    }

    /// Hooks parsed from the name, deduplicated, in order of first appearance.
    pub fn hooks(&self) -> Vec<String> {
        parse_hooks(&self.name)
    }

    /// Whether the name carries a check mark.
    pub fn is_done(&self) -> bool {
        self.name.contains(DONE_MARKS)
    }

    /// A tray is network-bound iff both host and file are set.
    pub fn is_network_bound(&self) -> bool {
        self.host_url.is_some() && self.file_name.is_some()
    }

    /// Host and file name, if network-bound.
    pub fn network_binding(&self) -> Option<(&str, &str)> {
        match (&self.host_url, &self.file_name) {
            (Some(host), Some(file)) => Some((host.as_str(), file.as_str())),
            _ => None,
        }
    }
}

/// Extract `@token` hooks from a name.
pub fn parse_hooks(name: &str) -> Vec<String> {
    let mut hooks: Vec<String> = Vec::new();
    for capture in HOOK_PATTERN.captures_iter(name) {
        let hook = capture[1].to_string();
        if !hooks.contains(&hook) {
            hooks.push(hook);
        }
    }
    hooks
}

/// A tray together with its whole subtree.
///
/// This nested form is what gets serialized, uploaded, downloaded and backed
/// up. `node.child_ids` mirrors the ids of `children`, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayTree {
    pub node: TrayNode,
    #[serde(default)]
    pub children: Vec<TrayTree>,
}

impl TrayTree {
    /// A tree with no children.
    pub fn leaf(node: TrayNode) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }

    /// Number of nodes below the root of this tree.
    pub fn descendant_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| 1 + child.descendant_count())
            .sum()
    }

    /// Visit every node in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TrayTree)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_parsed_from_name() {
        let node = TrayNode::new("a", "Plan trip @travel @family @travel", 0);
        assert_eq!(node.hooks(), vec!["travel", "family"]);
    }

    #[test]
    fn test_no_hooks() {
        let node = TrayNode::new("a", "email@ without token", 0);
        assert!(node.hooks().is_empty());
    }

    #[test]
    fn test_done_mark() {
        assert!(TrayNode::new("a", "✓ Buy milk", 0).is_done());
        assert!(TrayNode::new("a", "Buy milk ✔", 0).is_done());
        assert!(!TrayNode::new("a", "Buy milk", 0).is_done());
    }

    #[test]
    fn test_network_bound_requires_both_fields() {
        let mut node = TrayNode::new("a", "Inbox", 0);
        assert!(!node.is_network_bound());

        node.host_url = Some("https://example.com".into());
        assert!(!node.is_network_bound());

        node.file_name = Some("inbox.json".into());
        assert!(node.is_network_bound());
        assert_eq!(
            node.network_binding(),
            Some(("https://example.com", "inbox.json"))
        );
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TrayNode::with_generated_id("a", 0);
        let b = TrayNode::with_generated_id("b", 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_descendant_count() {
        let mut root = TrayTree::leaf(TrayNode::new("root", "Root", 0));
        let mut child = TrayTree::leaf(TrayNode::new("c1", "Child", 0));
        child
            .children
            .push(TrayTree::leaf(TrayNode::new("g1", "Grandchild", 0)));
        root.children.push(child);
        root.children
            .push(TrayTree::leaf(TrayNode::new("c2", "Child 2", 0)));

        assert_eq!(root.descendant_count(), 3);
    }

    #[test]
    fn test_property_value_json_shape() {
        let mut node = TrayNode::new("a", "Props", 0);
        node.properties.insert("count".into(), 3.0.into());
        node.properties.insert("label".into(), "x".into());
        node.properties.insert("flag".into(), true.into());

        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"properties\":{\"count\":3.0,\"flag\":true,\"label\":\"x\"}"));

        let parsed: TrayNode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
    }
}

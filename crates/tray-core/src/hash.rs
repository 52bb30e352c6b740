//! Change-detection hashes for trays.
//!
//! Two digests per tray, both rendered from canonical JSON:
//! - `content`: name, properties, hooks and done flag of the tray alone
//! - `structure`: its child ids and parent id
//!
//! The digest is a 32-bit rolling hash (`h = h * 31 + c`) printed in base 36.
//! It only detects drift. Backup checksums use SHA-256 (see `integrity`).

use crate::node::{PropertyValue, TrayNode};
use serde::Serialize;
use std::collections::BTreeMap;

/// The pair of digests compared against a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotHash {
    pub content: String,
    pub structure: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentFields<'a> {
    name: &'a str,
    properties: &'a BTreeMap<String, PropertyValue>,
    hooks: &'a [String],
    is_done: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StructureFields<'a> {
    child_ids: &'a [String],
    parent_id: Option<&'a str>,
}

/// Hash both halves of a tray.
pub fn snapshot_hash(node: &TrayNode) -> SnapshotHash {
    let hooks = node.hooks();
    SnapshotHash {
        content: content_hash_of(&node.name, &node.properties, &hooks, node.is_done()),
        structure: structure_hash_of(&node.child_ids, node.parent_id.as_deref()),
    }
}

/// Content digest from individual fields.
///
/// Baselines store these fields, so the digest can be recomputed from a
/// stored snapshot alone.
pub fn content_hash_of(
    name: &str,
    properties: &BTreeMap<String, PropertyValue>,
    hooks: &[String],
    is_done: bool,
) -> String {
    canonical_hash(&ContentFields {
        name,
        properties,
        hooks,
        is_done,
    })
}

/// Structure digest from individual fields.
pub fn structure_hash_of(child_ids: &[String], parent_id: Option<&str>) -> String {
    canonical_hash(&StructureFields {
        child_ids,
        parent_id,
    })
}

fn canonical_hash(value: &impl Serialize) -> String {
    // Serializing structs of strings, bools and BTreeMaps cannot fail; a
    // non-finite float would render as null, which is still deterministic.
    let json = serde_json::to_string(value).unwrap_or_default();
    rolling_hash(&json)
}

/// 32-bit rolling hash rendered in base 36.
pub fn rolling_hash(input: &str) -> String {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    to_base36(hash.unsigned_abs())
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> TrayNode {
        let mut node = TrayNode::new("n1", "Write report @work", 1_000);
        node.parent_id = Some("root".into());
        node.child_ids = vec!["c1".into(), "c2".into()];
        node.properties.insert("b".into(), "two".into());
        node.properties.insert("a".into(), 1.0.into());
        node
    }

    #[test]
    fn test_rolling_hash_known_values() {
        assert_eq!(rolling_hash(""), "0");
        // 'a' = 97 = 2*36 + 25
        assert_eq!(rolling_hash("a"), "2p");
        // "ab" = 97*31 + 98 = 3105
        assert_eq!(rolling_hash("ab"), to_base36(3105));
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(snapshot_hash(&node()), snapshot_hash(&node()));
    }

    #[test]
    fn test_property_insertion_order_does_not_matter() {
        let mut other = TrayNode::new("n1", "Write report @work", 1_000);
        other.parent_id = Some("root".into());
        other.child_ids = vec!["c1".into(), "c2".into()];
        other.properties.insert("a".into(), 1.0.into());
        other.properties.insert("b".into(), "two".into());

        assert_eq!(snapshot_hash(&other), snapshot_hash(&node()));
    }

    #[test]
    fn test_content_change_only_moves_content_hash() {
        let original = snapshot_hash(&node());

        let mut renamed = node();
        renamed.name = "Write report @work ✓".into();
        let changed = snapshot_hash(&renamed);
        assert_ne!(changed.content, original.content);
        assert_eq!(changed.structure, original.structure);

        let mut with_property = node();
        with_property.properties.insert("c".into(), true.into());
        let changed = snapshot_hash(&with_property);
        assert_ne!(changed.content, original.content);
        assert_eq!(changed.structure, original.structure);
    }

    #[test]
    fn test_structure_change_only_moves_structure_hash() {
        let original = snapshot_hash(&node());

        let mut reordered = node();
        reordered.child_ids.reverse();
        let changed = snapshot_hash(&reordered);
        assert_eq!(changed.content, original.content);
        assert_ne!(changed.structure, original.structure);

        let mut reparented = node();
        reparented.parent_id = Some("other".into());
        let changed = snapshot_hash(&reparented);
        assert_eq!(changed.content, original.content);
        assert_ne!(changed.structure, original.structure);
    }

    #[test]
    fn test_presentation_fields_are_not_hashed() {
        let original = snapshot_hash(&node());
        let mut folded = node();
        folded.is_folded = true;
        folded.border_color = "#000000".into();
        assert_eq!(snapshot_hash(&folded), original);
    }
}

//! Serializer boundary: TrayTree <-> text.
//!
//! The sync engine only ever moves serialized trees around (uploads,
//! downloads, backups). Round-trips must be lossless.

use crate::node::TrayTree;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("Failed to encode tray: {0}")]
    Encode(String),

    #[error("Failed to decode tray: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, SerializeError>;

pub trait TraySerializer: Send + Sync {
    fn serialize(&self, tree: &TrayTree) -> Result<String>;

    fn deserialize(&self, data: &str) -> Result<TrayTree>;
}

/// Pretty-printed JSON, the format stored on servers and in backups.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl TraySerializer for JsonSerializer {
    fn serialize(&self, tree: &TrayTree) -> Result<String> {
        serde_json::to_string_pretty(tree).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    fn deserialize(&self, data: &str) -> Result<TrayTree> {
        serde_json::from_str(data).map_err(|e| SerializeError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FlexDirection, TrayNode};

    #[test]
    fn test_round_trip_preserves_everything() {
        let mut root = TrayNode::new("root", "Projects @work", 1_700_000_000_000);
        root.flex_direction = FlexDirection::Row;
        root.is_folded = true;
        root.host_url = Some("https://trays.example.com".into());
        root.file_name = Some("projects.json".into());
        root.auto_sync = true;
        root.properties.insert("priority".into(), 2.0.into());
        root.child_ids = vec!["c1".into()];

        let mut child = TrayNode::new("c1", "✓ Draft", 1_700_000_000_001);
        child.parent_id = Some("root".into());

        let tree = TrayTree {
            node: root,
            children: vec![TrayTree::leaf(child)],
        };

        let serializer = JsonSerializer;
        let text = serializer.serialize(&tree).unwrap();
        assert_eq!(serializer.deserialize(&text).unwrap(), tree);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = JsonSerializer.deserialize("not json").unwrap_err();
        assert!(matches!(err, SerializeError::Decode(_)));
    }
}

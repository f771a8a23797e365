//! Node keys - the identity a node presents to the consumer.
//!
//! Stored alongside each node. One variant per key kind; construction from a
//! stored row is a single match producing the concrete variant.

use crate::{ClassId, InstanceId, NodeId};
use serde::{Deserialize, Serialize};

/// Key of one external-schema instance backing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub class_id: ClassId,
    pub instance_id: InstanceId,
}

impl InstanceKey {
    pub fn new(class_id: ClassId, instance_id: InstanceId) -> Self {
        Self {
            class_id,
            instance_id,
        }
    }
}

/// Build a path hash from a node's ancestor chain (self-inclusive).
///
/// The hash is the `/`-joined simple form of the ids, so an ancestor's hash
/// is a string prefix of every descendant's hash.
pub fn compute_path_hash(ancestors: &[NodeId]) -> String {
    let parts: Vec<String> = ancestors
        .iter()
        .map(|id| id.as_uuid().simple().to_string())
        .collect();
    parts.join("/")
}

/// Tagged node key, one variant per key kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKey {
    /// Key of a node backed by concrete schema instances.
    Instances {
        specification_id: String,
        path_hash: String,
        instance_keys: Vec<InstanceKey>,
    },
    /// Key of a node grouping instances by class.
    ClassGrouping {
        class_id: ClassId,
        is_polymorphic: bool,
        grouped_count: u64,
        grouped_instance_keys: Option<Vec<InstanceKey>>,
        path_hash: String,
    },
    /// Key of a node grouping instances by property value.
    PropertyGrouping {
        class_id: ClassId,
        property_name: String,
        grouped_values: serde_json::Value,
        grouped_count: u64,
        grouped_instance_keys: Option<Vec<InstanceKey>>,
        path_hash: String,
    },
    /// Key of a node grouping instances by display label.
    LabelGrouping {
        label: String,
        grouped_count: u64,
        grouped_instance_keys: Option<Vec<InstanceKey>>,
        path_hash: String,
    },
    /// Key of a consumer-defined node kind.
    Custom {
        kind: String,
        specification_id: String,
        path_hash: String,
    },
}

impl NodeKey {
    /// The key's ancestor path hash.
    pub fn path_hash(&self) -> &str {
        match self {
            NodeKey::Instances { path_hash, .. }
            | NodeKey::ClassGrouping { path_hash, .. }
            | NodeKey::PropertyGrouping { path_hash, .. }
            | NodeKey::LabelGrouping { path_hash, .. }
            | NodeKey::Custom { path_hash, .. } => path_hash,
        }
    }

    /// Discriminator name of this key kind.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeKey::Instances { .. } => "Instances",
            NodeKey::ClassGrouping { .. } => "ClassGrouping",
            NodeKey::PropertyGrouping { .. } => "PropertyGrouping",
            NodeKey::LabelGrouping { .. } => "LabelGrouping",
            NodeKey::Custom { .. } => "Custom",
        }
    }

    /// Whether this key groups other nodes rather than naming instances.
    pub fn is_grouping(&self) -> bool {
        matches!(
            self,
            NodeKey::ClassGrouping { .. }
                | NodeKey::PropertyGrouping { .. }
                | NodeKey::LabelGrouping { .. }
        )
    }

    /// Whether `self`'s path is an ancestor of (or equal to) `other`'s.
    pub fn is_ancestor_of(&self, other: &NodeKey) -> bool {
        other.path_hash().starts_with(self.path_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_hash_prefix_property() {
        let parent = NodeId::now_v7();
        let child = NodeId::now_v7();
        let parent_hash = compute_path_hash(&[parent]);
        let child_hash = compute_path_hash(&[parent, child]);
        assert!(child_hash.starts_with(&parent_hash));
        assert_ne!(parent_hash, child_hash);
    }

    #[test]
    fn test_key_serde_is_tagged() {
        let key = NodeKey::LabelGrouping {
            label: "Beams".to_string(),
            grouped_count: 3,
            grouped_instance_keys: Some(vec![InstanceKey::new(1, 10)]),
            path_hash: compute_path_hash(&[NodeId::now_v7()]),
        };
        let json = serde_json::to_value(&key).expect("key should serialize");
        assert_eq!(json["type"], "LabelGrouping");
        let back: NodeKey = serde_json::from_value(json).expect("key should deserialize");
        assert_eq!(back, key);
    }

    #[test]
    fn test_ancestor_check() {
        let root = NodeId::now_v7();
        let leaf = NodeId::now_v7();
        let root_key = NodeKey::Custom {
            kind: "root".to_string(),
            specification_id: "spec-1".to_string(),
            path_hash: compute_path_hash(&[root]),
        };
        let leaf_key = NodeKey::Custom {
            kind: "leaf".to_string(),
            specification_id: "spec-1".to_string(),
            path_hash: compute_path_hash(&[root, leaf]),
        };
        assert!(root_key.is_ancestor_of(&leaf_key));
        assert!(!leaf_key.is_ancestor_of(&root_key));
    }

    #[test]
    fn test_grouping_discrimination() {
        let key = NodeKey::Instances {
            specification_id: "spec-1".to_string(),
            path_hash: String::new(),
            instance_keys: vec![],
        };
        assert!(!key.is_grouping());
        assert_eq!(key.kind(), "Instances");
    }
}

//! Persisted per-table sync metadata.
//!
//! Stored next to each table under `<table>__m`. Uses ordered containers so
//! the serialized form is deterministic.

use crate::{error::Result, pending::PendingSave, Error, PendingTree, Watermark};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the metadata format for future compatibility.
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Suffix appended to a table name to address its metadata.
pub const METADATA_SUFFIX: &str = "__m";

/// Storage key for a table's metadata.
pub fn metadata_table(table: &str) -> String {
    format!("{table}{METADATA_SUFFIX}")
}

fn format_version() -> u32 {
    METADATA_FORMAT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    #[serde(default = "format_version")]
    pub format_version: u32,
    /// Newest server timestamp received for the table
    #[serde(default)]
    pub last_sync: Watermark,
    /// Local saves not yet confirmed by the remote, keyed by joined path
    #[serde(default)]
    pub pending: BTreeMap<String, PendingSave>,
}

impl Default for TableMetadata {
    fn default() -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            last_sync: Watermark::unset(),
            pending: BTreeMap::new(),
        }
    }
}

impl TableMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the persisted pending set with the contents of `tree`.
    pub fn set_pending(&mut self, tree: &PendingTree) {
        self.pending = tree
            .iter()
            .map(|save| (save.path.join("/"), save.clone()))
            .collect();
    }

    pub fn pending_tree(&self) -> PendingTree {
        self.pending.values().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::checked(serde_json::from_str(json)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Self::checked(serde_json::from_value(value)?)
    }

    fn checked(metadata: Self) -> Result<Self> {
        if metadata.format_version > METADATA_FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported metadata format version: {} (max supported: {})",
                metadata.format_version, METADATA_FORMAT_VERSION
            )));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PathType;
    use serde_json::json;

    #[test]
    fn metadata_key() {
        assert_eq!(metadata_table("todos"), "todos__m");
    }

    #[test]
    fn json_roundtrip_with_pending() {
        let mut tree = PendingTree::new();
        tree.insert(PendingSave::new(
            vec!["todos".into(), "1".into()],
            vec![PathType::Object, PathType::Object],
            json!({"text": "hi"}),
            1000,
        ));
        let mut metadata = TableMetadata::new();
        metadata.last_sync.merge(1234);
        metadata.set_pending(&tree);

        let json = metadata.to_json().unwrap();
        assert!(json.contains("\"lastSync\":1234"));
        assert!(json.contains("\"todos/1\""));

        let restored = TableMetadata::from_json(&json).unwrap();
        assert_eq!(restored, metadata);
        assert_eq!(restored.pending_tree(), tree);
    }

    #[test]
    fn missing_fields_default() {
        let metadata = TableMetadata::from_value(json!({})).unwrap();
        assert_eq!(metadata, TableMetadata::default());
        assert_eq!(TableMetadata::from_value(json!(null)).unwrap(), TableMetadata::default());
    }

    #[test]
    fn deterministic_serialization() {
        let mut first = PendingTree::new();
        let mut second = PendingTree::new();
        let a = PendingSave::new(vec!["a".into()], vec![PathType::Object], json!(1), 1);
        let b = PendingSave::new(vec!["b".into()], vec![PathType::Object], json!(2), 1);
        first.insert(a.clone());
        first.insert(b.clone());
        second.insert(b);
        second.insert(a);

        let mut m1 = TableMetadata::new();
        m1.set_pending(&first);
        let mut m2 = TableMetadata::new();
        m2.set_pending(&second);
        assert_eq!(m1.to_json().unwrap(), m2.to_json().unwrap());
    }

    #[test]
    fn reject_future_format_version() {
        let result = TableMetadata::from_json(r#"{"formatVersion": 999}"#);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}

//! In-memory local adapter.

use crate::{
    adapter::{apply_changes, LocalAdapter},
    error::Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tether_engine::{Change, TableMetadata};

/// Local adapter keeping tables in memory.
///
/// Nothing survives the process, but the adapter can be shared between
/// sessions to simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryLocalAdapter {
    tables: DashMap<String, Value>,
    metadata: DashMap<String, TableMetadata>,
}

impl MemoryLocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table.
    pub fn with_table(self, table: impl Into<String>, value: Value) -> Self {
        self.tables.insert(table.into(), value);
        self
    }

    /// Seed a table's metadata.
    pub fn with_metadata(self, table: impl Into<String>, metadata: TableMetadata) -> Self {
        self.metadata.insert(table.into(), metadata);
        self
    }

    /// Replace a table outright.
    pub fn put_table(&self, table: impl Into<String>, value: Value) {
        self.tables.insert(table.into(), value);
    }

    pub fn put_metadata(&self, table: impl Into<String>, metadata: TableMetadata) {
        self.metadata.insert(table.into(), metadata);
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub(crate) fn apply(&self, table: &str, changes: &[Change]) -> Value {
        let mut entry = self.tables.entry(table.to_string()).or_insert(Value::Null);
        apply_changes(entry.value_mut(), changes);
        entry.value().clone()
    }

    pub(crate) fn remove_table(&self, table: &str) {
        self.tables.remove(table);
    }

    pub(crate) fn remove_metadata(&self, table: &str) {
        self.metadata.remove(table);
    }
}

#[async_trait]
impl LocalAdapter for MemoryLocalAdapter {
    fn get_table(&self, table: &str) -> Option<Value> {
        self.tables.get(table).map(|entry| entry.value().clone())
    }

    fn get_metadata(&self, table: &str) -> TableMetadata {
        self.metadata
            .get(table)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    async fn set(&self, table: &str, changes: &[Change]) -> Result<()> {
        self.apply(table, changes);
        Ok(())
    }

    async fn set_metadata(&self, table: &str, metadata: &TableMetadata) -> Result<()> {
        self.put_metadata(table, metadata.clone());
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        self.remove_table(table);
        Ok(())
    }

    async fn delete_metadata(&self, table: &str) -> Result<()> {
        self.remove_metadata(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_engine::{ChangeMode, Origin, PathType, Watermark};

    fn change(path: &[&str], value: Value) -> Change {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let types = vec![PathType::Object; path.len()];
        Change::at(path, types, value, ChangeMode::Set, Origin::Local)
    }

    #[tokio::test]
    async fn set_creates_and_updates_tables() {
        let adapter = MemoryLocalAdapter::new();
        assert_eq!(adapter.get_table("todos"), None);

        adapter
            .set("todos", &[change(&["t1"], json!({"text": "a"}))])
            .await
            .unwrap();
        adapter
            .set("todos", &[change(&["t1", "done"], json!(true))])
            .await
            .unwrap();

        assert_eq!(
            adapter.get_table("todos"),
            Some(json!({"t1": {"text": "a", "done": true}}))
        );
        assert_eq!(adapter.table_names(), vec!["todos"]);
    }

    #[tokio::test]
    async fn root_change_replaces_table() {
        let adapter = MemoryLocalAdapter::new().with_table("settings", json!({"theme": "dark"}));
        adapter.set("settings", &[change(&[], json!({"lang": "en"}))]).await.unwrap();
        assert_eq!(adapter.get_table("settings"), Some(json!({"lang": "en"})));
    }

    #[tokio::test]
    async fn metadata_roundtrip_and_delete() {
        let adapter = MemoryLocalAdapter::new();
        assert_eq!(adapter.get_metadata("todos"), TableMetadata::default());

        let mut metadata = TableMetadata::new();
        metadata.last_sync = Watermark::at(42);
        adapter.set_metadata("todos", &metadata).await.unwrap();
        assert_eq!(adapter.get_metadata("todos").last_sync, Watermark::at(42));

        adapter.delete_metadata("todos").await.unwrap();
        adapter.delete_table("todos").await.unwrap();
        assert_eq!(adapter.get_metadata("todos"), TableMetadata::default());
        assert_eq!(adapter.get_table("todos"), None);
    }

    #[test]
    fn seeded_metadata_is_visible() {
        let mut metadata = TableMetadata::new();
        metadata.last_sync = Watermark::at(7);
        let adapter = MemoryLocalAdapter::new().with_metadata("todos", metadata.clone());
        assert_eq!(adapter.get_metadata("todos"), metadata);
        assert!(adapter.table_names().is_empty());
    }
}

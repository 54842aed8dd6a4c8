//! JSON file local adapter.
//!
//! Each table lives in `<dir>/<table>.json`, its metadata in
//! `<dir>/<table>__m.json`. Tables are cached in memory after
//! [`LocalAdapter::load_table`] and rewritten whole on every change.

use crate::{
    adapter::LocalAdapter,
    error::{Result, SyncError},
    memory::MemoryLocalAdapter,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tether_engine::{metadata_table, Change, TableMetadata};
use tokio::sync::Mutex;

/// Local adapter writing one JSON file per table.
#[derive(Debug)]
pub struct JsonFileAdapter {
    dir: PathBuf,
    cache: MemoryLocalAdapter,
    // Held from the cache update through the file write, so files land in
    // the same order as the cache changes.
    write_lock: Mutex<()>,
}

impl JsonFileAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: MemoryLocalAdapter::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    async fn read_json(&self, name: &str) -> Result<Option<Value>> {
        match tokio::fs::read(self.file_for(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // Callers hold `write_lock`.
    async fn write_json(&self, name: &str, value: &Value) -> Result<()> {
        let path = self.file_for(name);
        let tmp = self.dir.join(format!("{name}.json.tmp"));
        let bytes = serde_json::to_vec(value)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_file(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.file_for(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl LocalAdapter for JsonFileAdapter {
    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tracing::debug!(dir = %self.dir.display(), "file adapter initialized");
        Ok(())
    }

    async fn load_table(&self, table: &str) -> Result<()> {
        let value = self
            .read_json(table)
            .await
            .map_err(|err| SyncError::local_load(table, err))?;
        if let Some(value) = value {
            self.cache.put_table(table, value);
        }

        let metadata = self
            .read_json(&metadata_table(table))
            .await
            .map_err(|err| SyncError::local_load(table, err))?;
        if let Some(metadata) = metadata {
            self.cache
                .put_metadata(table, TableMetadata::from_value(metadata)?);
        }
        Ok(())
    }

    fn get_table(&self, table: &str) -> Option<Value> {
        self.cache.get_table(table)
    }

    fn get_metadata(&self, table: &str) -> TableMetadata {
        self.cache.get_metadata(table)
    }

    async fn set(&self, table: &str, changes: &[Change]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.cache.apply(table, changes);
        self.write_json(table, &snapshot)
            .await
            .map_err(|err| SyncError::local_save(table, err))
    }

    async fn set_metadata(&self, table: &str, metadata: &TableMetadata) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.cache.put_metadata(table, metadata.clone());
        self.write_json(&metadata_table(table), &metadata.to_value()?)
            .await
            .map_err(|err| SyncError::local_save(table, err))
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.cache.remove_table(table);
        self.remove_file(table).await
    }

    async fn delete_metadata(&self, table: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.cache.remove_metadata(table);
        self.remove_file(&metadata_table(table)).await
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
    async fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let adapter = JsonFileAdapter::new(dir.path());
        adapter.initialize().await.unwrap();
        adapter.load_table("todos").await.unwrap();
        assert_eq!(adapter.get_table("todos"), None);

        adapter
            .set("todos", &[change(&["t1"], json!({"text": "a"}))])
            .await
            .unwrap();
        let mut metadata = TableMetadata::new();
        metadata.last_sync = Watermark::at(7);
        adapter.set_metadata("todos", &metadata).await.unwrap();

        assert!(dir.path().join("todos.json").exists());
        assert!(dir.path().join("todos__m.json").exists());

        let reopened = JsonFileAdapter::new(dir.path());
        reopened.load_table("todos").await.unwrap();
        assert_eq!(reopened.get_table("todos"), Some(json!({"t1": {"text": "a"}})));
        assert_eq!(reopened.get_metadata("todos").last_sync, Watermark::at(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sets_leave_the_latest_table_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = std::sync::Arc::new(JsonFileAdapter::new(dir.path()));
        adapter.initialize().await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let adapter = std::sync::Arc::clone(&adapter);
                tokio::spawn(async move {
                    let key = format!("t{i}");
                    adapter
                        .set("todos", &[change(&[key.as_str()], json!({"n": i}))])
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let cached = adapter.get_table("todos").unwrap();
        assert_eq!(cached.as_object().unwrap().len(), 16);
        let bytes = std::fs::read(dir.path().join("todos.json")).unwrap();
        let on_disk: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk, cached);
    }

    #[tokio::test]
    async fn delete_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = JsonFileAdapter::new(dir.path());
        adapter.initialize().await.unwrap();
        adapter.set("notes", &[change(&[], json!({"a": 1}))]).await.unwrap();
        adapter.set_metadata("notes", &TableMetadata::new()).await.unwrap();

        adapter.delete_table("notes").await.unwrap();
        adapter.delete_metadata("notes").await.unwrap();
        // Deleting twice is fine.
        adapter.delete_table("notes").await.unwrap();

        assert!(!dir.path().join("notes.json").exists());
        assert!(!dir.path().join("notes__m.json").exists());
        assert_eq!(adapter.get_table("notes"), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let adapter = JsonFileAdapter::new(dir.path());
        let err = adapter.load_table("broken").await.unwrap_err();
        assert!(matches!(err, SyncError::LocalLoad { .. }));
    }
}

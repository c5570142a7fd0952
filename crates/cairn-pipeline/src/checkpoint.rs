//! Checkpoint save/restore and crash recovery for pipeline runs.
//!
//! After each step completes the scheduler persists a [`CheckpointRecord`] for
//! the level it is running. Every nesting level is checkpointed under its own
//! run id (see [`nested_run_id`]), so resuming after a crash re-enters only the
//! innermost incomplete level. A level that completes deletes its own record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use cairn_types::{CairnError, Result};

use crate::context::ContextSnapshot;
use crate::ledger::Budgets;

/// Persisted state of one pipeline level after its last completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: Uuid,
    /// `None` for the root level of a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub pipeline_name: String,
    pub nesting_depth: usize,
    /// Index of the last step whose outcome is recorded in `snapshot`.
    pub last_completed_step_index: usize,
    pub snapshot: ContextSnapshot,
    /// Budgets the run was started with. Present on root records only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets: Option<Budgets>,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

impl CheckpointRecord {
    pub fn is_root(&self) -> bool {
        self.parent_run_id.is_none()
    }
}

/// Deterministic run id for the level started by the step at `position` of
/// the parent level. Fan-out branches use `"<index>/<branch>"`.
pub fn nested_run_id(parent: Uuid, position: &str) -> Uuid {
    Uuid::new_v5(&parent, position.as_bytes())
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `record`, replacing any previous record for its run id.
    async fn save(&self, record: &CheckpointRecord) -> Result<()>;

    async fn load(&self, run_id: Uuid) -> Result<Option<CheckpointRecord>>;

    /// Remove a record. Deleting a missing record is not an error.
    async fn delete(&self, run_id: Uuid) -> Result<()>;

    /// All stored records, root and nested.
    async fn list(&self) -> Result<Vec<CheckpointRecord>>;
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// Stores each record as `<dir>/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

fn io_error(run_id: Uuid, err: impl std::fmt::Display) -> CairnError {
    CairnError::CheckpointIo {
        run_id: run_id.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        let run_id = record.run_id;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(run_id, e))?;
        let path = self.path_for(run_id);
        let tmp = self.dir.join(format!(".{run_id}.json.tmp"));
        let json = serde_json::to_vec_pretty(record).map_err(|e| io_error(run_id, e))?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error(run_id, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(run_id, e))?;
        tracing::debug!(path = %path.display(), step_index = record.last_completed_step_index, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<CheckpointRecord>> {
        let path = self.path_for(run_id);
        let json = match tokio::fs::read(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(run_id, e)),
        };
        let record = serde_json::from_slice(&json).map_err(|e| io_error(run_id, e))?;
        Ok(Some(record))
    }

    async fn delete(&self, run_id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => {
                tracing::debug!(run_id = %run_id, "Checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(run_id, e)),
        }
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(run_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|_| path.extension().is_some_and(|ext| ext == "json"))
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match self.load(run_id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        records.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// InMemoryCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<Uuid, CheckpointRecord>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.run_id, record.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<CheckpointRecord>> {
        Ok(self.records.read().await.get(&run_id).cloned())
    }

    async fn delete(&self, run_id: Uuid) -> Result<()> {
        self.records.write().await.remove(&run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::Outcome;

    fn sample_record(run_id: Uuid) -> CheckpointRecord {
        let mut snapshot = ContextSnapshot::default();
        snapshot.results.insert("fetch".into(), Outcome::success("done"));
        snapshot.results.insert("notify".into(), Outcome::skipped("condition false"));
        snapshot
            .variables
            .insert("env".into(), serde_json::json!("prod"));

        CheckpointRecord {
            run_id,
            parent_run_id: None,
            pipeline_name: "main".into(),
            nesting_depth: 0,
            last_completed_step_index: 1,
            snapshot,
            budgets: Some(Budgets::default().with_max_steps(10)),
            saved_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let record = sample_record(Uuid::new_v4());

        store.save(&record).await.unwrap();
        assert!(dir
            .path()
            .join("checkpoints")
            .join(format!("{}.json", record.run_id))
            .exists());

        let loaded = store.load(record.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        let keys: Vec<_> = loaded.snapshot.results.keys().cloned().collect();
        assert_eq!(keys, vec!["fetch", "notify"]);
    }

    #[tokio::test]
    async fn file_store_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut record = sample_record(Uuid::new_v4());
        store.save(&record).await.unwrap();
        record.last_completed_step_index = 5;
        store.save(&record).await.unwrap();

        let loaded = store.load(record.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.last_completed_step_index, 5);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.json", record.run_id)]);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_record_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let record = sample_record(Uuid::new_v4());
        store.save(&record).await.unwrap();

        store.delete(record.run_id).await.unwrap();
        assert!(store.load(record.run_id).await.unwrap().is_none());
        store.delete(record.run_id).await.unwrap();
    }

    #[tokio::test]
    async fn list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let a = sample_record(Uuid::new_v4());
        let b = sample_record(Uuid::new_v4());
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), "{garbage").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn list_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_checkpoint_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let run_id = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{run_id}.json")), "not json").unwrap();
        let err = store.load(run_id).await.unwrap_err();
        assert!(matches!(err, CairnError::CheckpointIo { .. }));
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemoryCheckpointStore::new();
        let record = sample_record(Uuid::new_v4());
        store.save(&record).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.load(record.run_id).await.unwrap(), Some(record.clone()));
        store.delete(record.run_id).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[test]
    fn nested_run_ids_are_deterministic_and_distinct() {
        let parent = Uuid::new_v4();
        assert_eq!(nested_run_id(parent, "2"), nested_run_id(parent, "2"));
        assert_ne!(nested_run_id(parent, "2"), nested_run_id(parent, "3"));
        assert_ne!(nested_run_id(parent, "2/a"), nested_run_id(parent, "2/b"));
        assert_ne!(nested_run_id(parent, "2"), nested_run_id(Uuid::new_v4(), "2"));
    }

    #[test]
    fn root_record_has_no_parent() {
        let record = sample_record(Uuid::new_v4());
        assert!(record.is_root());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("parent_run_id").is_none());
    }
}

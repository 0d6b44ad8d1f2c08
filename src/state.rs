//! Durable per-VM and per-batch state.
//!
//! Everything lives as JSON under `{work_dir}/batch-state/`. The batch file
//! is authoritative; per-VM mirror files are written for readability only.
//! Every write is crash-safe: serialize to a sibling temp file, fsync, then
//! atomically rename over the target. All in-process mutation is serialized
//! through the store's mutex.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::artifacts::Artifacts;
use crate::error::{Result, StageErrorKind, VmshiftError};
use crate::plan::{hex_string, ConcurrencyCaps, PauseAfter, PlannedVm, PostAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmMigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// The last failure recorded for a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub stage: String,
    pub kind: StageErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Mutable per-VM migration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Stable across resumes: short hash of batch id and VM uuid.
    pub migration_id: String,
    pub batch_id: String,
    pub vm_name: String,
    pub vm_uuid: String,
    pub status: VmMigrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Wall-clock seconds per completed stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_secs: BTreeMap<String, f64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub attempts: u32,
}

impl MigrationState {
    pub fn new(batch_id: &str, vm_name: &str, vm_uuid: &str) -> Self {
        let now = Utc::now();
        Self {
            migration_id: migration_id(batch_id, vm_uuid),
            batch_id: batch_id.to_string(),
            vm_name: vm_name.to_string(),
            vm_uuid: vm_uuid.to_string(),
            status: VmMigrationStatus::Pending,
            current_stage: None,
            completed_stages: Vec::new(),
            artifacts: Artifacts::default(),
            stage_secs: BTreeMap::new(),
            started_at: now,
            updated_at: now,
            finished_at: None,
            last_error: None,
            attempts: 0,
        }
    }

    pub fn is_stage_complete(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }
}

/// Derive the stable per-VM identifier from batch id and VM uuid.
pub fn migration_id(batch_id: &str, vm_uuid: &str) -> String {
    let digest = Sha256::digest(format!("{batch_id}:{vm_uuid}").as_bytes());
    hex_string(&digest)[..12].to_string()
}

/// Generate a fresh short batch id.
pub fn new_batch_id() -> String {
    use rand::Rng;
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveState {
    pub name: String,
    pub pause_after: PauseAfter,
    pub status: WaveStatus,
    /// Migration ids in scheduling order.
    pub migration_ids: Vec<String>,
}

/// Persistent state for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    /// Digest of the plan this batch was expanded from.
    pub plan_digest: String,
    pub waves: Vec<WaveState>,
    /// Keyed by migration id.
    pub vm_states: BTreeMap<String, MigrationState>,
    /// Frozen expansion: the batch never re-queries vCenter for identity.
    pub planned: Vec<PlannedVm>,
    /// Caps the batch was started with; reused verbatim on resume.
    #[serde(default)]
    pub concurrency: ConcurrencyCaps,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_migration: Vec<PostAction>,
}

impl BatchState {
    pub fn vm_state(&self, migration_id: &str) -> Option<&MigrationState> {
        self.vm_states.get(migration_id)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        let mut pending = 0;
        for s in self.vm_states.values() {
            match s.status {
                VmMigrationStatus::Completed => completed += 1,
                VmMigrationStatus::Failed => failed += 1,
                _ => pending += 1,
            }
        }
        (completed, failed, pending)
    }
}

/// Store for batch state files.
pub struct StateStore {
    dir: PathBuf,
    // Serializes every read-modify-write of the batch files.
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn batch_path(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("batch-{batch_id}.json"))
    }

    fn vm_mirror_path(&self, migration_id: &str) -> PathBuf {
        self.dir.join(format!("vm-{migration_id}.json"))
    }

    pub async fn save(&self, state: &BatchState) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save_locked(state).await
    }

    async fn save_locked(&self, state: &BatchState) -> Result<()> {
        let path = self.batch_path(&state.batch_id);
        let bytes = serde_json::to_vec_pretty(state)?;
        atomic_write(&path, bytes).await?;
        debug!(batch_id = %state.batch_id, "persisted batch state");
        Ok(())
    }

    pub async fn load(&self, batch_id: &str) -> Result<BatchState> {
        let path = self.batch_path(batch_id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| VmshiftError::BatchNotFound(batch_id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Batch ids present in the state directory, oldest first.
    pub async fn list_batches(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(_) => return Ok(Vec::new()),
        };
        let mut found: Vec<(DateTime<Utc>, String)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name
                .strip_prefix("batch-")
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            match self.load(id).await {
                Ok(state) => found.push((state.created_at, id.to_string())),
                Err(e) => warn!("skipping unreadable batch file {name}: {e}"),
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }

    pub async fn latest_batch(&self) -> Result<Option<BatchState>> {
        let ids = self.list_batches().await?;
        match ids.last() {
            Some(id) => Ok(Some(self.load(id).await?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write one VM's state under the store mutex. Returns the
    /// updated migration state.
    pub async fn update_vm<F>(
        &self,
        batch_id: &str,
        migration_id: &str,
        patch: F,
    ) -> Result<MigrationState>
    where
        F: FnOnce(&mut MigrationState),
    {
        let _guard = self.lock.lock().await;
        let mut batch = self.load(batch_id).await?;
        let vm = batch.vm_states.get_mut(migration_id).ok_or_else(|| {
            VmshiftError::Validation(format!(
                "migration '{migration_id}' not in batch '{batch_id}'"
            ))
        })?;
        patch(vm);
        vm.updated_at = Utc::now();
        let snapshot = vm.clone();
        self.save_locked(&batch).await?;

        // Best-effort readable mirror; the batch file is authoritative.
        if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
            if let Err(e) = atomic_write(&self.vm_mirror_path(migration_id), bytes).await {
                warn!(%migration_id, "failed to write vm mirror file: {e}");
            }
        }
        Ok(snapshot)
    }

    /// Update a wave's status in place.
    pub async fn update_wave(
        &self,
        batch_id: &str,
        wave_name: &str,
        status: WaveStatus,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut batch = self.load(batch_id).await?;
        let wave = batch
            .waves
            .iter_mut()
            .find(|w| w.name == wave_name)
            .ok_or_else(|| {
                VmshiftError::Validation(format!("wave '{wave_name}' not in batch '{batch_id}'"))
            })?;
        wave.status = status;
        self.save_locked(&batch).await
    }
}

/// Write-temp, fsync, rename. Readers never observe a torn file.
async fn atomic_write(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    })
    .await
    .map_err(|e| VmshiftError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_batch(batch_id: &str) -> BatchState {
        let mut vm_states = BTreeMap::new();
        let vm = MigrationState::new(batch_id, "web-01", "uuid-web-01");
        let mid = vm.migration_id.clone();
        vm_states.insert(mid.clone(), vm);
        BatchState {
            batch_id: batch_id.to_string(),
            created_at: Utc::now(),
            plan_digest: "d".repeat(64),
            waves: vec![WaveState {
                name: "default".into(),
                pause_after: PauseAfter::Continue,
                status: WaveStatus::Pending,
                migration_ids: vec![mid],
            }],
            vm_states,
            planned: Vec::new(),
            concurrency: ConcurrencyCaps::default(),
            post_migration: Vec::new(),
        }
    }

    #[test]
    fn migration_id_is_stable_and_short() {
        let a = migration_id("abc123", "uuid-1");
        let b = migration_id("abc123", "uuid-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, migration_id("abc124", "uuid-1"));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let batch = sample_batch("b1");
        store.save(&batch).await.unwrap();
        let loaded = store.load("b1").await.unwrap();
        assert_eq!(loaded.batch_id, "b1");
        assert_eq!(loaded.vm_states.len(), 1);
    }

    #[tokio::test]
    async fn update_vm_persists_through_crash_boundary() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let batch = sample_batch("b2");
        let mid = batch.waves[0].migration_ids[0].clone();
        store.save(&batch).await.unwrap();

        store
            .update_vm("b2", &mid, |vm| {
                vm.completed_stages.push("validate".into());
                vm.status = VmMigrationStatus::Running;
            })
            .await
            .unwrap();

        // A fresh store simulates a process restart.
        let store2 = StateStore::new(dir.path());
        let loaded = store2.load("b2").await.unwrap();
        assert_eq!(loaded.vm_states[&mid].completed_stages, vec!["validate"]);
        assert_eq!(loaded.vm_states[&mid].status, VmMigrationStatus::Running);
    }

    #[tokio::test]
    async fn readers_tolerate_leftover_tmp_file() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let batch = sample_batch("b3");
        store.save(&batch).await.unwrap();
        // Simulate a crash that left a temp file behind.
        std::fs::write(dir.path().join("batch-b3.json.tmp"), b"garbage").unwrap();
        let loaded = store.load("b3").await.unwrap();
        assert_eq!(loaded.batch_id, "b3");
        let ids = store.list_batches().await.unwrap();
        assert_eq!(ids, vec!["b3"]);
    }

    #[tokio::test]
    async fn list_and_latest_order_by_creation() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let mut older = sample_batch("old1");
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        store.save(&older).await.unwrap();
        store.save(&sample_batch("new1")).await.unwrap();

        assert_eq!(store.list_batches().await.unwrap(), vec!["old1", "new1"]);
        let latest = store.latest_batch().await.unwrap().unwrap();
        assert_eq!(latest.batch_id, "new1");
    }

    #[tokio::test]
    async fn load_missing_batch_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, VmshiftError::BatchNotFound(_)));
    }
}

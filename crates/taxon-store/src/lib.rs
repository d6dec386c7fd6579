//! Project state persistence: the current (registry, units) snapshot per
//! project under compare-and-swap, plus content-addressed snapshot blobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use taxon_protocol::{
    ProjectId, ProjectSnapshot, ProjectStorePort, SnapshotRef, TaxonError, TaxonResult,
};
use tokio::fs;
use tracing::{debug, instrument, warn};

fn into_taxon(error: anyhow::Error) -> TaxonError {
    match error.downcast::<TaxonError>() {
        Ok(typed) => typed,
        Err(other) => TaxonError::Storage(format!("{other:#}")),
    }
}

/// Version a snapshot must carry to follow `expected`.
fn successor_version(expected: Option<u64>) -> u64 {
    expected.map_or(0, |version| version + 1)
}

fn check_swap(
    project_id: &ProjectId,
    expected: Option<u64>,
    current: Option<u64>,
    proposed: u64,
) -> TaxonResult<()> {
    if expected != current {
        warn!(
            project_id = %project_id,
            expected = ?expected,
            current = ?current,
            "compare-and-swap conflict"
        );
        return Err(TaxonError::MigrationConflict {
            expected: expected.unwrap_or(0),
            actual: current.unwrap_or(0),
        });
    }
    let successor = successor_version(expected);
    if proposed != successor {
        return Err(TaxonError::Consistency(format!(
            "snapshot for project {project_id} carries version {proposed}, expected {successor}"
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct FileProjectStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    fn state_path(&self, project_id: &ProjectId) -> PathBuf {
        self.projects_dir()
            .join(project_id.as_str())
            .join("state.json")
    }

    fn blob_path(&self, snapshot_ref: &SnapshotRef) -> PathBuf {
        self.root
            .join("blobs")
            .join(format!("{}.json", snapshot_ref.as_str()))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create dir {parent:?}"))?;
        }
        Ok(())
    }

    fn lock_for(&self, project_id: &ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_json(path: &Path) -> Result<Option<ProjectSnapshot>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading snapshot {path:?}"))?;
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing snapshot {path:?}"))?;
        Ok(Some(snapshot))
    }

    /// Write through a sibling temp file so readers never see a torn state.
    async fn write_json(path: &Path, snapshot: &ProjectSnapshot) -> Result<()> {
        Self::ensure_parent(path).await?;
        let payload = serde_json::to_string_pretty(snapshot)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, payload)
            .await
            .with_context(|| format!("failed writing snapshot {staging:?}"))?;
        fs::rename(&staging, path)
            .await
            .with_context(|| format!("failed moving snapshot into {path:?}"))?;
        Ok(())
    }

    async fn swap_inner(&self, expected: Option<u64>, snapshot: ProjectSnapshot) -> Result<()> {
        let path = self.state_path(&snapshot.project_id);
        let lock = self.lock_for(&snapshot.project_id);
        let _guard = lock.lock().await;

        let current = Self::read_json(&path).await?.map(|stored| stored.version);
        check_swap(&snapshot.project_id, expected, current, snapshot.version)?;
        Self::write_json(&path, &snapshot).await?;
        debug!(version = snapshot.version, "project state committed");
        Ok(())
    }

    async fn list_inner(&self) -> Result<Vec<ProjectId>> {
        let dir = self.projects_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed listing {dir:?}"))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if fs::try_exists(entry.path().join("state.json"))
                .await
                .unwrap_or(false)
            {
                out.push(ProjectId::from_string(
                    entry.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl ProjectStorePort for FileProjectStore {
    #[instrument(skip(self), fields(project_id = %project_id))]
    async fn load(&self, project_id: &ProjectId) -> TaxonResult<Option<ProjectSnapshot>> {
        Self::read_json(&self.state_path(project_id))
            .await
            .map_err(into_taxon)
    }

    #[instrument(skip(self, snapshot), fields(project_id = %snapshot.project_id, version = snapshot.version))]
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        snapshot: ProjectSnapshot,
    ) -> TaxonResult<()> {
        self.swap_inner(expected_version, snapshot)
            .await
            .map_err(into_taxon)
    }

    async fn put_blob(&self, snapshot: &ProjectSnapshot) -> TaxonResult<SnapshotRef> {
        let snapshot_ref = snapshot.content_ref();
        let path = self.blob_path(&snapshot_ref);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            Self::write_json(&path, snapshot).await.map_err(into_taxon)?;
            debug!(snapshot_ref = %snapshot_ref, "snapshot blob stored");
        }
        Ok(snapshot_ref)
    }

    async fn get_blob(&self, snapshot_ref: &SnapshotRef) -> TaxonResult<Option<ProjectSnapshot>> {
        Self::read_json(&self.blob_path(snapshot_ref))
            .await
            .map_err(into_taxon)
    }

    async fn list_projects(&self) -> TaxonResult<Vec<ProjectId>> {
        self.list_inner().await.map_err(into_taxon)
    }
}

#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    states: RwLock<HashMap<ProjectId, ProjectSnapshot>>,
    blobs: RwLock<HashMap<SnapshotRef, ProjectSnapshot>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStorePort for MemoryProjectStore {
    async fn load(&self, project_id: &ProjectId) -> TaxonResult<Option<ProjectSnapshot>> {
        Ok(self.states.read().get(project_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        snapshot: ProjectSnapshot,
    ) -> TaxonResult<()> {
        let mut states = self.states.write();
        let current = states
            .get(&snapshot.project_id)
            .map(|stored| stored.version);
        check_swap(
            &snapshot.project_id,
            expected_version,
            current,
            snapshot.version,
        )?;
        states.insert(snapshot.project_id.clone(), snapshot);
        Ok(())
    }

    async fn put_blob(&self, snapshot: &ProjectSnapshot) -> TaxonResult<SnapshotRef> {
        let snapshot_ref = snapshot.content_ref();
        self.blobs
            .write()
            .entry(snapshot_ref.clone())
            .or_insert_with(|| snapshot.clone());
        Ok(snapshot_ref)
    }

    async fn get_blob(&self, snapshot_ref: &SnapshotRef) -> TaxonResult<Option<ProjectSnapshot>> {
        Ok(self.blobs.read().get(snapshot_ref).cloned())
    }

    async fn list_projects(&self) -> TaxonResult<Vec<ProjectId>> {
        let mut out: Vec<ProjectId> = self.states.read().keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}

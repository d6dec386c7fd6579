use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use taxon_protocol::{LedgerPort, LedgerRecord, ProjectId, SeqNo, TaxonError, TaxonResult};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

/// Typed errors pass through; everything else becomes `Storage`.
pub(crate) fn into_taxon(error: anyhow::Error) -> TaxonError {
    match error.downcast::<TaxonError>() {
        Ok(typed) => typed,
        Err(other) => TaxonError::Storage(format!("{other:#}")),
    }
}

/// JSONL ledger, one file per project.
#[derive(Debug)]
pub struct FileLedger {
    root: PathBuf,
    write_locks: Mutex<HashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>>,
    sequence_cache: Mutex<HashMap<ProjectId, SeqNo>>,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            sequence_cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, project_id: &ProjectId) -> PathBuf {
        self.root
            .join("ledger")
            .join(format!("{}.jsonl", project_id.as_str()))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create ledger dir {parent:?}"))?;
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

    async fn scan_latest_sequence(path: &Path) -> Result<SeqNo> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(0);
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut latest = 0_u64;

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing ledger line in {path:?}"))?;
            latest = latest.max(record.sequence);
        }
        Ok(latest)
    }

    fn cached_latest_sequence(&self, project_id: &ProjectId) -> Option<SeqNo> {
        self.sequence_cache.lock().get(project_id).copied()
    }

    fn update_cached_sequence(&self, project_id: &ProjectId, latest: SeqNo) {
        self.sequence_cache.lock().insert(project_id.clone(), latest);
    }

    async fn append_inner(&self, record: &LedgerRecord) -> Result<()> {
        let path = self.file_path(&record.project_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(&record.project_id);
        let _guard = lock.lock().await;

        let latest = match self.cached_latest_sequence(&record.project_id) {
            Some(latest) => latest,
            None => {
                let latest = Self::scan_latest_sequence(&path).await?;
                self.update_cached_sequence(&record.project_id, latest);
                latest
            }
        };

        let expected_sequence = latest.saturating_add(1);
        if record.sequence != expected_sequence {
            warn!(
                expected_sequence,
                actual_sequence = record.sequence,
                "sequence conflict while appending ledger record"
            );
            bail!(
                "sequence conflict for project {}: expected {}, got {}",
                record.project_id,
                expected_sequence,
                record.sequence
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening ledger {path:?}"))?;

        let line = serde_json::to_string(record).context("failed serializing ledger record")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.update_cached_sequence(&record.project_id, record.sequence);
        debug!("ledger record appended");
        Ok(())
    }

    async fn read_inner(
        &self,
        project_id: &ProjectId,
        from_sequence: SeqNo,
        limit: usize,
    ) -> Result<Vec<LedgerRecord>> {
        let path = self.file_path(project_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if out.len() >= limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing ledger line in {path:?}"))?;
            if record.sequence >= from_sequence {
                out.push(record);
            }
        }
        debug!(count = out.len(), "ledger records loaded");
        Ok(out)
    }
}

#[async_trait]
impl LedgerPort for FileLedger {
    #[instrument(
        skip(self, record),
        fields(project_id = %record.project_id, sequence = record.sequence, entry = record.kind.name())
    )]
    async fn append(&self, record: LedgerRecord) -> TaxonResult<LedgerRecord> {
        self.append_inner(&record).await.map_err(into_taxon)?;
        Ok(record)
    }

    #[instrument(skip(self), fields(project_id = %project_id, from_sequence, limit))]
    async fn read(
        &self,
        project_id: &ProjectId,
        from_sequence: SeqNo,
        limit: usize,
    ) -> TaxonResult<Vec<LedgerRecord>> {
        self.read_inner(project_id, from_sequence, limit)
            .await
            .map_err(into_taxon)
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    async fn head(&self, project_id: &ProjectId) -> TaxonResult<SeqNo> {
        if let Some(latest) = self.cached_latest_sequence(project_id) {
            return Ok(latest);
        }
        let path = self.file_path(project_id);
        let latest = Self::scan_latest_sequence(&path).await.map_err(into_taxon)?;
        self.update_cached_sequence(project_id, latest);
        debug!(latest, "ledger head resolved");
        Ok(latest)
    }
}

/// In-memory ledger with the same sequencing rules.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<ProjectId, Vec<LedgerRecord>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerPort for MemoryLedger {
    async fn append(&self, record: LedgerRecord) -> TaxonResult<LedgerRecord> {
        let mut guard = self.records.write();
        let log = guard.entry(record.project_id.clone()).or_default();
        let expected = log.last().map_or(0, |last| last.sequence) + 1;
        if record.sequence != expected {
            return Err(TaxonError::Storage(format!(
                "sequence conflict for project {}: expected {expected}, got {}",
                record.project_id, record.sequence
            )));
        }
        log.push(record.clone());
        Ok(record)
    }

    async fn read(
        &self,
        project_id: &ProjectId,
        from_sequence: SeqNo,
        limit: usize,
    ) -> TaxonResult<Vec<LedgerRecord>> {
        Ok(self
            .records
            .read()
            .get(project_id)
            .map(|log| {
                log.iter()
                    .filter(|record| record.sequence >= from_sequence)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head(&self, project_id: &ProjectId) -> TaxonResult<SeqNo> {
        Ok(self
            .records
            .read()
            .get(project_id)
            .and_then(|log| log.last())
            .map_or(0, |last| last.sequence))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use taxon_protocol::{LedgerEntry, LedgerPort, LedgerRecord, ProjectId};
    use tokio::fs;

    use super::{FileLedger, MemoryLedger};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn record(project_id: &ProjectId, sequence: u64) -> LedgerRecord {
        LedgerRecord::new(
            project_id.clone(),
            sequence,
            LedgerEntry::OracleUnavailable {
                stage: "detect".into(),
                message: format!("attempt {sequence}"),
            },
        )
    }

    #[tokio::test]
    async fn file_ledger_appends_and_reads_in_sequence() -> Result<()> {
        let root = unique_test_root("taxon-ledger");
        let ledger = FileLedger::new(&root);
        let project = ProjectId::from_string("alpha");

        ledger.append(record(&project, 1)).await?;
        ledger.append(record(&project, 2)).await?;

        let from_two = ledger.read(&project, 2, 10).await?;
        assert_eq!(from_two.len(), 1);
        assert_eq!(from_two[0].sequence, 2);
        assert_eq!(ledger.head(&project).await?, 2);

        let reopened = FileLedger::new(&root);
        assert_eq!(reopened.head(&project).await?, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_ledger_rejects_duplicate_sequence() -> Result<()> {
        let root = unique_test_root("taxon-ledger-duplicate");
        let ledger = FileLedger::new(&root);
        let project = ProjectId::from_string("alpha");

        ledger.append(record(&project, 1)).await?;
        let err = ledger.append(record(&project, 1)).await.unwrap_err();
        assert!(err.to_string().contains("expected 2, got 1"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_ledger_keeps_projects_apart() -> Result<()> {
        let root = unique_test_root("taxon-ledger-projects");
        let ledger = FileLedger::new(&root);
        let alpha = ProjectId::from_string("alpha");
        let beta = ProjectId::from_string("beta");

        ledger.append(record(&alpha, 1)).await?;
        ledger.append(record(&beta, 1)).await?;
        ledger.append(record(&beta, 2)).await?;

        assert_eq!(ledger.head(&alpha).await?, 1);
        assert_eq!(ledger.head(&beta).await?, 2);
        assert_eq!(ledger.read(&alpha, 1, 10).await?.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn memory_ledger_rejects_sequence_gap() -> Result<()> {
        let ledger = MemoryLedger::new();
        let project = ProjectId::from_string("alpha");
        ledger.append(record(&project, 1)).await?;
        let err = ledger.append(record(&project, 3)).await.unwrap_err();
        assert!(err.to_string().contains("expected 2, got 3"));
        assert_eq!(ledger.head(&project).await?, 1);
        Ok(())
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use taxon_protocol::{
    EntryId, LedgerEntry, LedgerPort, LedgerRecord, LedgerRecordStream, ProjectId, SeqNo,
    TaxonError, TaxonResult,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument};

/// Records read per page while replaying a project ledger.
const REPLAY_PAGE: usize = 512;

#[derive(Clone, Debug)]
pub struct LedgerStreamHub {
    sender: broadcast::Sender<LedgerRecord>,
}

impl LedgerStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, record: LedgerRecord) {
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerRecord> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<LedgerRecord> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

/// Sequencing front of a ledger: assigns the next sequence per project,
/// appends, then publishes to subscribers.
#[derive(Clone)]
pub struct LedgerJournal {
    ledger: Arc<dyn LedgerPort>,
    stream: LedgerStreamHub,
    append_locks: Arc<Mutex<HashMap<ProjectId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LedgerJournal {
    pub fn new(ledger: Arc<dyn LedgerPort>, stream: LedgerStreamHub) -> Self {
        Self {
            ledger,
            stream,
            append_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, project_id: &ProjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.append_locks.lock();
        guard
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn append_and_publish(
        &self,
        project_id: &ProjectId,
        entry: LedgerEntry,
    ) -> TaxonResult<LedgerRecord> {
        self.append_caused(project_id, entry, None).await
    }

    /// Append an entry caused by an earlier one.
    #[instrument(skip(self, entry), fields(project_id = %project_id, entry = entry.name()))]
    pub async fn append_caused(
        &self,
        project_id: &ProjectId,
        entry: LedgerEntry,
        causation_id: Option<EntryId>,
    ) -> TaxonResult<LedgerRecord> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let sequence = self.ledger.head(project_id).await?.saturating_add(1);
        let mut record = LedgerRecord::new(project_id.clone(), sequence, entry);
        record.causation_id = causation_id;
        let record = self.ledger.append(record).await?;
        self.stream.publish(record.clone());
        debug!(sequence, "ledger record published");
        Ok(record)
    }

    pub async fn read(
        &self,
        project_id: &ProjectId,
        from_sequence: SeqNo,
        limit: usize,
    ) -> TaxonResult<Vec<LedgerRecord>> {
        self.ledger.read(project_id, from_sequence, limit).await
    }

    /// Every record of a project, in sequence order.
    pub async fn replay(&self, project_id: &ProjectId) -> TaxonResult<Vec<LedgerRecord>> {
        let mut out = Vec::new();
        let mut next = 1;
        loop {
            let page = self.ledger.read(project_id, next, REPLAY_PAGE).await?;
            let Some(last) = page.last() else {
                break;
            };
            next = last.sequence + 1;
            let full = page.len() == REPLAY_PAGE;
            out.extend(page);
            if !full {
                break;
            }
        }
        debug!(project_id = %project_id, count = out.len(), "ledger replayed");
        Ok(out)
    }

    pub async fn head(&self, project_id: &ProjectId) -> TaxonResult<SeqNo> {
        self.ledger.head(project_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerRecord> {
        self.stream.subscribe()
    }

    /// Live records of one project. A lagging subscriber sees a `Storage`
    /// error item and continues with newer records.
    pub fn subscribe_project(&self, project_id: ProjectId) -> LedgerRecordStream {
        self.stream
            .subscribe_stream()
            .filter_map(move |item| {
                let wanted = project_id.clone();
                async move {
                    match item {
                        Ok(record) if record.project_id == wanted => Some(Ok(record)),
                        Ok(_) => None,
                        Err(err) => Some(Err(TaxonError::Storage(format!(
                            "ledger subscriber lagged: {err}"
                        )))),
                    }
                }
            })
            .boxed()
    }
}

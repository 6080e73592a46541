//! Progress reporting for indexing runs.
//!
//! There is no separate progress state machine to keep in sync: the
//! orchestrator already persists a StageResult row for every stage
//! transition, so a progress snapshot is derived by tallying those rows
//! against the run's document count. [`ProgressTracker::publish`] rebuilds
//! the snapshot from the store and pushes it to a watch channel that UIs
//! and tests can subscribe to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Stage, StageResult, StageStatus};
use crate::store::DataStore;

/// Document tally for one per-document stage.
///
/// `waiting` counts documents with no persisted result for the stage yet.
/// A document that failed an earlier stage never reaches later ones, so it
/// stays `waiting` there; [`RunProgress::documents_failed`] accounts for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub waiting: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StageCounts {
    /// Documents this stage will not touch again
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    pub fn in_flight(&self) -> bool {
        self.waiting > 0 || self.running > 0
    }
}

/// Snapshot of one indexing run, derived from its persisted stage results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub total_documents: usize,
    pub partition: StageCounts,
    pub metadata: StageCounts,
    pub enrichment: StageCounts,
    pub chunking: StageCounts,
    /// The run-wide barrier stage; `None` until it has been dispatched
    pub embedding: Option<StageStatus>,
}

impl RunProgress {
    /// Tally persisted stage results into a snapshot.
    ///
    /// Rows from other runs and from the wiki/checklist stage families are
    /// ignored; per-document rows require a document id, the embedding row
    /// must not carry one.
    pub fn derive(run_id: Uuid, total_documents: usize, results: &[StageResult]) -> Self {
        let mut progress = Self {
            run_id,
            total_documents,
            partition: StageCounts::default(),
            metadata: StageCounts::default(),
            enrichment: StageCounts::default(),
            chunking: StageCounts::default(),
            embedding: None,
        };

        for result in results.iter().filter(|r| r.run_id == run_id) {
            if result.stage == Stage::Embedding && result.document_id.is_none() {
                progress.embedding = Some(result.status);
                continue;
            }
            if result.document_id.is_none() {
                continue;
            }
            let counts = match result.stage {
                Stage::Partition => &mut progress.partition,
                Stage::Metadata => &mut progress.metadata,
                Stage::Enrichment => &mut progress.enrichment,
                Stage::Chunking => &mut progress.chunking,
                _ => continue,
            };
            match result.status {
                StageStatus::Pending | StageStatus::Running => counts.running += 1,
                StageStatus::Completed => counts.completed += 1,
                StageStatus::Failed => counts.failed += 1,
            }
        }

        for counts in [
            &mut progress.partition,
            &mut progress.metadata,
            &mut progress.enrichment,
            &mut progress.chunking,
        ] {
            let seen = counts.running + counts.completed + counts.failed;
            counts.waiting = total_documents.saturating_sub(seen);
        }

        progress
    }

    /// Documents whose whole per-document pipeline succeeded
    pub fn documents_chunked(&self) -> usize {
        self.chunking.completed
    }

    /// Documents that failed a stage (each document fails at most one)
    pub fn documents_failed(&self) -> usize {
        self.partition.failed + self.metadata.failed + self.enrichment.failed + self.chunking.failed
    }

    /// Whether any per-document stage work is outstanding
    pub fn documents_in_flight(&self) -> bool {
        self.documents_chunked() + self.documents_failed() < self.total_documents
    }
}

/// Publishes run snapshots rebuilt from the data store.
pub struct ProgressTracker {
    store: Arc<dyn DataStore>,
    latest: watch::Sender<Option<RunProgress>>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        let (latest, _) = watch::channel(None);
        Self { store, latest }
    }

    /// Receiver holding the most recent snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<RunProgress>> {
        self.latest.subscribe()
    }

    /// Rebuild the snapshot for a run and publish it to subscribers.
    pub async fn publish(&self, run_id: Uuid) -> Result<RunProgress> {
        let documents = self.store.documents_for_run(run_id).await?;
        let results = self.store.stage_results_for_run(run_id).await?;
        let progress = RunProgress::derive(run_id, documents.len(), &results);
        self.latest.send_replace(Some(progress.clone()));
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessLevel, Document, IndexingRun, UploadKind};
    use crate::store::MemoryDataStore;

    async fn seed_run(store: &MemoryDataStore, documents: usize) -> (Uuid, Vec<Uuid>) {
        let run = IndexingRun::new(
            AccessLevel::Private,
            UploadKind::UserProject,
            serde_json::json!({}),
        );
        store.create_indexing_run(&run).await.unwrap();
        let mut doc_ids = Vec::new();
        for i in 0..documents {
            let doc = Document {
                id: Uuid::new_v4(),
                filename: format!("doc-{i}.pdf"),
                blob_key: format!("runs/{}/doc-{i}.pdf", run.id),
                page_count: None,
                byte_size: 0,
                owner_id: None,
            };
            store.upsert_document(&doc).await.unwrap();
            store.link_document_to_run(run.id, doc.id).await.unwrap();
            doc_ids.push(doc.id);
        }
        (run.id, doc_ids)
    }

    fn result(run: Uuid, doc: Option<Uuid>, stage: Stage, status: StageStatus) -> StageResult {
        let mut result = StageResult::running(run, doc, stage, None);
        result.status = status;
        result
    }

    #[tokio::test]
    async fn snapshot_is_derived_from_stage_results() {
        let store = Arc::new(MemoryDataStore::new());
        let (run, docs) = seed_run(&store, 2).await;

        // doc 0 made it through chunking, doc 1 died in partition
        for stage in [
            Stage::Partition,
            Stage::Metadata,
            Stage::Enrichment,
            Stage::Chunking,
        ] {
            store
                .upsert_stage_result(&result(run, Some(docs[0]), stage, StageStatus::Completed))
                .await
                .unwrap();
        }
        store
            .upsert_stage_result(&result(run, Some(docs[1]), Stage::Partition, StageStatus::Failed))
            .await
            .unwrap();
        store
            .upsert_stage_result(&result(run, None, Stage::Embedding, StageStatus::Running))
            .await
            .unwrap();

        let tracker = ProgressTracker::new(store);
        let progress = tracker.publish(run).await.unwrap();

        assert_eq!(progress.total_documents, 2);
        assert_eq!(progress.partition.completed, 1);
        assert_eq!(progress.partition.failed, 1);
        assert_eq!(progress.partition.waiting, 0);
        // the failed document never reached metadata: it reads as waiting
        assert_eq!(progress.metadata.completed, 1);
        assert_eq!(progress.metadata.waiting, 1);
        assert_eq!(progress.documents_chunked(), 1);
        assert_eq!(progress.documents_failed(), 1);
        assert!(!progress.documents_in_flight());
        assert_eq!(progress.embedding, Some(StageStatus::Running));
    }

    #[tokio::test]
    async fn run_without_results_is_all_waiting() {
        let store = Arc::new(MemoryDataStore::new());
        let (run, _) = seed_run(&store, 3).await;

        let tracker = ProgressTracker::new(store);
        let progress = tracker.publish(run).await.unwrap();

        assert_eq!(progress.partition.waiting, 3);
        assert_eq!(progress.chunking.waiting, 3);
        assert!(progress.partition.in_flight());
        assert!(progress.documents_in_flight());
        assert_eq!(progress.embedding, None);
    }

    #[tokio::test]
    async fn subscribers_receive_published_snapshots() {
        let store = Arc::new(MemoryDataStore::new());
        let (run, docs) = seed_run(&store, 1).await;
        store
            .upsert_stage_result(&result(
                run,
                Some(docs[0]),
                Stage::Partition,
                StageStatus::Running,
            ))
            .await
            .unwrap();

        let tracker = ProgressTracker::new(store);
        let rx = tracker.subscribe();
        assert!(rx.borrow().is_none());

        tracker.publish(run).await.unwrap();
        let snapshot = rx.borrow().clone().expect("snapshot published");
        assert_eq!(snapshot.run_id, run);
        assert_eq!(snapshot.partition.running, 1);
        assert!(snapshot.documents_in_flight());
    }

    #[tokio::test]
    async fn foreign_runs_and_pipelines_are_ignored() {
        let store = Arc::new(MemoryDataStore::new());
        let (run, docs) = seed_run(&store, 1).await;
        let other_run = Uuid::new_v4();

        store
            .upsert_stage_result(&result(
                run,
                Some(docs[0]),
                Stage::Chunking,
                StageStatus::Completed,
            ))
            .await
            .unwrap();
        // a wiki stage and another run's row must not leak into the tally
        store
            .upsert_stage_result(&result(run, None, Stage::Overview, StageStatus::Completed))
            .await
            .unwrap();
        store
            .upsert_stage_result(&result(
                other_run,
                Some(docs[0]),
                Stage::Partition,
                StageStatus::Failed,
            ))
            .await
            .unwrap();

        let tracker = ProgressTracker::new(store);
        let progress = tracker.publish(run).await.unwrap();
        assert_eq!(progress.chunking.completed, 1);
        assert_eq!(progress.partition.failed, 0);
        assert_eq!(progress.documents_failed(), 0);
    }
}

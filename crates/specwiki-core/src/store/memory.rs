//! In-memory `DataStore` for tests.
//!
//! Nearest-neighbor search is a brute-force cosine scan, which doubles as a
//! reference implementation for the pgvector-backed store. A failure flag
//! lets tests exercise the retrieval fallback path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::DataStore;
use crate::error::{CoreError, Result};
use crate::models::{
    ChecklistResult, ChecklistRun, Chunk, ChunkMatch, Document, IndexingRun, RunStatus, Stage,
    StageResult, WikiRun,
};
use crate::retrieval::similarity::cosine_similarity;

#[derive(Default)]
struct Inner {
    indexing_runs: HashMap<Uuid, IndexingRun>,
    documents: HashMap<Uuid, Document>,
    run_documents: Vec<(Uuid, Uuid)>,
    chunks: HashMap<Uuid, Chunk>,
    stage_results: HashMap<(Uuid, Option<Uuid>, Stage), StageResult>,
    wiki_runs: HashMap<Uuid, WikiRun>,
    checklist_runs: HashMap<Uuid, ChecklistRun>,
    checklist_results: HashMap<Uuid, Vec<ChecklistResult>>,
}

#[derive(Default)]
pub struct MemoryDataStore {
    inner: Mutex<Inner>,
    /// When set, `match_chunks` errors to simulate an HNSW outage
    fail_match_chunks: AtomicBool,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_match_chunks_failure(&self, fail: bool) {
        self.fail_match_chunks.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn create_indexing_run(&self, run: &IndexingRun) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.indexing_runs.contains_key(&run.id) {
            return Err(CoreError::Conflict(format!(
                "indexing run {} already exists",
                run.id
            )));
        }
        inner.indexing_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_indexing_run(&self, id: Uuid) -> Result<Option<IndexingRun>> {
        Ok(self.inner.lock().unwrap().indexing_runs.get(&id).cloned())
    }

    async fn update_indexing_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .indexing_runs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("indexing run {id}")))?;
        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        if matches!(
            status,
            RunStatus::Completed | RunStatus::CompletedWithWarnings | RunStatus::Failed
        ) {
            run.completed_at = Some(Utc::now());
        }
        if error_message.is_some() {
            run.error_message = error_message;
        }
        Ok(())
    }

    async fn delete_indexing_run(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.indexing_runs.remove(&id);
        inner.chunks.retain(|_, c| c.indexing_run_id != id);
        inner.stage_results.retain(|(run, _, _), _| *run != id);
        inner.run_documents.retain(|(run, _)| *run != id);
        // documents referenced by no remaining run go too
        let referenced: Vec<Uuid> = inner.run_documents.iter().map(|(_, d)| *d).collect();
        inner.documents.retain(|id, _| referenced.contains(id));
        Ok(())
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .documents
            .insert(document.id, document.clone());
        Ok(())
    }

    async fn link_document_to_run(&self, run_id: Uuid, document_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.run_documents.contains(&(run_id, document_id)) {
            inner.run_documents.push((run_id, document_id));
        }
        Ok(())
    }

    async fn documents_for_run(&self, run_id: Uuid) -> Result<Vec<Document>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .run_documents
            .iter()
            .filter(|(run, _)| *run == run_id)
            .filter_map(|(_, doc)| inner.documents.get(doc).cloned())
            .collect())
    }

    async fn update_document_page_count(&self, document_id: Uuid, page_count: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let doc = inner
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| CoreError::NotFound(format!("document {document_id}")))?;
        doc.page_count = Some(page_count);
        Ok(())
    }

    async fn delete_chunks_for_document(&self, run_id: Uuid, document_id: Uuid) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .retain(|_, c| !(c.indexing_run_id == run_id && c.document_id == document_id));
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for chunk in chunks {
            // upsert on (run, doc, ordinal): replace any prior row at the key
            let existing = inner.chunks.iter().find_map(|(id, c)| {
                (c.indexing_run_id == chunk.indexing_run_id
                    && c.document_id == chunk.document_id
                    && c.ordinal == chunk.ordinal)
                    .then_some(*id)
            });
            if let Some(id) = existing {
                inner.chunks.remove(&id);
            }
            inner.chunks.insert(chunk.id, chunk.clone());
        }
        Ok(())
    }

    async fn update_chunk_embeddings(&self, updates: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for (id, embedding) in updates {
            if let Some(chunk) = inner.chunks.get_mut(id) {
                chunk.embedding = Some(embedding.clone());
            }
        }
        Ok(())
    }

    async fn chunks_for_run(&self, run_id: Uuid, embedded_only: bool) -> Result<Vec<Chunk>> {
        let inner = self.inner.lock().unwrap();
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| c.indexing_run_id == run_id)
            .filter(|c| !embedded_only || c.embedding.is_some())
            .cloned()
            .collect();
        chunks.sort_by_key(|c| (c.document_id, c.ordinal));
        Ok(chunks)
    }

    async fn match_chunks(
        &self,
        embedding: &[f32],
        threshold: f32,
        match_count: usize,
        indexing_run_id: Option<Uuid>,
    ) -> Result<Vec<ChunkMatch>> {
        if self.fail_match_chunks.load(Ordering::SeqCst) {
            return Err(CoreError::UpstreamUnavailable(
                "match_chunks unavailable".into(),
            ));
        }
        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<(f32, ChunkMatch)> = inner
            .chunks
            .values()
            .filter(|c| indexing_run_id.map_or(true, |run| c.indexing_run_id == run))
            .filter_map(|c| {
                let chunk_embedding = c.embedding.as_ref()?;
                let similarity = cosine_similarity(embedding, chunk_embedding);
                (similarity >= threshold).then(|| {
                    (
                        similarity,
                        ChunkMatch {
                            id: c.id,
                            document_id: c.document_id,
                            indexing_run_id: c.indexing_run_id,
                            content: c.content.clone(),
                            metadata: c.metadata.clone(),
                            embedding: Some(chunk_embedding.clone()),
                        },
                    )
                })
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(match_count)
            .map(|(_, m)| m)
            .collect())
    }

    async fn upsert_stage_result(&self, result: &StageResult) -> Result<()> {
        self.inner.lock().unwrap().stage_results.insert(
            (result.run_id, result.document_id, result.stage),
            result.clone(),
        );
        Ok(())
    }

    async fn get_stage_result(
        &self,
        run_id: Uuid,
        document_id: Option<Uuid>,
        stage: Stage,
    ) -> Result<Option<StageResult>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .stage_results
            .get(&(run_id, document_id, stage))
            .cloned())
    }

    async fn stage_results_for_run(&self, run_id: Uuid) -> Result<Vec<StageResult>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .stage_results
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn create_wiki_run(&self, run: &WikiRun) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .wiki_runs
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn get_wiki_run(&self, id: Uuid) -> Result<Option<WikiRun>> {
        Ok(self.inner.lock().unwrap().wiki_runs.get(&id).cloned())
    }

    async fn update_wiki_run(&self, run: &WikiRun) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.wiki_runs.contains_key(&run.id) {
            return Err(CoreError::NotFound(format!("wiki run {}", run.id)));
        }
        inner.wiki_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn create_checklist_run(&self, run: &ChecklistRun) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .checklist_runs
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn get_checklist_run(&self, id: Uuid) -> Result<Option<ChecklistRun>> {
        Ok(self.inner.lock().unwrap().checklist_runs.get(&id).cloned())
    }

    async fn update_checklist_run(&self, run: &ChecklistRun) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.checklist_runs.contains_key(&run.id) {
            return Err(CoreError::NotFound(format!("checklist run {}", run.id)));
        }
        inner.checklist_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn store_checklist_results(
        &self,
        run_id: Uuid,
        results: &[ChecklistResult],
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .checklist_results
            .insert(run_id, results.to_vec());
        Ok(())
    }

    async fn checklist_results_for_run(&self, run_id: Uuid) -> Result<Vec<ChecklistResult>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checklist_results
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessLevel, ChunkMetadata, ElementCategory, UploadKind};

    fn chunk(run: Uuid, doc: Uuid, ordinal: u32, content: &str, embedding: Option<Vec<f32>>) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: doc,
            indexing_run_id: run,
            ordinal,
            content: content.to_string(),
            metadata: ChunkMetadata {
                page_number: 1,
                element_category: ElementCategory::NarrativeText,
                source_filename: "doc.pdf".into(),
                section_title_inherited: None,
                element_id: None,
                merged_from: vec![],
                enrichment: None,
            },
            embedding,
        }
    }

    #[tokio::test]
    async fn chunk_upsert_is_keyed_on_ordinal() {
        let store = MemoryDataStore::new();
        let run = Uuid::new_v4();
        let doc = Uuid::new_v4();
        store
            .insert_chunks(&[chunk(run, doc, 0, "first", None)])
            .await
            .unwrap();
        store
            .insert_chunks(&[chunk(run, doc, 0, "replaced", None)])
            .await
            .unwrap();
        let chunks = store.chunks_for_run(run, false).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "replaced");
    }

    #[tokio::test]
    async fn match_chunks_orders_by_similarity_and_honors_threshold() {
        let store = MemoryDataStore::new();
        let run = Uuid::new_v4();
        let doc = Uuid::new_v4();
        store
            .insert_chunks(&[
                chunk(run, doc, 0, "close", Some(vec![1.0, 0.0, 0.0])),
                chunk(run, doc, 1, "far", Some(vec![0.0, 1.0, 0.0])),
                chunk(run, doc, 2, "mid", Some(vec![0.7, 0.7, 0.0])),
                chunk(run, doc, 3, "no embedding", None),
            ])
            .await
            .unwrap();

        let matches = store
            .match_chunks(&[1.0, 0.0, 0.0], 0.1, 10, Some(run))
            .await
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].content, "close");
        assert_eq!(matches[1].content, "mid");
    }

    #[tokio::test]
    async fn cascade_delete_removes_chunks_and_unreferenced_documents() {
        let store = MemoryDataStore::new();
        let run = IndexingRun::new(
            AccessLevel::Private,
            UploadKind::UserProject,
            serde_json::json!({}),
        );
        let doc = Document {
            id: Uuid::new_v4(),
            filename: "a.pdf".into(),
            blob_key: "runs/x/a.pdf".into(),
            page_count: None,
            byte_size: 10,
            owner_id: None,
        };
        store.create_indexing_run(&run).await.unwrap();
        store.upsert_document(&doc).await.unwrap();
        store.link_document_to_run(run.id, doc.id).await.unwrap();
        store
            .insert_chunks(&[chunk(run.id, doc.id, 0, "c", None)])
            .await
            .unwrap();

        store.delete_indexing_run(run.id).await.unwrap();
        assert!(store.get_indexing_run(run.id).await.unwrap().is_none());
        assert!(store.chunks_for_run(run.id, false).await.unwrap().is_empty());
        assert!(store.documents_for_run(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_update_stamps_timestamps() {
        let store = MemoryDataStore::new();
        let run = IndexingRun::new(
            AccessLevel::Public,
            UploadKind::Email,
            serde_json::json!({}),
        );
        store.create_indexing_run(&run).await.unwrap();
        store
            .update_indexing_run_status(run.id, RunStatus::Running, None)
            .await
            .unwrap();
        let running = store.get_indexing_run(run.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        store
            .update_indexing_run_status(
                run.id,
                RunStatus::CompletedWithWarnings,
                Some("2 chunks not embedded".into()),
            )
            .await
            .unwrap();
        let done = store.get_indexing_run(run.id).await.unwrap().unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.error_message.as_deref(), Some("2 chunks not embedded"));
    }
}

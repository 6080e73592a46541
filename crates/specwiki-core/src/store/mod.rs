//! Storage seams: the relational/vector data store and the blob object
//! store.
//!
//! Both are traits so pipelines can run against Postgres+pgvector in
//! production and the in-memory implementations in tests.

pub mod memory;
pub mod object;
pub mod postgres;

pub use memory::MemoryDataStore;
pub use object::{FsObjectStore, MemoryObjectStore};
pub use postgres::PgDataStore;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ChecklistResult, ChecklistRun, Chunk, ChunkMatch, Document, IndexingRun, RunStatus, Stage,
    StageResult, WikiRun,
};

/// Transactional relational store with vector columns.
///
/// All writes are single-row upserts or keyed batch upserts, so concurrent
/// stage completion commutes. Chunk inserts key on
/// (run id, document id, ordinal) to stay idempotent across retries.
#[async_trait]
pub trait DataStore: Send + Sync {
    // ---- indexing runs ----
    async fn create_indexing_run(&self, run: &IndexingRun) -> Result<()>;
    async fn get_indexing_run(&self, id: Uuid) -> Result<Option<IndexingRun>>;
    /// Update status; sets `started_at` on Running and `completed_at` on any
    /// terminal status. A non-None error message overwrites the stored one.
    async fn update_indexing_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    /// Cascade-deletes chunks, stage results and run-document links.
    async fn delete_indexing_run(&self, id: Uuid) -> Result<()>;

    // ---- documents ----
    async fn upsert_document(&self, document: &Document) -> Result<()>;
    async fn link_document_to_run(&self, run_id: Uuid, document_id: Uuid) -> Result<()>;
    async fn documents_for_run(&self, run_id: Uuid) -> Result<Vec<Document>>;
    async fn update_document_page_count(&self, document_id: Uuid, page_count: u32) -> Result<()>;

    // ---- chunks ----
    async fn delete_chunks_for_document(&self, run_id: Uuid, document_id: Uuid) -> Result<()>;
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;
    async fn update_chunk_embeddings(&self, updates: &[(Uuid, Vec<f32>)]) -> Result<()>;
    /// All chunks of a run in (document, ordinal) order; optionally only
    /// those with a non-null embedding.
    async fn chunks_for_run(&self, run_id: Uuid, embedded_only: bool) -> Result<Vec<Chunk>>;
    /// Nearest-neighbor search over stored embeddings (HNSW-backed in
    /// production), cosine distance, best first.
    async fn match_chunks(
        &self,
        embedding: &[f32],
        threshold: f32,
        match_count: usize,
        indexing_run_id: Option<Uuid>,
    ) -> Result<Vec<ChunkMatch>>;

    // ---- stage results ----
    async fn upsert_stage_result(&self, result: &StageResult) -> Result<()>;
    async fn get_stage_result(
        &self,
        run_id: Uuid,
        document_id: Option<Uuid>,
        stage: Stage,
    ) -> Result<Option<StageResult>>;
    async fn stage_results_for_run(&self, run_id: Uuid) -> Result<Vec<StageResult>>;

    // ---- wiki runs ----
    async fn create_wiki_run(&self, run: &WikiRun) -> Result<()>;
    async fn get_wiki_run(&self, id: Uuid) -> Result<Option<WikiRun>>;
    async fn update_wiki_run(&self, run: &WikiRun) -> Result<()>;

    // ---- checklist runs ----
    async fn create_checklist_run(&self, run: &ChecklistRun) -> Result<()>;
    async fn get_checklist_run(&self, id: Uuid) -> Result<Option<ChecklistRun>>;
    async fn update_checklist_run(&self, run: &ChecklistRun) -> Result<()>;
    async fn store_checklist_results(
        &self,
        run_id: Uuid,
        results: &[ChecklistResult],
    ) -> Result<()>;
    async fn checklist_results_for_run(&self, run_id: Uuid) -> Result<Vec<ChecklistResult>>;
}

/// Key-addressed blob store with signed-URL issuance.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Bytes>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Issue a time-limited read URL for the key.
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Object-store key for a run's source PDF
pub fn source_pdf_key(run_id: Uuid, document_id: Uuid) -> String {
    format!("runs/{run_id}/documents/{document_id}/source.pdf")
}

/// Object-store key for a rendered page image
pub fn page_image_key(run_id: Uuid, document_id: Uuid, page: u32) -> String {
    format!("runs/{run_id}/documents/{document_id}/pages/page_{page}.png")
}

/// Object-store key for a rendered table region
pub fn table_image_key(run_id: Uuid, document_id: Uuid, table_id: &str) -> String {
    format!("runs/{run_id}/documents/{document_id}/tables/table_{table_id}.png")
}

/// Object-store key for a wiki page's markdown
pub fn wiki_page_key(wiki_run_id: Uuid, page_index: usize) -> String {
    format!("wiki/{wiki_run_id}/page-{page_index}.md")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let run = Uuid::nil();
        let doc = Uuid::nil();
        assert_eq!(
            source_pdf_key(run, doc),
            format!("runs/{run}/documents/{doc}/source.pdf")
        );
        assert!(page_image_key(run, doc, 3).ends_with("/pages/page_3.png"));
        assert!(table_image_key(run, doc, "t1").ends_with("/tables/table_t1.png"));
        assert!(wiki_page_key(run, 2).ends_with("/page-2.md"));
    }
}

//! Postgres + pgvector `DataStore` implementation.
//!
//! Queries are runtime-checked (`sqlx::query`) so the crate builds without a
//! live database. `match_chunks` rides the HNSW cosine index; similarity is
//! `1 - (embedding <=> query)`.

use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::DataStore;
use crate::error::{CoreError, Result};
use crate::models::{
    ChecklistResult, ChecklistRun, Chunk, ChunkMatch, ChunkMetadata, Document, IndexingRun,
    RunStatus, Stage, StageResult, WikiRun,
};

const SCHEMA: &str = r#"
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS indexing_runs (
    id UUID PRIMARY KEY,
    access_level TEXT NOT NULL,
    upload_kind TEXT NOT NULL,
    user_id UUID,
    project_id UUID,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    config_snapshot JSONB NOT NULL DEFAULT '{}'::jsonb,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS documents (
    id UUID PRIMARY KEY,
    filename TEXT NOT NULL,
    blob_key TEXT NOT NULL,
    page_count INTEGER,
    byte_size BIGINT NOT NULL DEFAULT 0,
    owner_id UUID
);

CREATE TABLE IF NOT EXISTS indexing_run_documents (
    indexing_run_id UUID NOT NULL REFERENCES indexing_runs(id) ON DELETE CASCADE,
    document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    PRIMARY KEY (indexing_run_id, document_id)
);

CREATE TABLE IF NOT EXISTS document_chunks (
    id UUID PRIMARY KEY,
    document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    indexing_run_id UUID NOT NULL REFERENCES indexing_runs(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    content TEXT NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    embedding_1024 vector(1024),
    UNIQUE (indexing_run_id, document_id, ordinal)
);

CREATE INDEX IF NOT EXISTS document_chunks_embedding_idx
    ON document_chunks USING hnsw (embedding_1024 vector_cosine_ops);

CREATE TABLE IF NOT EXISTS stage_results (
    run_id UUID NOT NULL,
    document_id UUID,
    stage_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    duration_seconds DOUBLE PRECISION,
    summary_stats JSONB NOT NULL DEFAULT '{}'::jsonb,
    sample_outputs JSONB,
    config_hash TEXT,
    data JSONB,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS wiki_generation_runs (
    id UUID PRIMARY KEY,
    indexing_run_id UUID NOT NULL REFERENCES indexing_runs(id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    storage_prefix TEXT NOT NULL,
    pages_metadata JSONB NOT NULL DEFAULT '[]'::jsonb,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS checklist_analysis_runs (
    id UUID PRIMARY KEY,
    indexing_run_id UUID NOT NULL REFERENCES indexing_runs(id) ON DELETE CASCADE,
    checklist_content TEXT NOT NULL,
    model_name TEXT NOT NULL,
    access_level TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_current INTEGER NOT NULL DEFAULT 0,
    progress_total INTEGER NOT NULL DEFAULT 4,
    raw_analysis TEXT,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS checklist_results (
    analysis_run_id UUID NOT NULL REFERENCES checklist_analysis_runs(id) ON DELETE CASCADE,
    item_number TEXT NOT NULL,
    item_name TEXT NOT NULL,
    status TEXT NOT NULL,
    description TEXT NOT NULL,
    confidence REAL,
    primary_source JSONB,
    sources JSONB NOT NULL DEFAULT '[]'::jsonb
);
"#;

pub struct PgDataStore {
    pool: PgPool,
}

impl PgDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create tables, the vector extension and the HNSW index.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Database schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn enum_to_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        other => panic!("enum did not serialize to a string: {other:?}"),
    }
}

fn enum_from_str<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| CoreError::Internal(anyhow::anyhow!("unknown {what} value: {s}")))
}

fn indexing_run_from_row(row: &PgRow) -> Result<IndexingRun> {
    Ok(IndexingRun {
        id: row.try_get("id")?,
        access_level: enum_from_str(row.try_get::<String, _>("access_level")?.as_str(), "access level")?,
        upload_kind: enum_from_str(row.try_get::<String, _>("upload_kind")?.as_str(), "upload kind")?,
        user_id: row.try_get("user_id")?,
        project_id: row.try_get("project_id")?,
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str(), "run status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        config_snapshot: row.try_get("config_snapshot")?,
        error_message: row.try_get("error_message")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        blob_key: row.try_get("blob_key")?,
        page_count: row.try_get::<Option<i32>, _>("page_count")?.map(|n| n as u32),
        byte_size: row.try_get::<i64, _>("byte_size")? as u64,
        owner_id: row.try_get("owner_id")?,
    })
}

fn chunk_from_row(row: &PgRow) -> Result<Chunk> {
    let metadata: Value = row.try_get("metadata")?;
    let metadata: ChunkMetadata = serde_json::from_value(metadata)?;
    let embedding: Option<Vector> = row.try_get("embedding_1024")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        indexing_run_id: row.try_get("indexing_run_id")?,
        ordinal: row.try_get::<i32, _>("ordinal")? as u32,
        content: row.try_get("content")?,
        metadata,
        embedding: embedding.map(|v| v.as_slice().to_vec()),
    })
}

fn stage_result_from_row(row: &PgRow) -> Result<StageResult> {
    let summary: Value = row.try_get("summary_stats")?;
    let summary_stats = match summary {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    let data: Option<Value> = row.try_get("data")?;
    let data = data.map(serde_json::from_value).transpose()?;
    Ok(StageResult {
        run_id: row.try_get("run_id")?,
        document_id: row.try_get("document_id")?,
        stage: enum_from_str(row.try_get::<String, _>("stage_name")?.as_str(), "stage name")?,
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str(), "stage status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        summary_stats,
        sample_outputs: row.try_get("sample_outputs")?,
        config_hash: row.try_get("config_hash")?,
        data,
        error_message: row.try_get("error_message")?,
    })
}

fn wiki_run_from_row(row: &PgRow) -> Result<WikiRun> {
    let pages: Value = row.try_get("pages_metadata")?;
    Ok(WikiRun {
        id: row.try_get("id")?,
        indexing_run_id: row.try_get("indexing_run_id")?,
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str(), "run status")?,
        storage_prefix: row.try_get("storage_prefix")?,
        pages_metadata: serde_json::from_value(pages)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn checklist_run_from_row(row: &PgRow) -> Result<ChecklistRun> {
    Ok(ChecklistRun {
        id: row.try_get("id")?,
        indexing_run_id: row.try_get("indexing_run_id")?,
        checklist_content: row.try_get("checklist_content")?,
        model_name: row.try_get("model_name")?,
        access_level: enum_from_str(row.try_get::<String, _>("access_level")?.as_str(), "access level")?,
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str(), "run status")?,
        progress_current: row.try_get::<i32, _>("progress_current")? as u32,
        progress_total: row.try_get::<i32, _>("progress_total")? as u32,
        raw_analysis: row.try_get("raw_analysis")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DataStore for PgDataStore {
    async fn create_indexing_run(&self, run: &IndexingRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexing_runs \
             (id, access_level, upload_kind, user_id, project_id, status, started_at, completed_at, config_snapshot, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(run.id)
        .bind(enum_to_str(&run.access_level))
        .bind(enum_to_str(&run.upload_kind))
        .bind(run.user_id)
        .bind(run.project_id)
        .bind(enum_to_str(&run.status))
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.config_snapshot)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_indexing_run(&self, id: Uuid) -> Result<Option<IndexingRun>> {
        let row = sqlx::query("SELECT * FROM indexing_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(indexing_run_from_row).transpose()
    }

    async fn update_indexing_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let terminal = matches!(
            status,
            RunStatus::Completed | RunStatus::CompletedWithWarnings | RunStatus::Failed
        );
        sqlx::query(
            "UPDATE indexing_runs SET \
             status = $2, \
             started_at = CASE WHEN $3 AND started_at IS NULL THEN now() ELSE started_at END, \
             completed_at = CASE WHEN $4 THEN now() ELSE completed_at END, \
             error_message = COALESCE($5, error_message) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(enum_to_str(&status))
        .bind(status == RunStatus::Running)
        .bind(terminal)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_indexing_run(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM stage_results WHERE run_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM indexing_runs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        // documents referenced by no remaining run
        sqlx::query(
            "DELETE FROM documents d WHERE NOT EXISTS \
             (SELECT 1 FROM indexing_run_documents l WHERE l.document_id = d.id)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (id, filename, blob_key, page_count, byte_size, owner_id) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
             filename = EXCLUDED.filename, blob_key = EXCLUDED.blob_key, \
             page_count = EXCLUDED.page_count, byte_size = EXCLUDED.byte_size",
        )
        .bind(document.id)
        .bind(&document.filename)
        .bind(&document.blob_key)
        .bind(document.page_count.map(|n| n as i32))
        .bind(document.byte_size as i64)
        .bind(document.owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_document_to_run(&self, run_id: Uuid, document_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexing_run_documents (indexing_run_id, document_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(run_id)
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn documents_for_run(&self, run_id: Uuid) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT d.* FROM documents d \
             JOIN indexing_run_documents l ON l.document_id = d.id \
             WHERE l.indexing_run_id = $1 ORDER BY d.filename",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn update_document_page_count(&self, document_id: Uuid, page_count: u32) -> Result<()> {
        sqlx::query("UPDATE documents SET page_count = $2 WHERE id = $1")
            .bind(document_id)
            .bind(page_count as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_chunks_for_document(&self, run_id: Uuid, document_id: Uuid) -> Result<()> {
        sqlx::query(
            "DELETE FROM document_chunks WHERE indexing_run_id = $1 AND document_id = $2",
        )
        .bind(run_id)
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO document_chunks \
                 (id, document_id, indexing_run_id, ordinal, content, metadata, embedding_1024) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (indexing_run_id, document_id, ordinal) DO UPDATE SET \
                 content = EXCLUDED.content, metadata = EXCLUDED.metadata, \
                 embedding_1024 = EXCLUDED.embedding_1024",
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.indexing_run_id)
            .bind(chunk.ordinal as i32)
            .bind(&chunk.content)
            .bind(serde_json::to_value(&chunk.metadata)?)
            .bind(chunk.embedding.clone().map(Vector::from))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_chunk_embeddings(&self, updates: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, embedding) in updates {
            sqlx::query("UPDATE document_chunks SET embedding_1024 = $2 WHERE id = $1")
                .bind(id)
                .bind(Vector::from(embedding.clone()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn chunks_for_run(&self, run_id: Uuid, embedded_only: bool) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM document_chunks WHERE indexing_run_id = $1 \
             AND ($2 = false OR embedding_1024 IS NOT NULL) \
             ORDER BY document_id, ordinal",
        )
        .bind(run_id)
        .bind(embedded_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn match_chunks(
        &self,
        embedding: &[f32],
        threshold: f32,
        match_count: usize,
        indexing_run_id: Option<Uuid>,
    ) -> Result<Vec<ChunkMatch>> {
        let query_vector = Vector::from(embedding.to_vec());
        let rows = sqlx::query(
            "SELECT id, document_id, indexing_run_id, content, metadata, embedding_1024 \
             FROM document_chunks \
             WHERE embedding_1024 IS NOT NULL \
             AND ($3::uuid IS NULL OR indexing_run_id = $3) \
             AND 1 - (embedding_1024 <=> $1) >= $2 \
             ORDER BY embedding_1024 <=> $1 \
             LIMIT $4",
        )
        .bind(&query_vector)
        .bind(threshold)
        .bind(indexing_run_id)
        .bind(match_count as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let chunk = chunk_from_row(row)?;
                Ok(ChunkMatch {
                    id: chunk.id,
                    document_id: chunk.document_id,
                    indexing_run_id: chunk.indexing_run_id,
                    content: chunk.content,
                    metadata: chunk.metadata,
                    embedding: chunk.embedding,
                })
            })
            .collect()
    }

    async fn upsert_stage_result(&self, result: &StageResult) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM stage_results WHERE run_id = $1 AND stage_name = $2 \
             AND document_id IS NOT DISTINCT FROM $3",
        )
        .bind(result.run_id)
        .bind(result.stage.as_str())
        .bind(result.document_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO stage_results \
             (run_id, document_id, stage_name, status, started_at, completed_at, \
              duration_seconds, summary_stats, sample_outputs, config_hash, data, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(result.run_id)
        .bind(result.document_id)
        .bind(result.stage.as_str())
        .bind(enum_to_str(&result.status))
        .bind(result.started_at)
        .bind(result.completed_at)
        .bind(result.duration_seconds)
        .bind(Value::Object(result.summary_stats.clone()))
        .bind(&result.sample_outputs)
        .bind(&result.config_hash)
        .bind(result.data.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&result.error_message)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_stage_result(
        &self,
        run_id: Uuid,
        document_id: Option<Uuid>,
        stage: Stage,
    ) -> Result<Option<StageResult>> {
        let row = sqlx::query(
            "SELECT * FROM stage_results WHERE run_id = $1 AND stage_name = $2 \
             AND document_id IS NOT DISTINCT FROM $3",
        )
        .bind(run_id)
        .bind(stage.as_str())
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stage_result_from_row).transpose()
    }

    async fn stage_results_for_run(&self, run_id: Uuid) -> Result<Vec<StageResult>> {
        let rows = sqlx::query("SELECT * FROM stage_results WHERE run_id = $1")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stage_result_from_row).collect()
    }

    async fn create_wiki_run(&self, run: &WikiRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO wiki_generation_runs \
             (id, indexing_run_id, status, storage_prefix, pages_metadata, error_message, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(run.id)
        .bind(run.indexing_run_id)
        .bind(enum_to_str(&run.status))
        .bind(&run.storage_prefix)
        .bind(serde_json::to_value(&run.pages_metadata)?)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_wiki_run(&self, id: Uuid) -> Result<Option<WikiRun>> {
        let row = sqlx::query("SELECT * FROM wiki_generation_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wiki_run_from_row).transpose()
    }

    async fn update_wiki_run(&self, run: &WikiRun) -> Result<()> {
        sqlx::query(
            "UPDATE wiki_generation_runs SET status = $2, pages_metadata = $3, \
             error_message = $4, completed_at = $5 WHERE id = $1",
        )
        .bind(run.id)
        .bind(enum_to_str(&run.status))
        .bind(serde_json::to_value(&run.pages_metadata)?)
        .bind(&run.error_message)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_checklist_run(&self, run: &ChecklistRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO checklist_analysis_runs \
             (id, indexing_run_id, checklist_content, model_name, access_level, status, \
              progress_current, progress_total, raw_analysis, error_message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(run.id)
        .bind(run.indexing_run_id)
        .bind(&run.checklist_content)
        .bind(&run.model_name)
        .bind(enum_to_str(&run.access_level))
        .bind(enum_to_str(&run.status))
        .bind(run.progress_current as i32)
        .bind(run.progress_total as i32)
        .bind(&run.raw_analysis)
        .bind(&run.error_message)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_checklist_run(&self, id: Uuid) -> Result<Option<ChecklistRun>> {
        let row = sqlx::query("SELECT * FROM checklist_analysis_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checklist_run_from_row).transpose()
    }

    async fn update_checklist_run(&self, run: &ChecklistRun) -> Result<()> {
        sqlx::query(
            "UPDATE checklist_analysis_runs SET status = $2, progress_current = $3, \
             progress_total = $4, raw_analysis = $5, error_message = $6 WHERE id = $1",
        )
        .bind(run.id)
        .bind(enum_to_str(&run.status))
        .bind(run.progress_current as i32)
        .bind(run.progress_total as i32)
        .bind(&run.raw_analysis)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_checklist_results(
        &self,
        run_id: Uuid,
        results: &[ChecklistResult],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checklist_results WHERE analysis_run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        for result in results {
            sqlx::query(
                "INSERT INTO checklist_results \
                 (analysis_run_id, item_number, item_name, status, description, confidence, primary_source, sources) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(run_id)
            .bind(&result.item_number)
            .bind(&result.item_name)
            .bind(enum_to_str(&result.status))
            .bind(&result.description)
            .bind(result.confidence)
            .bind(result.primary_source.as_ref().map(serde_json::to_value).transpose()?)
            .bind(serde_json::to_value(&result.sources)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn checklist_results_for_run(&self, run_id: Uuid) -> Result<Vec<ChecklistResult>> {
        let rows = sqlx::query(
            "SELECT * FROM checklist_results WHERE analysis_run_id = $1 ORDER BY item_number",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let primary: Option<Value> = row.try_get("primary_source")?;
                let sources: Value = row.try_get("sources")?;
                Ok(ChecklistResult {
                    item_number: row.try_get("item_number")?,
                    item_name: row.try_get("item_name")?,
                    status: enum_from_str(
                        row.try_get::<String, _>("status")?.as_str(),
                        "checklist status",
                    )?,
                    description: row.try_get("description")?,
                    confidence: row.try_get("confidence")?,
                    primary_source: primary.map(serde_json::from_value).transpose()?,
                    sources: serde_json::from_value(sources)?,
                })
            })
            .collect()
    }
}

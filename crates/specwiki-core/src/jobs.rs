//! Job dispatch: one entry point for all three pipelines.
//!
//! A job descriptor names the pipeline kind, the run id and the effective
//! config. The orchestrator initializes the right pipeline, drives it under
//! the job's cancellation token, and fires the completion webhook. Webhook
//! trouble never fails the job itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checklist::ChecklistOrchestrator;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::indexing::IndexingOrchestrator;
use crate::models::RunStatus;
use crate::services::{
    ChatClient, EmbeddingClient, PartitionClient, RateLimiters, VlmClient,
};
use crate::store::{DataStore, ObjectStore};
use crate::wiki::WikiOrchestrator;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Indexing,
    Wiki,
    Checklist,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Indexing => "indexing",
            JobKind::Wiki => "wiki",
            JobKind::Checklist => "checklist",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub api_key: Option<String>,
}

/// One pipeline invocation
#[derive(Clone)]
pub struct JobDescriptor {
    pub kind: JobKind,
    /// Indexing-run id for indexing/wiki jobs, checklist-run id for
    /// checklist jobs
    pub run_id: Uuid,
    pub config: PipelineConfig,
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub kind: JobKind,
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// Holds every collaborator once; builds a pipeline per job.
pub struct Orchestrator {
    store: Arc<dyn DataStore>,
    objects: Arc<dyn ObjectStore>,
    partition_client: Arc<dyn PartitionClient>,
    vlm: Arc<dyn VlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    chat: Arc<dyn ChatClient>,
    limiters: RateLimiters,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DataStore>,
        objects: Arc<dyn ObjectStore>,
        partition_client: Arc<dyn PartitionClient>,
        vlm: Arc<dyn VlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        chat: Arc<dyn ChatClient>,
        limiters: RateLimiters,
    ) -> Self {
        Self {
            store,
            objects,
            partition_client,
            vlm,
            embedder,
            chat,
            limiters,
            http: reqwest::Client::new(),
        }
    }

    /// Execute a job to its terminal status and dispatch the webhook.
    pub async fn execute(
        &self,
        job: JobDescriptor,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        tracing::info!(kind = %job.kind, run = %job.run_id, "Dispatching job");

        let result = match job.kind {
            JobKind::Indexing => {
                let pipeline = IndexingOrchestrator::new(
                    self.store.clone(),
                    self.objects.clone(),
                    self.partition_client.clone(),
                    self.vlm.clone(),
                    self.embedder.clone(),
                    self.limiters.clone(),
                    job.config.clone(),
                );
                pipeline.run(job.run_id, cancel).await
            }
            JobKind::Wiki => {
                let pipeline = WikiOrchestrator::new(
                    self.store.clone(),
                    self.objects.clone(),
                    self.chat.clone(),
                    self.embedder.clone(),
                    self.limiters.clone(),
                    job.config.clone(),
                );
                pipeline.run(job.run_id, cancel).await.map(|run| run.status)
            }
            JobKind::Checklist => {
                let pipeline = ChecklistOrchestrator::new(
                    self.store.clone(),
                    self.chat.clone(),
                    self.embedder.clone(),
                    self.limiters.clone(),
                    job.config.clone(),
                );
                pipeline
                    .run(job.run_id, cancel)
                    .await
                    .map(|_| RunStatus::Completed)
            }
        };

        let status = match &result {
            Ok(status) => *status,
            Err(_) => RunStatus::Failed,
        };
        let outcome = JobOutcome {
            kind: job.kind,
            run_id: job.run_id,
            status,
        };

        if let Some(webhook) = &job.webhook {
            self.dispatch_webhook(webhook, &outcome).await;
        }

        result.map(|status| JobOutcome {
            kind: job.kind,
            run_id: job.run_id,
            status,
        })
    }

    async fn dispatch_webhook(&self, webhook: &WebhookConfig, outcome: &JobOutcome) {
        let payload = webhook_payload(outcome);
        let mut request = self
            .http
            .post(&webhook.url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&payload);
        if let Some(api_key) = &webhook.api_key {
            request = request.header("X-API-Key", api_key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(url = %webhook.url, "Completion webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    url = %webhook.url,
                    status = %response.status(),
                    "Completion webhook rejected"
                );
            }
            Err(e) => {
                tracing::warn!(url = %webhook.url, error = %e, "Completion webhook failed");
            }
        }
    }
}

fn webhook_payload(outcome: &JobOutcome) -> serde_json::Value {
    json!({
        "job_kind": outcome.kind,
        "run_id": outcome.run_id,
        "status": outcome.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::config::OcrStrategy;
    use crate::models::{AccessLevel, Document, IndexingRun, UploadKind};
    use crate::pdf::test_support::create_multipage_pdf;
    use crate::services::{
        MockChatClient, MockEmbeddingClient, MockPartitionClient, MockVlmClient,
    };
    use crate::store::{source_pdf_key, MemoryDataStore, MemoryObjectStore, ObjectStore as _};

    fn orchestrator(
        store: Arc<MemoryDataStore>,
        objects: Arc<MemoryObjectStore>,
    ) -> Orchestrator {
        Orchestrator::new(
            store,
            objects,
            Arc::new(MockPartitionClient::new()),
            Arc::new(MockVlmClient::new()),
            Arc::new(MockEmbeddingClient::new(8)),
            Arc::new(MockChatClient::new()),
            RateLimiters::default(),
        )
    }

    #[tokio::test]
    async fn dispatches_indexing_jobs() {
        let store = Arc::new(MemoryDataStore::new());
        let objects = Arc::new(MemoryObjectStore::new());

        let mut config = PipelineConfig::default();
        config.indexing.partition.ocr_strategy = OcrStrategy::Fast;
        config.indexing.embedding.dimensions = 8;

        let run = IndexingRun::new(
            AccessLevel::Private,
            UploadKind::UserProject,
            config.snapshot(),
        );
        store.create_indexing_run(&run).await.unwrap();
        let doc_id = Uuid::new_v4();
        let blob_key = source_pdf_key(run.id, doc_id);
        objects
            .put(
                &blob_key,
                Bytes::from(create_multipage_pdf(&["Indexing job content."])),
                "application/pdf",
            )
            .await
            .unwrap();
        store
            .upsert_document(&Document {
                id: doc_id,
                filename: "a.pdf".into(),
                blob_key,
                page_count: None,
                byte_size: 100,
                owner_id: None,
            })
            .await
            .unwrap();
        store.link_document_to_run(run.id, doc_id).await.unwrap();

        let outcome = orchestrator(store, objects)
            .execute(
                JobDescriptor {
                    kind: JobKind::Indexing,
                    run_id: run.id,
                    config,
                    webhook: None,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.kind, JobKind::Indexing);
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn wiki_job_on_unfinished_run_errors() {
        let store = Arc::new(MemoryDataStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let run = IndexingRun::new(
            AccessLevel::Private,
            UploadKind::UserProject,
            serde_json::json!({}),
        );
        store.create_indexing_run(&run).await.unwrap();

        let result = orchestrator(store, objects)
            .execute(
                JobDescriptor {
                    kind: JobKind::Wiki,
                    run_id: run.id,
                    config: PipelineConfig::default(),
                    webhook: None,
                },
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn webhook_payload_shape() {
        let outcome = JobOutcome {
            kind: JobKind::Indexing,
            run_id: Uuid::nil(),
            status: RunStatus::CompletedWithWarnings,
        };
        let payload = webhook_payload(&outcome);
        assert_eq!(payload["job_kind"], "indexing");
        assert_eq!(payload["status"], "completed_with_warnings");
        assert_eq!(payload["run_id"], Uuid::nil().to_string());
    }
}

//! SpecWiki Core - pipelines for a construction-document knowledge base
//!
//! This crate contains all the core functionality for SpecWiki, including:
//! - Indexing pipeline (partition, metadata, enrichment, chunking, embedding)
//! - Retrieval core (pgvector/HNSW search with scan fallback)
//! - Wiki generation pipeline (overview, clustering, structure, markdown)
//! - Checklist compliance analysis
//! - Answer service for natural-language queries
//! - Service adapters for the partitioner, VLM, embedder and chat LLM

pub mod checklist;
pub mod config;
pub mod error;
pub mod indexing;
pub mod jobs;
pub mod json_repair;
pub mod models;
pub mod pdf;
pub mod query;
pub mod retrieval;
pub mod services;
pub mod store;
pub mod wiki;

pub use checklist::ChecklistOrchestrator;
pub use config::PipelineConfig;
pub use error::{CoreError, Result};
pub use indexing::{IndexingOrchestrator, ProgressTracker, RunProgress};
pub use jobs::{JobDescriptor, JobKind, JobOutcome, Orchestrator, WebhookConfig};
pub use models::{
    Chunk, ChunkMetadata, Document, IndexingRun, RunStatus, Stage, StageData, StageResult,
    WikiRun,
};
pub use query::{QueryAnswer, QueryService};
pub use retrieval::{RetrievalCore, RetrievedChunk, SearchRequest};
pub use services::{
    ChatClient, EmbeddingClient, OpenRouterChatClient, OpenRouterVlmClient, PartitionClient,
    RateLimiters, UnstructuredPartitionClient, VlmClient, VoyageEmbeddingClient,
};
pub use store::{DataStore, FsObjectStore, MemoryDataStore, ObjectStore, PgDataStore};
pub use wiki::WikiOrchestrator;

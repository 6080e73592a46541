//! Wiki stage 3: semantic clustering of the corpus.
//!
//! Plain k-means over chunk embeddings with deterministic seeding (evenly
//! spaced initial centroids), so reruns cluster identically. Each cluster is
//! named by the chat model from its three centroid-nearest exemplars, with a
//! fixed fallback list when the model call fails.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::ClusteringConfig;
use crate::error::{CoreError, Result};
use crate::models::{Chunk, ClusterSummary, ClusteringOutput};
use crate::retrieval::similarity::cosine_similarity;
use crate::services::ChatRunner;

const KMEANS_ITERATIONS: usize = 20;
const EXEMPLARS_PER_CLUSTER: usize = 3;

/// Deterministic names used when the chat model cannot name a cluster
const FALLBACK_NAMES: &[&str] = &[
    "Technical Specifications",
    "Project Documentation",
    "Safety & Compliance",
    "Installation Details",
    "Materials & Products",
    "Schedule & Milestones",
    "Quality Assurance",
    "Site Conditions",
    "Contracts & Tendering",
    "Drawings & Plans",
];

pub async fn cluster_corpus(
    chat: &ChatRunner<'_>,
    chunks: &[Chunk],
    config: &ClusteringConfig,
    language: &str,
) -> Result<ClusteringOutput> {
    let embedded: Vec<&Chunk> = chunks.iter().filter(|c| c.embedding.is_some()).collect();
    if embedded.is_empty() {
        return Ok(ClusteringOutput {
            clusters: BTreeMap::new(),
            cluster_summaries: vec![],
            n_clusters: 0,
        });
    }

    let k = (embedded.len() / 20).clamp(config.min_clusters, config.max_clusters);
    let k = k.min(embedded.len());

    let vectors: Vec<Vec<f32>> = embedded
        .iter()
        .map(|c| c.embedding.clone().expect("filtered"))
        .collect();

    let assignments = tokio::task::spawn_blocking({
        let vectors = vectors.clone();
        move || kmeans(&vectors, k)
    })
    .await
    .map_err(|e| CoreError::Internal(anyhow::anyhow!("clustering task panicked: {e}")))?;

    // exemplars: the chunks nearest their cluster centroid
    let centroids = compute_centroids(&vectors, &assignments, k);
    let mut clusters: BTreeMap<Uuid, usize> = BTreeMap::new();
    for (idx, chunk) in embedded.iter().enumerate() {
        clusters.insert(chunk.id, assignments[idx]);
    }

    let mut cluster_summaries = Vec::with_capacity(k);
    for cluster_id in 0..k {
        let mut members: Vec<(usize, f32)> = assignments
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == cluster_id)
            .map(|(idx, _)| {
                (
                    idx,
                    cosine_similarity(&vectors[idx], &centroids[cluster_id]),
                )
            })
            .collect();
        members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let exemplars: Vec<&str> = members
            .iter()
            .take(EXEMPLARS_PER_CLUSTER)
            .map(|(idx, _)| embedded[*idx].content.as_str())
            .collect();

        let cluster_name = match name_cluster(chat, &exemplars, language).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(cluster = cluster_id, error = %e, "Cluster naming failed, using fallback");
                FALLBACK_NAMES
                    .get(cluster_id)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("Cluster {cluster_id}"))
            }
        };

        cluster_summaries.push(ClusterSummary {
            cluster_id,
            cluster_name,
            chunk_count: members.len(),
        });
    }

    tracing::info!(
        chunks = embedded.len(),
        k,
        "Clustered corpus"
    );

    Ok(ClusteringOutput {
        clusters,
        cluster_summaries,
        n_clusters: k,
    })
}

async fn name_cluster(
    chat: &ChatRunner<'_>,
    exemplars: &[&str],
    language: &str,
) -> Result<String> {
    let samples: Vec<String> = exemplars
        .iter()
        .map(|e| e.chars().take(300).collect())
        .collect();
    let prompt = format!(
        "These text excerpts come from one thematic cluster of a construction project's \
         documents:\n\n{}\n\nName the cluster with a short topic label (2-5 words) in {}. \
         Reply with the label only.",
        samples.join("\n---\n"),
        language
    );
    let name = chat.run(&prompt, 50).await?;
    Ok(name.trim().trim_matches('"').to_string())
}

/// k-means with deterministic evenly spaced seeding.
fn kmeans(vectors: &[Vec<f32>], k: usize) -> Vec<usize> {
    let n = vectors.len();
    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| vectors[i * n / k].clone()).collect();
    let mut assignments = vec![0usize; n];

    for _ in 0..KMEANS_ITERATIONS {
        let mut changed = false;
        for (idx, vector) in vectors.iter().enumerate() {
            let best = (0..k)
                .max_by(|a, b| {
                    cosine_similarity(vector, &centroids[*a])
                        .partial_cmp(&cosine_similarity(vector, &centroids[*b]))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0);
            if assignments[idx] != best {
                assignments[idx] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        centroids = compute_centroids(vectors, &assignments, k);
    }
    assignments
}

fn compute_centroids(vectors: &[Vec<f32>], assignments: &[usize], k: usize) -> Vec<Vec<f32>> {
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    let mut sums = vec![vec![0.0f32; dims]; k];
    let mut counts = vec![0usize; k];
    for (vector, &cluster) in vectors.iter().zip(assignments.iter()) {
        counts[cluster] += 1;
        for (i, value) in vector.iter().enumerate() {
            sums[cluster][i] += value;
        }
    }
    for (cluster, sum) in sums.iter_mut().enumerate() {
        let count = counts[cluster].max(1) as f32;
        for value in sum.iter_mut() {
            *value /= count;
        }
    }
    sums
}

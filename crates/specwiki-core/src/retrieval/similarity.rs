//! Similarity math, threshold banding and content deduplication.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;

/// Cosine similarity of two vectors.
///
/// Mismatched dimensions score 0.0 with a warning rather than erroring;
/// zero-magnitude vectors likewise score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        tracing::warn!(
            len_a = a.len(),
            len_b = b.len(),
            "Vector dimension mismatch in similarity computation"
        );
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Quality band of a similarity score under a language's thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

pub fn quality_band(score: f32, thresholds: &Thresholds) -> QualityBand {
    if score >= thresholds.excellent {
        QualityBand::Excellent
    } else if score >= thresholds.good {
        QualityBand::Good
    } else if score >= thresholds.acceptable {
        QualityBand::Acceptable
    } else {
        QualityBand::Poor
    }
}

/// Key used to deduplicate near-identical chunks: hash of the first 100
/// characters of content.
pub fn content_dedupe_key(content: &str) -> u64 {
    let prefix: String = content.chars().take(100).collect();
    let hash = blake3::hash(prefix.as_bytes());
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("8 bytes"))
}

/// Drop items whose content prefix was already seen, preserving order.
pub fn deduplicate_by_content<T, F>(items: Vec<T>, content_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(content_dedupe_key(content_of(item))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.3, 0.5, 0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn dimension_mismatch_scores_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn zero_vector_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn banding_danish() {
        let t = Thresholds::danish();
        assert_eq!(quality_band(0.75, &t), QualityBand::Excellent);
        assert_eq!(quality_band(0.62, &t), QualityBand::Good);
        assert_eq!(quality_band(0.40, &t), QualityBand::Acceptable);
        assert_eq!(quality_band(0.19, &t), QualityBand::Poor);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let long_a = format!("{}tail-one", "x".repeat(100));
        let long_b = format!("{}tail-two", "x".repeat(100));
        let items = vec!["alpha".to_string(), long_a.clone(), long_b, "alpha".into()];
        let deduped = deduplicate_by_content(items, |s| s.as_str());
        // the two long strings share their first 100 chars; "alpha" repeats
        assert_eq!(deduped, vec!["alpha".to_string(), long_a]);
    }
}

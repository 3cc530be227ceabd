//! Cosine similarity and top-k ranking.
//!
//! Ranking is brute force: O(candidates × dimensions) per query. That is fine
//! for the hundreds to low thousands of chunks in a single-device corpus and
//! is the scaling ceiling of the store.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("Dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("Similarity search cancelled")]
    Cancelled,
}

/// Cosine similarity of two equal-length vectors.
///
/// Returns 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch { left: a.len(), right: b.len() });
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// A candidate's position in the input and its score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub position: usize,
    pub score: f32,
}

/// Score every candidate against `query`, keep scores >= `threshold`, and
/// return the best `k` in descending order. Equal scores keep input order.
pub fn top_k<'a, I>(
    query: &[f32],
    candidates: I,
    k: usize,
    threshold: f32,
    cancel: &CancellationToken,
) -> Result<Vec<Scored>, SimilarityError>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut scored = Vec::new();

    for (position, candidate) in candidates.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(SimilarityError::Cancelled);
        }
        let score = cosine_similarity(query, candidate)?;
        if score >= threshold {
            scored.push(Scored { position, score });
        }
    }

    // sort_by is stable, so ties stay in storage order
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}

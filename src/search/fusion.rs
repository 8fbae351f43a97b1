//! Result fusion across modalities.
//!
//! Each modality's raw scores are rescaled to `[0, 1]` over its own
//! candidate set before weighting:
//!
//! - text relevance and vector similarity are divided by the set maximum;
//! - distances are min-max rescaled into a proximity where the nearest
//!   candidate scores 1.0.
//!
//! A set with one member, or where every member has the same raw value,
//! normalises to 1.0 throughout. The fused score is the weighted sum plus
//! `multi_match_bonus` for every modality the identity appears in.

use std::collections::HashMap;

use serde::Serialize;

use super::query::Modalities;
use crate::config::{FusionConfig, SearchConfig};
use crate::types::LocationId;
use crate::vector::Score;

/// Raw per-modality hits, each in the order its index returned them.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub text: Option<Vec<(LocationId, f32)>>,
    pub vector: Option<Vec<(LocationId, Score)>>,
    pub location: Option<Vec<(LocationId, f64)>>,
}

impl Candidates {
    /// Hits before deduplication.
    pub fn total(&self) -> usize {
        self.text.as_ref().map_or(0, Vec::len)
            + self.vector.as_ref().map_or(0, Vec::len)
            + self.location.as_ref().map_or(0, Vec::len)
    }
}

/// One deduplicated identity with its fused score and raw signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub id: LocationId,
    pub score: f32,
    pub matched: Modalities,
    pub text_score: Option<f32>,
    pub similarity: Option<f32>,
    pub distance_km: Option<f64>,
}

impl FusedHit {
    fn new(id: LocationId) -> Self {
        Self {
            id,
            score: 0.0,
            matched: Modalities::empty(),
            text_score: None,
            similarity: None,
            distance_km: None,
        }
    }
}

/// Candidates to request from each index for a page ending at `offset + limit`.
#[must_use]
pub fn candidate_limit(limit: usize, offset: usize, config: &SearchConfig) -> usize {
    limit
        .saturating_add(offset)
        .saturating_mul(config.candidate_multiplier)
        .max(config.min_candidates)
}

/// Unions the candidate sets and ranks them by fused score.
///
/// Ordered by score descending, ties by identity ascending.
pub fn fuse(candidates: &Candidates, weights: &FusionConfig) -> Vec<FusedHit> {
    let mut hits: HashMap<LocationId, FusedHit> = HashMap::new();

    if let Some(text) = &candidates.text {
        let scores: Vec<f32> = text.iter().map(|(_, s)| *s).collect();
        for ((id, raw), norm) in text.iter().zip(normalize_by_max(&scores)) {
            let hit = hits.entry(*id).or_insert_with(|| FusedHit::new(*id));
            if hit.matched.contains(Modalities::TEXT) {
                continue;
            }
            hit.matched |= Modalities::TEXT;
            hit.text_score = Some(*raw);
            hit.score += weights.text_weight * norm + weights.multi_match_bonus;
        }
    }

    if let Some(vector) = &candidates.vector {
        let scores: Vec<f32> = vector.iter().map(|(_, s)| s.get()).collect();
        for ((id, raw), norm) in vector.iter().zip(normalize_by_max(&scores)) {
            let hit = hits.entry(*id).or_insert_with(|| FusedHit::new(*id));
            if hit.matched.contains(Modalities::VECTOR) {
                continue;
            }
            hit.matched |= Modalities::VECTOR;
            hit.similarity = Some(raw.get());
            hit.score += weights.vector_weight * norm + weights.multi_match_bonus;
        }
    }

    if let Some(location) = &candidates.location {
        let distances: Vec<f64> = location.iter().map(|(_, d)| *d).collect();
        for ((id, distance), proximity) in location.iter().zip(proximity(&distances)) {
            let hit = hits.entry(*id).or_insert_with(|| FusedHit::new(*id));
            if hit.matched.contains(Modalities::LOCATION) {
                continue;
            }
            hit.matched |= Modalities::LOCATION;
            hit.distance_km = Some(*distance);
            hit.score += weights.location_weight * proximity + weights.multi_match_bonus;
        }
    }

    let mut fused: Vec<FusedHit> = hits.into_values().collect();
    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    fused
}

/// Scores divided by the set maximum. Non-positive maxima yield 1.0.
fn normalize_by_max(scores: &[f32]) -> Vec<f32> {
    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !(max > 0.0) {
        return vec![1.0; scores.len()];
    }
    scores
        .iter()
        .map(|s| if s.is_finite() { (s / max).clamp(0.0, 1.0) } else { 0.0 })
        .collect()
}

/// Distances rescaled so the nearest is 1.0 and the farthest 0.0.
fn proximity(distances: &[f64]) -> Vec<f32> {
    let (min, max) = distances
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| {
            (lo.min(*d), hi.max(*d))
        });
    let span = max - min;
    if !(span > 0.0) {
        return vec![1.0; distances.len()];
    }
    distances
        .iter()
        .map(|d| ((max - d) / span).clamp(0.0, 1.0) as f32)
        .collect()
}

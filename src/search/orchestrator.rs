//! Fans a unified query out to the enabled indices and assembles the page.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use super::fusion::{Candidates, FusedHit, candidate_limit, fuse};
use super::query::{Modalities, Modality, UnifiedQuery};
use crate::config::{FusionConfig, SearchConfig};
use crate::error::{GeoError, GeoResult};
use crate::spatial::SpatialIndex;
use crate::store::{RecordStore, StoreError};
use crate::text::TextIndex;
use crate::types::{LocationId, LocationRecord};
use crate::vector::{Embedder, Score, VectorIndex};

/// A ranked, hydrated result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: LocationId,
    /// Fused score; only comparable within one response.
    pub score: f32,
    /// Distance to the query coordinate when one was given.
    pub distance_km: Option<f64>,
    pub text_score: Option<f32>,
    pub similarity: Option<f32>,
    pub matched: Vec<Modality>,
    pub record: LocationRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnifiedSearchResponse {
    pub results: Vec<SearchResult>,
    pub modalities_used: Vec<Modality>,
    pub candidate_counts: BTreeMap<Modality, usize>,
    pub total_before_dedup: usize,
    /// Distinct identities across all modalities.
    pub total_candidates: usize,
    pub elapsed_ms: f64,
}

/// Borrowed view of everything a query touches.
pub struct QueryOrchestrator<'a> {
    pub store: &'a RecordStore,
    pub spatial: &'a SpatialIndex,
    pub text: &'a TextIndex,
    pub vector: &'a VectorIndex,
    pub embedder: &'a Embedder,
    pub search: &'a SearchConfig,
    pub fusion: &'a FusionConfig,
}

impl QueryOrchestrator<'_> {
    pub fn execute(&self, query: &UnifiedQuery) -> GeoResult<UnifiedSearchResponse> {
        let started = Instant::now();
        query.validate(self.search)?;

        let wanted = candidate_limit(query.limit, query.offset, self.search);
        let candidates = self.collect(query, wanted)?;

        let mut candidate_counts = BTreeMap::new();
        if let Some(hits) = &candidates.text {
            candidate_counts.insert(Modality::Text, hits.len());
        }
        if let Some(hits) = &candidates.vector {
            candidate_counts.insert(Modality::Vector, hits.len());
        }
        if let Some(hits) = &candidates.location {
            candidate_counts.insert(Modality::Location, hits.len());
        }

        let fused = fuse(&candidates, self.fusion);
        let total_candidates = fused.len();
        let results = self.hydrate(query, fused)?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(
            "unified search: {} results from {total_candidates} candidates in {elapsed_ms:.2} ms",
            results.len()
        );

        Ok(UnifiedSearchResponse {
            results,
            modalities_used: query.modalities.each(),
            candidate_counts,
            total_before_dedup: candidates.total(),
            total_candidates,
            elapsed_ms,
        })
    }

    /// Queries the enabled indices in parallel.
    fn collect(&self, query: &UnifiedQuery, wanted: usize) -> GeoResult<Candidates> {
        let text_query = query.query_text().unwrap_or_default();

        let (text, (vector, location)) = rayon::join(
            || -> GeoResult<Option<Vec<(LocationId, f32)>>> {
                if !query.modalities.contains(Modalities::TEXT) {
                    return Ok(None);
                }
                Ok(Some(self.text.search(text_query, wanted)?))
            },
            || {
                rayon::join(
                    || -> GeoResult<Option<Vec<(LocationId, Score)>>> {
                        if !query.modalities.contains(Modalities::VECTOR) {
                            return Ok(None);
                        }
                        let embedding =
                            self.embedder.embed_query(text_query).map_err(|e| {
                                GeoError::EmbeddingFailed {
                                    reason: e.to_string(),
                                }
                            })?;
                        Ok(Some(self.vector.search(
                            &embedding,
                            query.similarity_threshold,
                            wanted,
                        )?))
                    },
                    || -> Option<Vec<(LocationId, f64)>> {
                        if !query.modalities.contains(Modalities::LOCATION) {
                            return None;
                        }
                        let filter = query.location?;
                        Some(self.spatial.query_radius(filter.center, filter.radius_km, wanted))
                    },
                )
            },
        );

        Ok(Candidates {
            text: text?,
            vector: vector?,
            location,
        })
    }

    /// Pages through the fused list, loading records from the store.
    ///
    /// Identities deleted since the index answered are skipped.
    fn hydrate(&self, query: &UnifiedQuery, fused: Vec<FusedHit>) -> GeoResult<Vec<SearchResult>> {
        let mut results = Vec::with_capacity(query.limit);
        for hit in fused.into_iter().skip(query.offset) {
            if results.len() == query.limit {
                break;
            }
            let record = match self.store.get(hit.id) {
                Ok(record) => record,
                Err(StoreError::NotFound(id)) => {
                    tracing::debug!("unified search: skipping {id}, no longer active");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let distance_km = hit.distance_km.or_else(|| {
                query
                    .location
                    .map(|filter| filter.center.distance_km(&record.coordinate))
            });

            results.push(SearchResult {
                id: hit.id,
                score: hit.score,
                distance_km,
                text_score: hit.text_score,
                similarity: hit.similarity,
                matched: hit.matched.each(),
                record,
            });
        }
        Ok(results)
    }
}

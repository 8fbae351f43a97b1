//! Bulk record creation with per-item outcomes.

use std::time::Instant;

use serde::Serialize;

use super::Pipeline;
use crate::config::IngestConfig;
use crate::error::{GeoError, GeoResult};
use crate::store::NewRecord;
use crate::types::{LocationId, LocationRecord, NewLocation, ValidatedLocation};

/// Result of one item of a bulk request, keyed by its position in the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Created {
        index: usize,
        id: LocationId,
        /// Set when the record was stored without a vector.
        #[serde(skip_serializing_if = "Option::is_none")]
        embedding_failure: Option<String>,
    },
    Failed {
        index: usize,
        code: String,
        reason: String,
    },
}

impl ItemOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Created { index, .. } | Self::Failed { index, .. } => *index,
        }
    }

    pub fn id(&self) -> Option<LocationId> {
        match self {
            Self::Created { id, .. } => Some(*id),
            Self::Failed { .. } => None,
        }
    }

    fn failed(index: usize, err: &GeoError) -> Self {
        Self::Failed {
            index,
            code: err.status_code(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    /// One outcome per request item, in request order.
    pub items: Vec<ItemOutcome>,
    pub success_count: usize,
    pub failed_count: usize,
    /// Created without a vector because embedding failed.
    pub degraded_count: usize,
    pub total_count: usize,
    pub elapsed_ms: f64,
}

impl BulkOutcome {
    pub fn created_ids(&self) -> Vec<LocationId> {
        self.items.iter().filter_map(ItemOutcome::id).collect()
    }
}

/// Creates `locations`, reporting each item's outcome.
///
/// The request as a whole is rejected only when it is empty or larger than
/// `max_bulk`. Invalid items fail individually. Valid items are processed in
/// sub-batches of `batch_size`: one embedding call per sub-batch, then one
/// store commit per record and one index fan-out per sub-batch. If the
/// embedding call fails, the sub-batch is stored without vectors.
pub fn bulk_create(
    pipeline: &Pipeline<'_>,
    config: &IngestConfig,
    locations: &[NewLocation],
) -> GeoResult<BulkOutcome> {
    let started = Instant::now();

    if locations.is_empty() {
        return Err(GeoError::Validation {
            field: "locations".to_string(),
            reason: "at least one location is required".to_string(),
        });
    }
    if locations.len() > config.max_bulk {
        return Err(GeoError::CapacityExceeded {
            what: "bulk request size",
            requested: locations.len().to_string(),
            limit: config.max_bulk.to_string(),
        });
    }

    let mut items = Vec::with_capacity(locations.len());
    let mut valid: Vec<(usize, ValidatedLocation)> = Vec::with_capacity(locations.len());
    for (index, location) in locations.iter().enumerate() {
        match location.validate() {
            Ok(validated) => valid.push((index, validated)),
            Err(e) => {
                tracing::debug!("bulk create: item {index} rejected: {e}");
                items.push(ItemOutcome::failed(index, &e));
            }
        }
    }

    for chunk in valid.chunks(config.batch_size.max(1)) {
        items.extend(create_chunk(pipeline, chunk));
    }
    items.sort_by_key(ItemOutcome::index);

    let success_count = items.iter().filter(|i| i.id().is_some()).count();
    let degraded_count = items
        .iter()
        .filter(|i| {
            matches!(
                i,
                ItemOutcome::Created {
                    embedding_failure: Some(_),
                    ..
                }
            )
        })
        .count();
    let outcome = BulkOutcome {
        success_count,
        failed_count: items.len() - success_count,
        degraded_count,
        total_count: locations.len(),
        items,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    };

    tracing::info!(
        "bulk create: {}/{} created ({} without vectors) in {:.1} ms",
        outcome.success_count,
        outcome.total_count,
        outcome.degraded_count,
        outcome.elapsed_ms
    );
    Ok(outcome)
}

fn create_chunk(pipeline: &Pipeline<'_>, chunk: &[(usize, ValidatedLocation)]) -> Vec<ItemOutcome> {
    let texts: Vec<String> = chunk.iter().map(|(_, l)| l.embedding_text()).collect();
    let embeddings: Vec<(Option<Vec<f32>>, Option<String>)> =
        match pipeline.embedder.embed_passages(&texts) {
            Ok(vectors) => vectors.into_iter().map(|v| (Some(v), None)).collect(),
            Err(e) => {
                tracing::warn!(
                    "bulk create: embedding failed for {} records, storing without vectors: {e}",
                    chunk.len()
                );
                let reason = e.to_string();
                vec![(None, Some(reason)); chunk.len()]
            }
        };

    let mut outcomes = Vec::with_capacity(chunk.len());
    let mut created: Vec<LocationRecord> = Vec::with_capacity(chunk.len());
    for ((index, location), (embedding, embedding_failure)) in chunk.iter().zip(embeddings) {
        let new = NewRecord {
            location: location.clone(),
            embedding,
            embedding_failure,
        };
        match pipeline.store.put(new) {
            Ok(record) => {
                outcomes.push(ItemOutcome::Created {
                    index: *index,
                    id: record.id,
                    embedding_failure: record.embedding_failure.clone(),
                });
                created.push(record);
            }
            Err(e) => {
                let err = GeoError::from(e);
                tracing::warn!("bulk create: item {index} not stored: {err}");
                outcomes.push(ItemOutcome::failed(*index, &err));
            }
        }
    }

    pipeline.fan_out(&created);
    pipeline.checkpoint_if_due();
    outcomes
}

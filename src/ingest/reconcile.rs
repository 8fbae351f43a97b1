//! Repairs index entries from the Record Store.
//!
//! The store is the source of truth. For every active record each index
//! must hold a matching entry; for every identity an index holds, the store
//! must have an active record. Missing or outdated entries are re-derived
//! from the record, orphans are evicted. Embeddings are recomputed only for
//! records that have none. A pass that finds nothing to do changes nothing,
//! so running it twice in a row repairs nothing the second time.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::Serialize;

use super::{IndexKind, Pipeline};
use crate::error::GeoError;
use crate::types::{LocationId, LocationRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Active records checked.
    pub scanned: usize,
    /// Identities that were flagged stale before the pass.
    pub stale_drained: usize,
    pub spatial_repairs: usize,
    pub text_repairs: usize,
    pub vector_repairs: usize,
    /// Index entries without an active record.
    pub orphans_evicted: usize,
    pub embeddings_recomputed: usize,
    /// Records still without a vector after this pass.
    pub embedding_failures: usize,
    pub elapsed_ms: f64,
}

impl ReconcileReport {
    #[must_use]
    pub fn total_repairs(&self) -> usize {
        self.spatial_repairs + self.text_repairs + self.vector_repairs + self.orphans_evicted
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.total_repairs() == 0 && self.embeddings_recomputed == 0
    }
}

/// Runs one reconciliation pass.
///
/// Records are re-checked under their identity lock, so the pass can run
/// alongside regular writes.
pub fn reconcile(pipeline: &Pipeline<'_>, embed_batch_size: usize) -> ReconcileReport {
    let started = Instant::now();
    let mut report = ReconcileReport {
        stale_drained: pipeline.stale.drain().len(),
        ..ReconcileReport::default()
    };

    let missing: Vec<LocationRecord> = pipeline
        .store
        .scan(|r| r.is_active() && r.embedding.is_none())
        .collect();
    for chunk in missing.chunks(embed_batch_size.max(1)) {
        recompute_embeddings(pipeline, chunk, &mut report);
    }

    let mut active = BTreeSet::new();
    for record in pipeline.store.scan(LocationRecord::is_active) {
        let _guard = pipeline.locks.lock(record.id);
        // Re-read under the lock; the scan copy may be outdated
        let Ok(record) = pipeline.store.get(record.id) else {
            continue;
        };
        active.insert(record.id);
        report.scanned += 1;
        repair_record(pipeline, &record, &mut report);
        if record.embedding.is_none() {
            report.embedding_failures += 1;
        }
    }

    evict_orphans(pipeline, &active, &mut report);

    report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    if report.total_repairs() > 0 || report.embeddings_recomputed > 0 {
        tracing::info!(
            "reconcile: {} records, {} spatial / {} text / {} vector repairs, {} orphans evicted, {} embeddings recomputed",
            report.scanned,
            report.spatial_repairs,
            report.text_repairs,
            report.vector_repairs,
            report.orphans_evicted,
            report.embeddings_recomputed
        );
    } else {
        tracing::debug!("reconcile: {} records consistent", report.scanned);
    }
    if report.embedding_failures > 0 {
        tracing::warn!(
            "reconcile: {} records remain without vectors",
            report.embedding_failures
        );
    }
    pipeline.checkpoint_if_due();
    report
}

fn recompute_embeddings(
    pipeline: &Pipeline<'_>,
    records: &[LocationRecord],
    report: &mut ReconcileReport,
) {
    let texts: Vec<String> = records.iter().map(LocationRecord::embedding_text).collect();
    let embeddings = match pipeline.embedder.embed_passages(&texts) {
        Ok(embeddings) => embeddings,
        Err(e) => {
            // Leave the records untouched so a failing model does not churn revisions
            tracing::warn!(
                "reconcile: embedding retry failed for {} records: {e}",
                records.len()
            );
            return;
        }
    };

    for (record, embedding) in records.iter().zip(embeddings) {
        let _guard = pipeline.locks.lock(record.id);
        let current = match pipeline.store.get(record.id) {
            Ok(current) => current,
            Err(_) => continue,
        };
        // Changed since the scan; its own write path owns the embedding
        if current.revision != record.revision {
            continue;
        }
        match pipeline.store.update(record.id, |r| {
            r.embedding = Some(embedding);
            r.embedding_failure = None;
        }) {
            Ok(_) => report.embeddings_recomputed += 1,
            Err(e) => tracing::warn!("reconcile: could not store embedding for {}: {e}", record.id),
        }
    }
}

fn repair_record(pipeline: &Pipeline<'_>, record: &LocationRecord, report: &mut ReconcileReport) {
    if !pipeline.spatial.matches(record.id, &record.coordinate) {
        log_inconsistency(record.id, IndexKind::SPATIAL, "entry missing or at another coordinate");
        pipeline.spatial.insert(record.id, record.coordinate);
        report.spatial_repairs += 1;
    }

    if !pipeline.text.matches(record.id, record.revision) {
        log_inconsistency(record.id, IndexKind::TEXT, "entry missing or outdated");
        match pipeline.text.index(record) {
            Ok(()) => report.text_repairs += 1,
            Err(e) => {
                tracing::warn!("reconcile: text repair of {} failed: {e}", record.id);
                pipeline.stale.mark(record.id, IndexKind::TEXT);
            }
        }
    }

    match &record.embedding {
        Some(embedding) if !pipeline.vector.matches(record.id, embedding) => {
            log_inconsistency(record.id, IndexKind::VECTOR, "vector missing or outdated");
            match pipeline.vector.add(record.id, embedding) {
                Ok(()) => report.vector_repairs += 1,
                Err(e) => {
                    tracing::warn!("reconcile: vector repair of {} failed: {e}", record.id);
                    pipeline.stale.mark(record.id, IndexKind::VECTOR);
                }
            }
        }
        None if pipeline.vector.contains(record.id) => {
            log_inconsistency(record.id, IndexKind::VECTOR, "vector held for a record without one");
            match pipeline.vector.remove(record.id) {
                Ok(_) => report.vector_repairs += 1,
                Err(e) => {
                    tracing::warn!("reconcile: vector eviction of {} failed: {e}", record.id);
                    pipeline.stale.mark(record.id, IndexKind::VECTOR);
                }
            }
        }
        _ => {}
    }
}

fn evict_orphans(pipeline: &Pipeline<'_>, active: &BTreeSet<LocationId>, report: &mut ReconcileReport) {
    let mut held: BTreeSet<LocationId> = BTreeSet::new();
    held.extend(pipeline.spatial.ids());
    held.extend(pipeline.text.ids());
    held.extend(pipeline.vector.ids());

    for id in held.difference(active) {
        let _guard = pipeline.locks.lock(*id);
        // Created after the scan started
        if pipeline.store.get(*id).is_ok() {
            continue;
        }
        let mut evicted = false;
        if pipeline.spatial.remove(*id) {
            evicted = true;
        }
        match pipeline.text.remove(*id) {
            Ok(removed) => evicted |= removed,
            Err(e) => tracing::warn!("reconcile: text eviction of {id} failed: {e}"),
        }
        match pipeline.vector.remove(*id) {
            Ok(removed) => evicted |= removed,
            Err(e) => tracing::warn!("reconcile: vector eviction of {id} failed: {e}"),
        }
        if evicted {
            log_inconsistency(*id, IndexKind::all(), "entry for a deleted or unknown record");
            report.orphans_evicted += 1;
        }
    }
}

fn log_inconsistency(id: LocationId, kind: IndexKind, reason: &str) {
    let err = GeoError::IndexInconsistency {
        id,
        index: kind.label(),
        reason: reason.to_string(),
    };
    tracing::warn!("reconcile: {err}; repaired");
}

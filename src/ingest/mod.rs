//! Writes from the Record Store into the three indices.
//!
//! The store commits first; [`Pipeline`] then fans the committed records out
//! to the spatial, text and vector indices. A failing index does not undo
//! the commit: the identity is flagged in the [`StaleSet`] and the next
//! reconciliation pass repairs it.

mod bulk;
mod reconcile;
mod stale;

pub use bulk::{BulkOutcome, ItemOutcome, bulk_create};
pub use reconcile::{ReconcileReport, reconcile};
pub use stale::{IndexKind, StaleSet};

use crate::spatial::SpatialIndex;
use crate::store::{IdentityLocks, RecordStore};
use crate::text::TextIndex;
use crate::types::{LocationId, LocationRecord};
use crate::vector::{Embedder, VectorIndex};

/// Borrowed handles to the store, the indices and their bookkeeping.
#[derive(Clone, Copy)]
pub struct Pipeline<'a> {
    pub store: &'a RecordStore,
    pub spatial: &'a SpatialIndex,
    pub text: &'a TextIndex,
    pub vector: &'a VectorIndex,
    pub embedder: &'a Embedder,
    pub locks: &'a IdentityLocks,
    pub stale: &'a StaleSet,
}

impl Pipeline<'_> {
    /// Indexes freshly committed records under their identity locks.
    ///
    /// Records changed or deleted between the commit and the lock are left
    /// to whoever changed them.
    pub fn fan_out(&self, records: &[LocationRecord]) {
        if records.is_empty() {
            return;
        }
        let _guards = self.locks.lock_many(records.iter().map(|r| r.id));
        let current: Vec<LocationRecord> = records
            .iter()
            .filter(|r| {
                self.store
                    .get(r.id)
                    .is_ok_and(|stored| stored.revision == r.revision)
            })
            .cloned()
            .collect();
        self.index_locked(&current);
    }

    /// Indexes `records`. The caller holds their identity locks.
    pub fn index_locked(&self, records: &[LocationRecord]) {
        if records.is_empty() {
            return;
        }

        let points: Vec<_> = records.iter().map(|r| (r.id, r.coordinate)).collect();
        self.spatial.insert_batch(&points);

        if let Err(e) = self.text.index_batch(records) {
            tracing::warn!(
                "text index: failed to index {} records, marked stale: {e}",
                records.len()
            );
            for record in records {
                self.stale.mark(record.id, IndexKind::TEXT);
            }
        }

        let mut vectors = Vec::with_capacity(records.len());
        for record in records {
            match &record.embedding {
                Some(embedding) => vectors.push((record.id, embedding.clone())),
                // A re-embedded update without a vector must not keep the old one
                None => self.evict_vector(record.id),
            }
        }
        for (id, e) in self.vector.add_batch(&vectors) {
            tracing::warn!("vector index: failed to add {id}, marked stale: {e}");
            self.stale.mark(id, IndexKind::VECTOR);
        }
    }

    /// Removes `id` from every index. The caller holds its identity lock.
    pub fn evict_locked(&self, id: LocationId) {
        self.spatial.remove(id);
        if let Err(e) = self.text.remove(id) {
            tracing::warn!("text index: failed to remove {id}, marked stale: {e}");
            self.stale.mark(id, IndexKind::TEXT);
        }
        self.evict_vector(id);
    }

    /// Writes a vector checkpoint when the operation counter says so.
    ///
    /// Failures are logged; the previous checkpoint stays valid.
    pub fn checkpoint_if_due(&self) {
        if let Err(e) = self.vector.maybe_checkpoint() {
            tracing::warn!("vector index: automatic checkpoint failed: {e}");
        }
    }

    fn evict_vector(&self, id: LocationId) {
        if let Err(e) = self.vector.remove(id) {
            tracing::warn!("vector index: failed to remove {id}, marked stale: {e}");
            self.stale.mark(id, IndexKind::VECTOR);
        }
    }
}

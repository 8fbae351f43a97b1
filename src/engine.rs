//! Engine facade: the operations the CLI (or any transport) calls.
//!
//! # Write path
//! Validate, embed, commit to the Record Store, then fan out to the spatial,
//! text and vector indices under the identity's lock. Index failures after
//! the commit are flagged stale rather than returned.
//!
//! # Start-up
//! Open the store, hydrate the vector index from its checkpoint, rebuild the
//! spatial and text indices from the store and reconcile.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Settings;
use crate::error::{GeoError, GeoResult};
use crate::ingest::{
    self, BulkOutcome, IndexKind, Pipeline, ReconcileReport, StaleSet,
};
use crate::search::{QueryOrchestrator, UnifiedQuery, UnifiedSearchResponse};
use crate::spatial::SpatialIndex;
use crate::store::{IdentityLocks, NewRecord, RecordStore};
use crate::text::TextIndex;
use crate::types::{LocationId, LocationPatch, LocationRecord, NewLocation};
use crate::vector::{
    Embedder, EmbeddingGenerator, VectorDimension, VectorIndex, VectorIndexConfig,
    VectorIndexStats, VectorMode,
};

/// Records committed to the text index per commit while rebuilding.
const REBUILD_CHUNK: usize = 1000;

/// Populations and modes reported by [`GeoTagEngine::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_locations: usize,
    pub total_embeddings: usize,
    /// Active records stored without a vector.
    pub degraded_locations: usize,
    pub embedding_model: String,
    pub index_type: VectorMode,
    pub spatial_entries: usize,
    pub text_entries: usize,
    pub stale_entries: usize,
    pub pending_log_entries: usize,
    pub vector: VectorIndexStats,
}

pub struct GeoTagEngine {
    settings: Arc<Settings>,
    store: RecordStore,
    spatial: SpatialIndex,
    text: TextIndex,
    vector: VectorIndex,
    embedder: Embedder,
    locks: IdentityLocks,
    stale: StaleSet,
}

impl std::fmt::Debug for GeoTagEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTagEngine")
            .field("data_dir", &self.store.data_dir())
            .field("records", &self.store.len())
            .field("embedder", &self.embedder)
            .finish()
    }
}

impl GeoTagEngine {
    /// Opens the engine on `settings.data_dir`.
    ///
    /// A checkpoint that cannot be used (other dimension, corrupted) is
    /// discarded with a warning; reconciliation rebuilds the vectors from
    /// the embeddings held by the store.
    pub fn open(settings: Settings, generator: Arc<dyn EmbeddingGenerator>) -> GeoResult<Self> {
        settings.validate()?;
        let dimension = checked_dimension(&settings, generator.as_ref())?;

        let store = RecordStore::open(&settings.data_dir)?;

        let config = VectorIndexConfig::from_settings(
            &settings.vector,
            dimension,
            Some(settings.checkpoint_path()),
        );
        let vector = match VectorIndex::open(config.clone()) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(
                    "vector index: discarding checkpoint {}: {e}",
                    settings.checkpoint_path().display()
                );
                VectorIndex::new(config)
            }
        };

        Self::assemble(settings, store, vector, generator)
    }

    /// An engine that keeps everything in memory.
    pub fn in_memory(settings: Settings, generator: Arc<dyn EmbeddingGenerator>) -> GeoResult<Self> {
        settings.validate()?;
        let dimension = checked_dimension(&settings, generator.as_ref())?;
        let vector = VectorIndex::new(VectorIndexConfig::from_settings(
            &settings.vector,
            dimension,
            None,
        ));
        Self::assemble(settings, RecordStore::in_memory(), vector, generator)
    }

    fn assemble(
        settings: Settings,
        store: RecordStore,
        vector: VectorIndex,
        generator: Arc<dyn EmbeddingGenerator>,
    ) -> GeoResult<Self> {
        let embedder = Embedder::new(generator, &settings.embedding);
        let engine = Self {
            spatial: SpatialIndex::new(settings.spatial.cell_size_degrees),
            text: TextIndex::new(&settings.text)?,
            settings: Arc::new(settings),
            store,
            vector,
            embedder,
            locks: IdentityLocks::default(),
            stale: StaleSet::new(),
        };

        engine.rebuild_derived_indices()?;
        let report = engine.reconcile();
        tracing::info!(
            "engine: ready with {} locations ({} vectors, {} repairs at start-up)",
            engine.store.active_count(),
            engine.vector.len(),
            report.total_repairs()
        );
        Ok(engine)
    }

    /// Loads spatial and text entries for every active record.
    fn rebuild_derived_indices(&self) -> GeoResult<()> {
        let records: Vec<LocationRecord> = self.store.scan(LocationRecord::is_active).collect();
        let points: Vec<_> = records.iter().map(|r| (r.id, r.coordinate)).collect();
        self.spatial.insert_batch(&points);
        for chunk in records.chunks(REBUILD_CHUNK) {
            self.text.index_batch(chunk)?;
        }
        tracing::debug!("engine: rebuilt spatial and text indices over {} records", records.len());
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.store.data_dir()
    }

    /// Creates one record.
    ///
    /// If embedding fails the record is still created, without a vector; the
    /// failure is recorded on the record and retried by reconciliation.
    pub fn create(&self, location: NewLocation) -> GeoResult<LocationRecord> {
        let location = location.validate()?;
        let (embedding, embedding_failure) = self.embed_one(location.embedding_text());

        let record = self.store.put(NewRecord {
            location,
            embedding,
            embedding_failure,
        })?;

        let pipeline = self.pipeline();
        pipeline.fan_out(std::slice::from_ref(&record));
        pipeline.checkpoint_if_due();
        Ok(record)
    }

    pub fn get(&self, id: LocationId) -> GeoResult<LocationRecord> {
        Ok(self.store.get(id)?)
    }

    /// Applies `patch` to the record `id` and re-indexes it.
    ///
    /// The embedding is recomputed only when the description or tags change.
    /// An empty patch returns the record unchanged.
    pub fn update(&self, id: LocationId, patch: &LocationPatch) -> GeoResult<LocationRecord> {
        let _guard = self.locks.lock(id);
        let current = self.store.get(id)?;
        if patch.is_empty() {
            return Ok(current);
        }

        let next = patch.apply_to(&current)?;
        let (embedding, embedding_failure) =
            if patch.touches_text() && next.embedding_text() != current.embedding_text() {
                self.embed_one(next.embedding_text())
            } else {
                (current.embedding.clone(), current.embedding_failure.clone())
            };

        let record = self.store.update(id, move |r| {
            r.coordinate = next.coordinate;
            r.tags = next.tags;
            r.description = next.description;
            r.embedding = embedding;
            r.embedding_failure = embedding_failure;
        })?;

        let pipeline = self.pipeline();
        pipeline.index_locked(std::slice::from_ref(&record));
        pipeline.checkpoint_if_due();
        Ok(record)
    }

    /// Deletes `id`. The identity is never reused.
    pub fn delete(&self, id: LocationId) -> GeoResult<()> {
        let _guard = self.locks.lock(id);
        self.store.delete(id)?;

        let pipeline = self.pipeline();
        pipeline.evict_locked(id);
        pipeline.checkpoint_if_due();
        Ok(())
    }

    /// Active records, newest first.
    pub fn list(&self, offset: usize, limit: usize) -> Vec<LocationRecord> {
        self.store.list(offset, limit)
    }

    pub fn bulk_create(&self, locations: &[NewLocation]) -> GeoResult<BulkOutcome> {
        ingest::bulk_create(&self.pipeline(), &self.settings.ingest, locations)
    }

    pub fn search(&self, query: &UnifiedQuery) -> GeoResult<UnifiedSearchResponse> {
        QueryOrchestrator {
            store: &self.store,
            spatial: &self.spatial,
            text: &self.text,
            vector: &self.vector,
            embedder: &self.embedder,
            search: &self.settings.search,
            fusion: &self.settings.fusion,
        }
        .execute(query)
    }

    pub fn reconcile(&self) -> ReconcileReport {
        ingest::reconcile(&self.pipeline(), self.settings.embedding.batch_size)
    }

    /// Active records whose index entries disagree with the store.
    ///
    /// A record without a vector counts only when no embedding failure is
    /// recorded for it. Read-only; see [`GeoTagEngine::reconcile`] to repair.
    pub fn verify_consistency(&self) -> Vec<(LocationId, IndexKind)> {
        let mut problems = Vec::new();
        for record in self.store.scan(LocationRecord::is_active) {
            let mut kinds = IndexKind::empty();
            if !self.spatial.matches(record.id, &record.coordinate) {
                kinds |= IndexKind::SPATIAL;
            }
            if !self.text.matches(record.id, record.revision) {
                kinds |= IndexKind::TEXT;
            }
            let vector_ok = match &record.embedding {
                Some(embedding) => self.vector.matches(record.id, embedding),
                None => record.embedding_failure.is_some() && !self.vector.contains(record.id),
            };
            if !vector_ok {
                kinds |= IndexKind::VECTOR;
            }
            if !kinds.is_empty() {
                problems.push((record.id, kinds));
            }
        }
        problems
    }

    pub fn stats(&self) -> EngineStats {
        let vector = self.vector.stats();
        EngineStats {
            total_locations: self.store.active_count(),
            total_embeddings: self.vector.len(),
            degraded_locations: self
                .store
                .scan(|r| r.is_active() && r.embedding.is_none())
                .count(),
            embedding_model: self.embedder.model_name().to_string(),
            index_type: vector.mode,
            spatial_entries: self.spatial.len(),
            text_entries: self.text.len(),
            stale_entries: self.stale.len(),
            pending_log_entries: self.store.pending_log_entries(),
            vector,
        }
    }

    /// Writes a vector checkpoint now.
    pub fn checkpoint(&self) -> GeoResult<()> {
        Ok(self.vector.checkpoint()?)
    }

    /// Re-partitions the vector index, dropping tombstones, then checkpoints.
    pub fn rebuild_vector_index(&self) -> GeoResult<()> {
        self.vector.build()?;
        self.checkpoint()
    }

    /// Folds the store's log into a fresh snapshot.
    pub fn compact_store(&self) -> GeoResult<()> {
        Ok(self.store.compact()?)
    }

    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            store: &self.store,
            spatial: &self.spatial,
            text: &self.text,
            vector: &self.vector,
            embedder: &self.embedder,
            locks: &self.locks,
            stale: &self.stale,
        }
    }

    fn embed_one(&self, text: String) -> (Option<Vec<f32>>, Option<String>) {
        match self.embedder.embed_passages(&[text]) {
            Ok(mut embeddings) => (embeddings.pop(), None),
            Err(e) => {
                let err = GeoError::EmbeddingFailed {
                    reason: e.to_string(),
                };
                tracing::warn!("engine: storing record without a vector: {err}");
                (None, Some(e.to_string()))
            }
        }
    }
}

fn checked_dimension(
    settings: &Settings,
    generator: &dyn EmbeddingGenerator,
) -> GeoResult<VectorDimension> {
    let dimension = generator.dimension();
    if dimension.get() != settings.embedding.dimension {
        return Err(GeoError::Config {
            reason: format!(
                "embedding.dimension is {} but model '{}' produces {}",
                settings.embedding.dimension,
                generator.model_name(),
                dimension.get()
            ),
        });
    }
    Ok(dimension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Modalities;
    use crate::types::Coordinate;
    use crate::vector::HashingEmbedder;
    use tempfile::TempDir;

    fn settings(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.data_dir = dir.to_path_buf();
        settings.embedding.model = "hashing".to_string();
        settings.embedding.dimension = 64;
        settings
    }

    fn generator() -> Arc<dyn EmbeddingGenerator> {
        Arc::new(HashingEmbedder::new(VectorDimension::new(64).unwrap()))
    }

    fn cafe() -> NewLocation {
        NewLocation::new(37.5665, 126.9780)
            .with_description("Cozy cafe near City Hall")
            .with_tags(["Cafe", "coffee", " "])
    }

    #[test]
    fn test_crud_keeps_indices_consistent() {
        let temp = TempDir::new().unwrap();
        let engine = GeoTagEngine::open(settings(temp.path()), generator()).unwrap();

        let created = engine.create(cafe()).unwrap();
        assert_eq!(created.tags, vec!["cafe", "coffee"]);
        assert!(created.embedding.is_some());
        assert!(engine.verify_consistency().is_empty());

        let patch = LocationPatch {
            description: Some("Rooftop bar".to_string()),
            ..LocationPatch::default()
        };
        let updated = engine.update(created.id, &patch).unwrap();
        assert_eq!(updated.revision, created.revision + 1);
        assert_ne!(updated.embedding, created.embedding);
        assert!(engine.verify_consistency().is_empty());

        engine.delete(created.id).unwrap();
        assert!(matches!(engine.get(created.id), Err(GeoError::NotFound { .. })));
        assert!(matches!(engine.delete(created.id), Err(GeoError::NotFound { .. })));
        assert_eq!(engine.stats().total_locations, 0);

        let next = engine.create(cafe()).unwrap();
        assert!(next.id > created.id);
    }

    #[test]
    fn test_coordinate_only_update_keeps_embedding() {
        let engine = GeoTagEngine::in_memory(settings(Path::new("unused")), generator()).unwrap();
        let created = engine.create(cafe()).unwrap();

        let patch = LocationPatch {
            latitude: Some(35.1796),
            longitude: Some(129.0756),
            ..LocationPatch::default()
        };
        let moved = engine.update(created.id, &patch).unwrap();
        assert_eq!(moved.embedding, created.embedding);

        let query = UnifiedQuery::default()
            .with_location(Coordinate::new(35.1796, 129.0756).unwrap(), 1.0)
            .with_modalities(Modalities::LOCATION);
        let response = engine.search(&query).unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, created.id);
    }

    #[test]
    fn test_invalid_create_has_no_effect() {
        let engine = GeoTagEngine::in_memory(settings(Path::new("unused")), generator()).unwrap();
        let err = engine.create(NewLocation::new(91.0, 0.0)).unwrap_err();
        assert_eq!(err.status_code(), "VALIDATION_ERROR");
        assert!(engine.list(0, 10).is_empty());
        assert_eq!(engine.stats().spatial_entries, 0);
    }

    #[test]
    fn test_dimension_mismatch_is_a_config_error() {
        let mut settings = settings(Path::new("unused"));
        settings.embedding.dimension = 384;
        let err = GeoTagEngine::in_memory(settings, generator()).unwrap_err();
        assert!(matches!(err, GeoError::Config { .. }));
    }

    #[test]
    fn test_reopen_restores_records_and_indices() {
        let temp = TempDir::new().unwrap();
        let id = {
            let engine = GeoTagEngine::open(settings(temp.path()), generator()).unwrap();
            engine.create(cafe()).unwrap().id
        };

        let engine = GeoTagEngine::open(settings(temp.path()), generator()).unwrap();
        assert_eq!(engine.get(id).unwrap().description, "Cozy cafe near City Hall");
        let stats = engine.stats();
        assert_eq!(stats.total_locations, 1);
        assert_eq!(stats.total_embeddings, 1);
        assert_eq!(stats.text_entries, 1);
        assert!(engine.verify_consistency().is_empty());
    }
}

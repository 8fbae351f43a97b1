//! Approximate nearest-neighbour index over record embeddings.
//!
//! The index starts out exhaustive and switches to an IVF-style partitioned
//! layout once it holds `min_train_population` vectors. Both layouts keep the
//! full unit-length vectors, so every returned similarity is an exact cosine
//! and the threshold is enforced identically in either mode. Partitioning only
//! narrows which vectors are looked at.
//!
//! # Concurrency
//!
//! Readers take the state lock shared. `add`/`remove` take the build gate
//! shared and the state lock exclusively for the few microseconds the change
//! takes, so an entry becomes visible atomically. A build takes the gate
//! exclusively: mutations wait, searches keep running against the previous
//! layout until the new one is swapped in under the state write lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::VectorConfig;
use crate::types::LocationId;
use crate::vector::checkpoint::{self, CheckpointEntry, CheckpointPayload};
use crate::vector::clustering::{
    assign_to_nearest_centroid, dot, kmeans_clustering, nearest_partitions, normalize_in_place,
    partition_count,
};
use crate::vector::types::{PartitionId, Score, VectorDimension, VectorError};

/// Element-wise tolerance when comparing a stored vector with a record's embedding.
const MATCH_TOLERANCE: f32 = 1e-4;

/// Tuning knobs of a [`VectorIndex`].
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimension: VectorDimension,
    pub min_train_population: usize,
    pub partitions: usize,
    pub probe: usize,
    pub rebuild_tombstone_ratio: f32,
    pub auto_save_interval: usize,
    /// Where checkpoints go. `None` keeps the index purely in memory.
    pub checkpoint_path: Option<PathBuf>,
}

impl VectorIndexConfig {
    pub fn from_settings(
        config: &VectorConfig,
        dimension: VectorDimension,
        checkpoint_path: Option<PathBuf>,
    ) -> Self {
        Self {
            dimension,
            min_train_population: config.min_train_population,
            partitions: config.partitions,
            probe: config.probe,
            rebuild_tombstone_ratio: config.rebuild_tombstone_ratio,
            auto_save_interval: config.auto_save_interval,
            checkpoint_path,
        }
    }
}

/// Operating mode, reported by [`VectorIndex::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorMode {
    Exhaustive,
    Partitioned,
}

impl std::fmt::Display for VectorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhaustive => write!(f, "exhaustive"),
            Self::Partitioned => write!(f, "partitioned"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorIndexStats {
    pub population: usize,
    pub mode: VectorMode,
    pub partitions: usize,
    pub tombstones: usize,
    pub dimension: usize,
    pub ops_since_checkpoint: usize,
}

#[derive(Debug, Clone)]
enum Layout {
    Exhaustive,
    Partitioned {
        centroids: Vec<Vec<f32>>,
        /// Member ids per partition. May hold tombstoned slots until rebuild.
        lists: Vec<Vec<LocationId>>,
    },
}

#[derive(Debug, Clone)]
struct Slot {
    vector: Vec<f32>,
    /// Partition list currently holding this id, in partitioned mode.
    partition: Option<PartitionId>,
}

#[derive(Debug)]
struct IndexState {
    entries: HashMap<LocationId, Slot>,
    layout: Layout,
    /// Partition-list slots whose id was removed or moved since the last build.
    tombstones: usize,
    /// Population when the current partitions were built.
    built_population: usize,
}

impl IndexState {
    fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            layout: Layout::Exhaustive,
            tombstones: 0,
            built_population: 0,
        }
    }
}

/// The vector index. Shared between threads behind an `Arc`.
#[derive(Debug)]
pub struct VectorIndex {
    config: VectorIndexConfig,
    state: RwLock<IndexState>,
    build_gate: RwLock<()>,
    ops_since_checkpoint: AtomicUsize,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Self {
        Self {
            config,
            state: RwLock::new(IndexState::empty()),
            build_gate: RwLock::new(()),
            ops_since_checkpoint: AtomicUsize::new(0),
        }
    }

    /// Opens the index from its checkpoint, or empty when none exists.
    ///
    /// A checkpoint with a different dimension is an error; the caller
    /// decides whether to discard it.
    pub fn open(config: VectorIndexConfig) -> Result<Self, VectorError> {
        let index = Self::new(config);
        if let Some(path) = index.config.checkpoint_path.clone() {
            if path.exists() {
                index.load_checkpoint(&path)?;
            }
        }
        Ok(index)
    }

    pub fn dimension(&self) -> VectorDimension {
        self.config.dimension
    }

    /// Adds or replaces the vector of `id`.
    pub fn add(&self, id: LocationId, vector: &[f32]) -> Result<(), VectorError> {
        let unit = self.prepare(vector)?;
        let needs_build = {
            let _gate = self.build_gate.read();
            let mut state = self.state.write();
            Self::insert_locked(&mut state, id, unit);
            self.needs_build(&state)
        };
        self.ops_since_checkpoint.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("vector index: added {id}");

        if needs_build {
            self.build()?;
        }
        Ok(())
    }

    /// Adds a batch under a single acquisition of the write lock.
    ///
    /// Items with an unusable vector are skipped and returned with their error.
    pub fn add_batch(&self, items: &[(LocationId, Vec<f32>)]) -> Vec<(LocationId, VectorError)> {
        let mut rejected = Vec::new();
        let mut prepared = Vec::with_capacity(items.len());
        for (id, vector) in items {
            match self.prepare(vector) {
                Ok(unit) => prepared.push((*id, unit)),
                Err(e) => rejected.push((*id, e)),
            }
        }

        let needs_build = {
            let _gate = self.build_gate.read();
            let mut state = self.state.write();
            for (id, unit) in prepared.iter().cloned() {
                Self::insert_locked(&mut state, id, unit);
            }
            self.needs_build(&state)
        };
        self.ops_since_checkpoint
            .fetch_add(prepared.len(), Ordering::Relaxed);

        if needs_build {
            if let Err(e) = self.build() {
                tracing::warn!("vector index: partition build failed, staying in previous mode: {e}");
            }
        }
        rejected
    }

    /// Removes `id`. Returns whether it was present.
    ///
    /// In partitioned mode the id's list slot becomes a tombstone that is
    /// dropped at the next build.
    pub fn remove(&self, id: LocationId) -> Result<bool, VectorError> {
        let (removed, needs_build) = {
            let _gate = self.build_gate.read();
            let mut state = self.state.write();
            let removed = state.entries.remove(&id);
            if let Some(Slot {
                partition: Some(_), ..
            }) = &removed
            {
                state.tombstones += 1;
            }
            (removed.is_some(), self.needs_build(&state))
        };

        if removed {
            self.ops_since_checkpoint.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("vector index: removed {id}");
        }
        if needs_build {
            self.build()?;
        }
        Ok(removed)
    }

    /// Entries with similarity at or above `threshold`, most similar first.
    ///
    /// Ties are broken by ascending id. A query without direction matches nothing.
    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(LocationId, Score)>, VectorError> {
        self.config.dimension.check(query)?;
        let mut unit = query.to_vec();
        if !normalize_in_place(&mut unit) || limit == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let mut hits: Vec<(LocationId, Score)> = match &state.layout {
            Layout::Exhaustive => state
                .entries
                .par_iter()
                .map(|(id, slot)| (*id, Score::from_cosine(dot(&unit, &slot.vector))))
                .filter(|(_, score)| score.meets(threshold))
                .collect(),
            Layout::Partitioned { centroids, lists } => {
                let entries = &state.entries;
                let unit = unit.as_slice();
                let probed = nearest_partitions(unit, centroids, self.config.probe);
                probed
                    .par_iter()
                    .flat_map_iter(|partition| {
                        let partition = *partition;
                        lists[partition.index()].iter().filter_map(move |id| {
                            let slot = entries.get(id)?;
                            // Skip tombstones and ids that moved to another list
                            if slot.partition != Some(partition) {
                                return None;
                            }
                            let score = Score::from_cosine(dot(unit, &slot.vector));
                            score.meets(threshold).then_some((*id, score))
                        })
                    })
                    .collect()
            }
        };
        drop(state);

        hits.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn contains(&self, id: LocationId) -> bool {
        self.state.read().entries.contains_key(&id)
    }

    /// Whether the stored vector for `id` equals `embedding` (after normalisation).
    pub fn matches(&self, id: LocationId, embedding: &[f32]) -> bool {
        let mut unit = embedding.to_vec();
        if !normalize_in_place(&mut unit) {
            return false;
        }
        let state = self.state.read();
        state.entries.get(&id).is_some_and(|slot| {
            slot.vector.len() == unit.len()
                && slot
                    .vector
                    .iter()
                    .zip(&unit)
                    .all(|(a, b)| (a - b).abs() <= MATCH_TOLERANCE)
        })
    }

    pub fn ids(&self) -> Vec<LocationId> {
        let mut ids: Vec<_> = self.state.read().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mode(&self) -> VectorMode {
        match self.state.read().layout {
            Layout::Exhaustive => VectorMode::Exhaustive,
            Layout::Partitioned { .. } => VectorMode::Partitioned,
        }
    }

    pub fn stats(&self) -> VectorIndexStats {
        let state = self.state.read();
        let (mode, partitions) = match &state.layout {
            Layout::Exhaustive => (VectorMode::Exhaustive, 0),
            Layout::Partitioned { centroids, .. } => (VectorMode::Partitioned, centroids.len()),
        };
        VectorIndexStats {
            population: state.entries.len(),
            mode,
            partitions,
            tombstones: state.tombstones,
            dimension: self.config.dimension.get(),
            ops_since_checkpoint: self.ops_since_checkpoint.load(Ordering::Relaxed),
        }
    }

    /// Rebuilds the layout from the current population.
    ///
    /// Below `min_train_population` the index falls back to exhaustive mode.
    /// Holds the build gate exclusively for the whole build.
    pub fn build(&self) -> Result<(), VectorError> {
        let _gate = self.build_gate.write();

        let (ids, vectors): (Vec<LocationId>, Vec<Vec<f32>>) = {
            let state = self.state.read();
            let mut members: Vec<_> = state.entries.iter().collect();
            members.sort_unstable_by_key(|(id, _)| **id);
            members
                .into_iter()
                .map(|(id, slot)| (*id, slot.vector.clone()))
                .unzip()
        };

        let population = ids.len();
        if population < self.config.min_train_population || population == 0 {
            let mut state = self.state.write();
            state.layout = Layout::Exhaustive;
            state.tombstones = 0;
            state.built_population = population;
            for slot in state.entries.values_mut() {
                slot.partition = None;
            }
            tracing::info!("vector index: exhaustive mode ({population} vectors)");
            return Ok(());
        }

        let k = partition_count(population, self.config.partitions);
        let started = std::time::Instant::now();
        let result = kmeans_clustering(&vectors, k)
            .map_err(|e| VectorError::ClusteringFailed(e.to_string()))?;

        let mut lists = vec![Vec::new(); result.centroids.len()];
        for (id, partition) in ids.iter().zip(&result.assignments) {
            lists[partition.index()].push(*id);
        }

        let mut state = self.state.write();
        for (id, partition) in ids.iter().zip(&result.assignments) {
            if let Some(slot) = state.entries.get_mut(id) {
                slot.partition = Some(*partition);
            }
        }
        let partitions = result.centroids.len();
        state.layout = Layout::Partitioned {
            centroids: result.centroids,
            lists,
        };
        state.tombstones = 0;
        state.built_population = population;

        tracing::info!(
            "vector index: built {partitions} partitions over {population} vectors in {:?} ({} iterations)",
            started.elapsed(),
            result.iterations
        );
        Ok(())
    }

    /// Writes a checkpoint if enough mutations accumulated since the last one.
    pub fn maybe_checkpoint(&self) -> Result<bool, VectorError> {
        if self.config.checkpoint_path.is_none()
            || self.ops_since_checkpoint.load(Ordering::Relaxed) < self.config.auto_save_interval
        {
            return Ok(false);
        }
        self.checkpoint()?;
        Ok(true)
    }

    /// Writes a checkpoint now. A no-op for in-memory indices.
    pub fn checkpoint(&self) -> Result<(), VectorError> {
        let Some(path) = &self.config.checkpoint_path else {
            return Ok(());
        };
        // Mutations wait so the payload and the counter reset agree
        let _gate = self.build_gate.write();
        let payload = self.snapshot();
        checkpoint::save(path, self.config.dimension, &payload)?;
        self.ops_since_checkpoint.store(0, Ordering::Relaxed);
        tracing::info!(
            "vector index: checkpoint written to {} ({} vectors)",
            path.display(),
            payload.entries.len()
        );
        Ok(())
    }

    fn snapshot(&self) -> CheckpointPayload {
        let state = self.state.read();
        let mut entries: Vec<CheckpointEntry> = state
            .entries
            .iter()
            .map(|(id, slot)| CheckpointEntry {
                id: *id,
                vector: slot.vector.clone(),
                partition: slot.partition,
            })
            .collect();
        entries.sort_unstable_by_key(|e| e.id);

        let (centroids, lists) = match &state.layout {
            Layout::Exhaustive => (Vec::new(), Vec::new()),
            Layout::Partitioned { centroids, lists } => (centroids.clone(), lists.clone()),
        };

        CheckpointPayload {
            entries,
            partitioned: matches!(state.layout, Layout::Partitioned { .. }),
            centroids,
            lists,
            tombstones: state.tombstones as u64,
            built_population: state.built_population as u64,
        }
    }

    fn load_checkpoint(&self, path: &Path) -> Result<(), VectorError> {
        let payload = checkpoint::load(path, self.config.dimension)?;

        let layout = if payload.partitioned {
            if payload.centroids.len() != payload.lists.len() || payload.centroids.is_empty() {
                return Err(VectorError::Serialization(
                    "partition table does not match centroid count".to_string(),
                ));
            }
            Layout::Partitioned {
                centroids: payload.centroids,
                lists: payload.lists,
            }
        } else {
            Layout::Exhaustive
        };
        let partition_count = match &layout {
            Layout::Partitioned { lists, .. } => lists.len(),
            Layout::Exhaustive => 0,
        };

        let mut entries = HashMap::with_capacity(payload.entries.len());
        for entry in payload.entries {
            self.config.dimension.check(&entry.vector)?;
            let partition = entry
                .partition
                .filter(|p| p.index() < partition_count);
            entries.insert(
                entry.id,
                Slot {
                    vector: entry.vector,
                    partition,
                },
            );
        }

        let population = entries.len();
        *self.state.write() = IndexState {
            entries,
            layout,
            tombstones: payload.tombstones as usize,
            built_population: payload.built_population as usize,
        };
        self.ops_since_checkpoint.store(0, Ordering::Relaxed);
        tracing::info!(
            "vector index: restored {population} vectors from {}",
            path.display()
        );
        Ok(())
    }

    fn prepare(&self, vector: &[f32]) -> Result<Vec<f32>, VectorError> {
        self.config.dimension.check(vector)?;
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::DegenerateVector);
        }
        let mut unit = vector.to_vec();
        if !normalize_in_place(&mut unit) {
            return Err(VectorError::DegenerateVector);
        }
        Ok(unit)
    }

    fn insert_locked(state: &mut IndexState, id: LocationId, unit: Vec<f32>) {
        let previous = state.entries.get(&id).and_then(|slot| slot.partition);

        // A list may still hold a dead slot for this id from an earlier remove or move
        let mut reclaimed = false;
        let partition = match &mut state.layout {
            Layout::Exhaustive => None,
            Layout::Partitioned { centroids, lists } => {
                let partition = assign_to_nearest_centroid(&unit, centroids);
                if previous != Some(partition) {
                    let list = &mut lists[partition.index()];
                    if list.contains(&id) {
                        reclaimed = true;
                    } else {
                        list.push(id);
                    }
                }
                Some(partition)
            }
        };
        if previous.is_some() && previous != partition {
            state.tombstones += 1;
        }
        if reclaimed {
            state.tombstones = state.tombstones.saturating_sub(1);
        }

        state.entries.insert(
            id,
            Slot {
                vector: unit,
                partition,
            },
        );
    }

    fn needs_build(&self, state: &IndexState) -> bool {
        let population = state.entries.len();
        match state.layout {
            Layout::Exhaustive => population >= self.config.min_train_population.max(1),
            Layout::Partitioned { .. } => {
                let tombstone_limit =
                    (population as f32 * self.config.rebuild_tombstone_ratio).max(1.0);
                state.tombstones as f32 > tombstone_limit
                    || population >= state.built_population.saturating_mul(2)
                    || population < self.config.min_train_population
            }
        }
    }
}

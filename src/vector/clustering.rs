//! Spherical k-means used to partition the vector index.
//!
//! Inputs are unit vectors and centroids are re-normalised after every
//! update, so similarity is a plain dot product throughout. Seeding is
//! k-means++ on cosine distance; Lloyd iterations stop when assignments no
//! longer change, when the mean centroid drift drops below
//! `CONVERGENCE_TOLERANCE`, or after `MAX_ITERATIONS`. Assignment runs on
//! the rayon pool.

use rand::Rng;
use rayon::prelude::*;
use thiserror::Error;

use crate::vector::types::PartitionId;

const MAX_ITERATIONS: usize = 50;

/// Mean `1 - cos` movement of the centroids below which iteration stops.
const CONVERGENCE_TOLERANCE: f32 = 1e-4;

/// Norms at or below this have no usable direction.
const EPSILON: f32 = 1e-10;

/// Result of a k-means run.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Unit-length centroids. May hold fewer than `k` entries when the input
    /// has fewer distinct directions than requested partitions.
    pub centroids: Vec<Vec<f32>>,

    /// Partition of each input vector, in input order.
    pub assignments: Vec<PartitionId>,

    pub iterations: usize,
}

#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error("nothing to partition: the vector set is empty")]
    EmptyVectorSet,

    #[error("cannot build {0} partitions; k must lie between 1 and the number of vectors")]
    InvalidPartitionCount(usize),

    #[error("vectors of different lengths cannot be partitioned together")]
    DimensionMismatch,
}

/// Number of partitions to build for `population` vectors.
///
/// Grows with the square root of the population and never exceeds
/// `max_partitions`.
#[must_use]
pub fn partition_count(population: usize, max_partitions: usize) -> usize {
    let root = (population as f64).sqrt().ceil() as usize;
    root.clamp(1, max_partitions.max(1)).min(population.max(1))
}

/// Clusters unit vectors into at most `k` partitions.
pub fn kmeans_clustering(vectors: &[Vec<f32>], k: usize) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }

    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidPartitionCount(k));
    }

    let dimension = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let mut centroids = seed_centroids(vectors, k);
    let mut assignments = assign_all(vectors, &centroids);
    let mut iterations = 1;

    while iterations < MAX_ITERATIONS {
        let new_centroids = update_centroids(vectors, &assignments, centroids.len());
        let movement = mean_drift(&centroids, &new_centroids);
        centroids = new_centroids;

        let new_assignments = assign_all(vectors, &centroids);
        iterations += 1;

        let converged = new_assignments == assignments;
        assignments = new_assignments;

        if converged || movement < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    if iterations >= MAX_ITERATIONS {
        tracing::warn!(
            "k-means did not fully converge after {MAX_ITERATIONS} iterations ({} partitions)",
            centroids.len()
        );
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

fn assign_all(vectors: &[Vec<f32>], centroids: &[Vec<f32>]) -> Vec<PartitionId> {
    vectors
        .par_iter()
        .map(|vector| assign_to_nearest_centroid(vector, centroids))
        .collect()
}

/// Partition whose centroid is most similar to `vector`.
pub fn assign_to_nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> PartitionId {
    let mut best_similarity = f32::NEG_INFINITY;
    let mut best = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let similarity = dot(vector, centroid);
        if similarity > best_similarity {
            best_similarity = similarity;
            best = i;
        }
    }

    PartitionId::new(best as u32)
}

/// The `probe` partitions closest to `query`, most similar first.
pub fn nearest_partitions(query: &[f32], centroids: &[Vec<f32>], probe: usize) -> Vec<PartitionId> {
    let mut ranked: Vec<(usize, f32)> = centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, dot(query, c)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(probe.min(centroids.len()))
        .map(|(i, _)| PartitionId::new(i as u32))
        .collect()
}

fn update_centroids(vectors: &[Vec<f32>], assignments: &[PartitionId], k: usize) -> Vec<Vec<f32>> {
    let dimension = vectors[0].len();
    let mut sums = vec![vec![0.0f32; dimension]; k];
    let mut sizes = vec![0usize; k];

    for (vector, partition) in vectors.iter().zip(assignments) {
        let idx = partition.index();
        for (acc, &value) in sums[idx].iter_mut().zip(vector) {
            *acc += value;
        }
        sizes[idx] += 1;
    }

    let mut rng = rand::rng();
    for (centroid, &size) in sums.iter_mut().zip(&sizes) {
        if size == 0 {
            // Empty partition: reseed from a random member
            let random_idx = rng.random_range(0..vectors.len());
            *centroid = normalized_copy(&vectors[random_idx]);
        } else {
            normalize_in_place(centroid);
        }
    }

    sums
}

/// Cosine similarity of two arbitrary vectors, in `[-1, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let norms = norm(a) * norm(b);
    if norms == 0.0 { 0.0 } else { dot(a, b) / norms }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn seed_centroids(vectors: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
    let mut rng = rand::rng();
    let mut centroids = Vec::with_capacity(k);

    let first_idx = rng.random_range(0..vectors.len());
    centroids.push(normalized_copy(&vectors[first_idx]));

    // Distance of every vector to its nearest chosen centroid
    let mut nearest: Vec<f32> = vectors
        .iter()
        .map(|v| squared_cosine_distance(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = nearest.iter().sum();
        if total < EPSILON {
            // Remaining vectors coincide with chosen centroids
            break;
        }

        let target = rng.random::<f32>() * total;
        let mut cumulative = 0.0;
        let mut chosen = vectors.len() - 1;
        for (i, &distance) in nearest.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target && distance > 0.0 {
                chosen = i;
                break;
            }
        }

        let centroid = normalized_copy(&vectors[chosen]);
        for (slot, vector) in nearest.iter_mut().zip(vectors) {
            *slot = slot.min(squared_cosine_distance(vector, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

fn squared_cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let distance = (1.0 - dot(a, b)).max(0.0);
    distance * distance
}

fn mean_drift(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new)
        .map(|(o, n)| 1.0 - dot(o, n))
        .sum::<f32>()
        / old.len() as f32
}

fn norm(vector: &[f32]) -> f32 {
    dot(vector, vector).sqrt()
}

/// Scales `vector` to unit length. Returns false when it has no direction.
pub fn normalize_in_place(vector: &mut [f32]) -> bool {
    let length = norm(vector);
    if !(length > EPSILON && length.is_finite()) {
        return false;
    }
    vector.iter_mut().for_each(|value| *value /= length);
    true
}

fn normalized_copy(vector: &[f32]) -> Vec<f32> {
    let mut normalized = vector.to_vec();
    normalize_in_place(&mut normalized);
    normalized
}

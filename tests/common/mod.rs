#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use geotag::vector::VectorError;
use geotag::{
    EmbeddingGenerator, GeoTagEngine, HashingEmbedder, NewLocation, Settings, VectorDimension,
};
use tempfile::TempDir;

pub const TEST_DIMENSION: usize = 64;

/// Seoul City Hall, the centre used throughout the tests.
pub const SEOUL: (f64, f64) = (37.5665, 126.9780);

/// Settings for an engine rooted in `dir` with the deterministic embedder.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.data_dir = dir.join("data");
    settings.embedding.model = "hashing".to_string();
    settings.embedding.dimension = TEST_DIMENSION;
    settings.vector.auto_save_interval = 10;
    settings
}

pub fn hashing() -> Arc<dyn EmbeddingGenerator> {
    Arc::new(HashingEmbedder::new(dimension()))
}

pub fn dimension() -> VectorDimension {
    VectorDimension::new(TEST_DIMENSION).expect("valid dimension")
}

/// Creates an engine with an isolated data directory for testing.
pub fn create_test_engine() -> (GeoTagEngine, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let engine = GeoTagEngine::open(test_settings(temp_dir.path()), hashing())
        .expect("Failed to open engine");
    (engine, temp_dir)
}

/// Embedder that can be switched off to simulate a model outage.
pub struct SwitchableEmbedder {
    inner: HashingEmbedder,
    failing: AtomicBool,
}

impl SwitchableEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashingEmbedder::new(dimension()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EmbeddingGenerator for SwitchableEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VectorError::EmbeddingFailed(
                "embedding service unavailable".to_string(),
            ));
        }
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> VectorDimension {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        "switchable-hashing"
    }
}

/// A location `north_km` north and `east_km` east of Seoul City Hall.
pub fn near_seoul(north_km: f64, east_km: f64) -> NewLocation {
    let lat = SEOUL.0 + north_km / 111.195;
    let lon = SEOUL.1 + east_km / (111.195 * SEOUL.0.to_radians().cos());
    NewLocation::new(lat, lon)
}

pub mod sample_places {
    pub const PLACES: &[(&str, &[&str])] = &[
        ("Quiet cafe with single origin coffee", &["cafe", "coffee"]),
        ("Traditional market with street food stalls", &["market", "food"]),
        ("Palace grounds with guided history tours", &["palace", "history"]),
        ("Riverside park for cycling and picnics", &["park", "river"]),
        ("Modern art museum with rotating exhibitions", &["museum", "art"]),
        ("서울 시청 근처의 조용한 카페", &["카페", "커피"]),
        ("Late night ramen shop near the station", &["ramen", "food"]),
        ("Independent bookstore with reading corner", &["books", "reading"]),
    ];
}

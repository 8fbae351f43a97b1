//! Configuration module for the geo-tag search engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `GEOTAG_` and use double underscores
//! to separate nested levels:
//! - `GEOTAG_SEARCH__MAX_RADIUS_KM=50` sets `search.max_radius_km`
//! - `GEOTAG_VECTOR__AUTO_SAVE_INTERVAL=500` sets `vector.auto_save_interval`
//! - `GEOTAG_LOGGING__LEVEL=debug` sets `logging.level`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GeoError, GeoResult};

/// Directory holding the settings file and default data directory.
pub const CONFIG_DIR: &str = ".geotag";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory for the record store and vector checkpoint
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub vector: VectorConfig,

    #[serde(default)]
    pub spatial: SpatialConfig,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub fusion: FusionConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// `multilingual-e5-small`, `all-minilm-l6-v2` or `hashing`
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Dimension of produced vectors
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Texts per call to the model
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Prefix query texts with `query: ` (E5 models)
    #[serde(default = "default_true")]
    pub use_query_prefix: bool,

    /// Prefix stored texts with `passage: ` (E5 models)
    #[serde(default = "default_true")]
    pub use_passage_prefix: bool,

    /// Where downloaded models are cached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorConfig {
    /// Population below which search stays exhaustive
    #[serde(default = "default_min_train_population")]
    pub min_train_population: usize,

    /// Upper bound on partitions built by k-means
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Partitions probed per query in partitioned mode
    #[serde(default = "default_probe")]
    pub probe: usize,

    /// Mutating operations between automatic checkpoints
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval: usize,

    /// Tombstone share of the population that triggers a rebuild
    #[serde(default = "default_rebuild_tombstone_ratio")]
    pub rebuild_tombstone_ratio: f32,

    /// Checkpoint file name, relative to `data_dir`
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpatialConfig {
    /// Edge length of a grid cell in degrees
    #[serde(default = "default_cell_size_degrees")]
    pub cell_size_degrees: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TextConfig {
    /// Boost of token matches in tags over description matches
    #[serde(default = "default_tag_boost")]
    pub tag_boost: f32,

    /// Boost of a query token equal to a whole tag
    #[serde(default = "default_exact_tag_boost")]
    pub exact_tag_boost: f32,

    /// Memory budget of the tantivy writer
    #[serde(default = "default_writer_memory_bytes")]
    pub writer_memory_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    #[serde(default = "default_radius_km")]
    pub default_radius_km: f64,

    #[serde(default = "default_max_radius_km")]
    pub max_radius_km: f64,

    #[serde(default = "default_similarity_threshold")]
    pub default_similarity_threshold: f32,

    /// Candidates fetched per modality, as a multiple of offset + limit
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    /// Floor on candidates fetched per modality
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FusionConfig {
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,

    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,

    #[serde(default = "default_location_weight")]
    pub location_weight: f32,

    /// Added once per modality an identity appears in
    #[serde(default = "default_multi_match_bonus")]
    pub multi_match_bonus: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Records per sub-batch in bulk ingestion
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,

    /// Largest accepted bulk request
    #[serde(default = "default_max_bulk")]
    pub max_bulk: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("data")
}
fn default_true() -> bool {
    true
}
fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}
fn default_dimension() -> usize {
    384
}
fn default_embedding_batch_size() -> usize {
    32
}
fn default_min_train_population() -> usize {
    100
}
fn default_partitions() -> usize {
    100
}
fn default_probe() -> usize {
    10
}
fn default_auto_save_interval() -> usize {
    100
}
fn default_rebuild_tombstone_ratio() -> f32 {
    0.25
}
fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("vectors.ckpt")
}
fn default_cell_size_degrees() -> f64 {
    0.1
}
fn default_tag_boost() -> f32 {
    2.0
}
fn default_exact_tag_boost() -> f32 {
    3.0
}
fn default_writer_memory_bytes() -> usize {
    50_000_000
}
fn default_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    100
}
fn default_radius_km() -> f64 {
    1.0
}
fn default_max_radius_km() -> f64 {
    100.0
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_min_candidates() -> usize {
    20
}
fn default_text_weight() -> f32 {
    0.4
}
fn default_vector_weight() -> f32 {
    0.4
}
fn default_location_weight() -> f32 {
    0.2
}
fn default_multi_match_bonus() -> f32 {
    0.1
}
fn default_ingest_batch_size() -> usize {
    32
}
fn default_max_bulk() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            embedding: EmbeddingConfig::default(),
            vector: VectorConfig::default(),
            spatial: SpatialConfig::default(),
            text: TextConfig::default(),
            search: SearchConfig::default(),
            fusion: FusionConfig::default(),
            ingest: IngestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_dimension(),
            batch_size: default_embedding_batch_size(),
            use_query_prefix: true,
            use_passage_prefix: true,
            cache_dir: None,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            min_train_population: default_min_train_population(),
            partitions: default_partitions(),
            probe: default_probe(),
            auto_save_interval: default_auto_save_interval(),
            rebuild_tombstone_ratio: default_rebuild_tombstone_ratio(),
            checkpoint_file: default_checkpoint_file(),
        }
    }
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_size_degrees: default_cell_size_degrees(),
        }
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            tag_boost: default_tag_boost(),
            exact_tag_boost: default_exact_tag_boost(),
            writer_memory_bytes: default_writer_memory_bytes(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            default_radius_km: default_radius_km(),
            max_radius_km: default_max_radius_km(),
            default_similarity_threshold: default_similarity_threshold(),
            candidate_multiplier: default_candidate_multiplier(),
            min_candidates: default_min_candidates(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            text_weight: default_text_weight(),
            vector_weight: default_vector_weight(),
            location_weight: default_location_weight(),
            multi_match_bonus: default_multi_match_bonus(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_ingest_batch_size(),
            max_bulk: default_max_bulk(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore becomes a dot, single underscores stay in field names
            .merge(Env::prefixed("GEOTAG_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.geotag/settings.toml` searching from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Absolute location of the vector checkpoint
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(&self.vector.checkpoint_file)
    }

    /// Rejects values the engine cannot work with
    pub fn validate(&self) -> GeoResult<()> {
        let fail = |reason: String| Err(GeoError::Config { reason });

        if self.embedding.dimension == 0 {
            return fail("embedding.dimension must be greater than zero".to_string());
        }
        if self.embedding.batch_size == 0 || self.ingest.batch_size == 0 {
            return fail("batch sizes must be greater than zero".to_string());
        }
        if self.vector.partitions == 0 || self.vector.probe == 0 {
            return fail("vector.partitions and vector.probe must be at least 1".to_string());
        }
        if self.vector.auto_save_interval == 0 {
            return fail("vector.auto_save_interval must be at least 1".to_string());
        }
        if !(self.vector.rebuild_tombstone_ratio > 0.0 && self.vector.rebuild_tombstone_ratio <= 1.0)
        {
            return fail("vector.rebuild_tombstone_ratio must be in (0, 1]".to_string());
        }
        if !(self.spatial.cell_size_degrees > 0.0 && self.spatial.cell_size_degrees <= 180.0) {
            return fail("spatial.cell_size_degrees must be in (0, 180]".to_string());
        }
        if self.search.max_limit == 0 || self.search.default_limit > self.search.max_limit {
            return fail("search.default_limit must be within 1..=search.max_limit".to_string());
        }
        if !(self.search.max_radius_km > 0.0)
            || self.search.default_radius_km > self.search.max_radius_km
        {
            return fail("search radius defaults must be positive and within the maximum".to_string());
        }
        if !(0.0..=1.0).contains(&self.search.default_similarity_threshold) {
            return fail("search.default_similarity_threshold must be in [0, 1]".to_string());
        }
        if self.search.candidate_multiplier == 0 {
            return fail("search.candidate_multiplier must be at least 1".to_string());
        }
        let weights = [
            self.fusion.text_weight,
            self.fusion.vector_weight,
            self.fusion.location_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return fail("fusion weights must be non-negative".to_string());
        }
        if !(self.fusion.multi_match_bonus > 0.0) {
            return fail("fusion.multi_match_bonus must be positive".to_string());
        }
        if self.text.tag_boost <= 0.0 || self.text.exact_tag_boost <= 0.0 {
            return fail("text boosts must be positive".to_string());
        }
        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = r#"# geotag configuration file

version = 1

# Record store log/snapshot and vector checkpoint live here
data_dir = ".geotag/data"

[embedding]
# multilingual-e5-small, all-minilm-l6-v2, or hashing (offline, deterministic)
model = "multilingual-e5-small"
dimension = 384
batch_size = 32
use_query_prefix = true
use_passage_prefix = true

[vector]
# Search stays exhaustive below this many vectors
min_train_population = 100
partitions = 100
probe = 10
# Checkpoint after this many mutating vector operations
auto_save_interval = 100
rebuild_tombstone_ratio = 0.25
checkpoint_file = "vectors.ckpt"

[spatial]
cell_size_degrees = 0.1

[text]
tag_boost = 2.0
exact_tag_boost = 3.0

[search]
default_limit = 10
max_limit = 100
default_radius_km = 1.0
max_radius_km = 100.0
default_similarity_threshold = 0.3
candidate_multiplier = 3
min_candidates = 20

[fusion]
text_weight = 0.4
vector_weight = 0.4
location_weight = 0.2
multi_match_bonus = 0.1

[ingest]
batch_size = 32
max_bulk = 1000

[logging]
level = "info"
"#;

        std::fs::write(&config_path, template)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.data_dir, PathBuf::from(".geotag/data"));
        assert_eq!(settings.vector.min_train_population, 100);
        assert_eq!(settings.vector.auto_save_interval, 100);
        assert_eq!(settings.ingest.max_bulk, 1000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
data_dir = "/tmp/geotag-test"

[vector]
probe = 4
auto_save_interval = 10

[fusion]
multi_match_bonus = 0.5
"#;
        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/tmp/geotag-test"));
        assert_eq!(settings.vector.probe, 4);
        assert_eq!(settings.vector.auto_save_interval, 10);
        assert_eq!(settings.fusion.multi_match_bonus, 0.5);
        // Untouched sections keep their defaults
        assert_eq!(settings.vector.partitions, 100);
        assert_eq!(settings.search.max_radius_km, 100.0);
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.search.max_limit = 50;
        settings.embedding.model = "hashing".to_string();

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.search.max_limit, 50);
        assert_eq!(loaded.embedding.model, "hashing");
    }

    #[test]
    fn test_env_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        fs::write(&config_path, "[ingest]\nmax_bulk = 200\nbatch_size = 8\n").unwrap();

        unsafe {
            std::env::set_var("GEOTAG_INGEST__MAX_BULK", "300");
        }

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.ingest.max_bulk, 300);
        assert_eq!(settings.ingest.batch_size, 8);

        unsafe {
            std::env::remove_var("GEOTAG_INGEST__MAX_BULK");
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.fusion.multi_match_bonus = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.vector.probe = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.search.default_radius_km = 500.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.fusion.text_weight = -1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_checkpoint_path_is_under_data_dir() {
        let mut settings = Settings::default();
        settings.data_dir = PathBuf::from("/var/lib/geotag");
        assert_eq!(
            settings.checkpoint_path(),
            PathBuf::from("/var/lib/geotag/vectors.ckpt")
        );
    }
}

//! Embedding generation for location texts and queries.
//!
//! The engine never talks to a model directly. It goes through
//! [`EmbeddingGenerator`], injected at construction, so tests and offline
//! deployments can substitute the deterministic [`HashingEmbedder`].
//! [`Embedder`] adds the `query: ` / `passage: ` prefixes E5 models expect.

use std::path::PathBuf;
use std::sync::Arc;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use tantivy::tokenizer::TextAnalyzer;

use crate::config::EmbeddingConfig;
use crate::text::text_analyzer;
use crate::vector::clustering::normalize_in_place;
use crate::vector::types::{VectorDimension, VectorError};

const QUERY_PREFIX: &str = "query: ";
const PASSAGE_PREFIX: &str = "passage: ";

/// Trait for generating embeddings from text.
///
/// Implementations must be thread-safe. A failed call fails every text in
/// the batch; callers decide what that means for the affected records.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate one embedding per input text, in order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| VectorError::EmbeddingFailed("model returned no embedding".to_string()))
    }

    #[must_use]
    fn dimension(&self) -> VectorDimension;

    fn model_name(&self) -> &str;

    /// Whether the model was trained with `query: ` / `passage: ` prefixes.
    fn uses_prefixes(&self) -> bool {
        false
    }
}

/// Which side of retrieval a text is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Query,
    Passage,
}

/// Prefix-aware front of an [`EmbeddingGenerator`].
#[derive(Clone)]
pub struct Embedder {
    generator: Arc<dyn EmbeddingGenerator>,
    query_prefix: bool,
    passage_prefix: bool,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model", &self.generator.model_name())
            .field("query_prefix", &self.query_prefix)
            .field("passage_prefix", &self.passage_prefix)
            .finish()
    }
}

impl Embedder {
    pub fn new(generator: Arc<dyn EmbeddingGenerator>, config: &EmbeddingConfig) -> Self {
        let prefixes = generator.uses_prefixes();
        Self {
            generator,
            query_prefix: prefixes && config.use_query_prefix,
            passage_prefix: prefixes && config.use_passage_prefix,
        }
    }

    /// Embedder without prefixes, mostly for tests.
    pub fn plain(generator: Arc<dyn EmbeddingGenerator>) -> Self {
        Self {
            generator,
            query_prefix: false,
            passage_prefix: false,
        }
    }

    pub fn dimension(&self) -> VectorDimension {
        self.generator.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    pub fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, VectorError> {
        self.embed_kind(texts, TextKind::Passage)
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        self.embed_kind(&[text.to_string()], TextKind::Query)?
            .pop()
            .ok_or_else(|| VectorError::EmbeddingFailed("model returned no embedding".to_string()))
    }

    fn embed_kind(&self, texts: &[String], kind: TextKind) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prefix = match kind {
            TextKind::Query if self.query_prefix => QUERY_PREFIX,
            TextKind::Passage if self.passage_prefix => PASSAGE_PREFIX,
            _ => "",
        };
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();

        let embeddings = self.generator.embed_batch(&refs)?;
        if embeddings.len() != texts.len() {
            return Err(VectorError::EmbeddingFailed(format!(
                "model returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        let dimension = self.dimension();
        for embedding in &embeddings {
            dimension.check(embedding)?;
        }
        Ok(embeddings)
    }
}

/// Builds the generator named by `config.model`.
pub fn generator_from_config(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingGenerator>, VectorError> {
    let dimension = VectorDimension::new(config.dimension)?;
    match config.model.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(dimension))),
        name => Ok(Arc::new(FastEmbedGenerator::new(
            name,
            config.cache_dir.clone().unwrap_or_else(models_dir),
        )?)),
    }
}

/// Default location of downloaded models.
pub fn models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("geotag")
        .join("models")
}

/// Output length of both supported fastembed models.
const FASTEMBED_DIMENSION: usize = 384;

/// FastEmbed implementation, multilingual E5 small by default.
pub struct FastEmbedGenerator {
    model: Mutex<TextEmbedding>,
    name: String,
    prefixes: bool,
    dimension: VectorDimension,
}

impl FastEmbedGenerator {
    /// Loads `model_name`, downloading it into `cache_dir` on first use.
    ///
    /// # Errors
    /// Returns an error for unknown model names or when the model cannot be loaded.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, VectorError> {
        let (model, prefixes) = match model_name {
            "multilingual-e5-small" => (EmbeddingModel::MultilingualE5Small, true),
            "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, false),
            other => {
                return Err(VectorError::EmbeddingFailed(format!(
                    "unknown embedding model '{other}' (expected multilingual-e5-small, all-minilm-l6-v2 or hashing)"
                )));
            }
        };

        let embedding = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(false),
        )
        .map_err(|e| {
            VectorError::EmbeddingFailed(format!(
                "could not load '{model_name}' (the first run downloads it): {e}"
            ))
        })?;

        tracing::info!("embedding model '{model_name}' loaded");
        Ok(Self {
            model: Mutex::new(embedding),
            name: model_name.to_string(),
            prefixes,
            dimension: VectorDimension::new(FASTEMBED_DIMENSION)?,
        })
    }
}

impl EmbeddingGenerator for FastEmbedGenerator {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let owned: Vec<String> = texts.iter().map(|s| (*s).to_string()).collect();
        let embeddings = self
            .model
            .lock()
            .embed(owned, None)
            .map_err(|e| VectorError::EmbeddingFailed(format!("{}: {e}", self.name)))?;

        for embedding in &embeddings {
            self.dimension.check(embedding)?;
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn uses_prefixes(&self) -> bool {
        self.prefixes
    }
}

/// Deterministic feature-hashing embedder.
///
/// Every token produced by the text index analyzer is hashed into a signed
/// bucket and the result is L2-normalised. Texts sharing tokens get positive cosine
/// similarity; texts with no token in common are orthogonal. No model download.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: VectorDimension,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: VectorDimension) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, analyzer: &mut TextAnalyzer, text: &str) -> Vec<f32> {
        let dim = self.dimension.get();
        let mut embedding = vec![0.0f32; dim];

        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            let hash = fnv1a(&stream.token().text);
            let bucket = (hash % dim as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        if !normalize_in_place(&mut embedding) {
            // Tokenless text still gets a usable direction
            embedding[0] = 1.0;
        }
        embedding
    }
}

impl EmbeddingGenerator for HashingEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        let mut analyzer = text_analyzer();
        Ok(texts
            .iter()
            .map(|text| self.embed_one(&mut analyzer, text))
            .collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing"
    }
}

fn fnv1a(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    text.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

//! Unified search across the spatial, text and vector indices.
//!
//! A [`UnifiedQuery`] names the modalities to run. The orchestrator asks
//! every enabled index for more candidates than the page needs, unions the
//! sets, ranks them with [`fuse`] and hydrates the page from the store.

mod fusion;
mod orchestrator;
mod query;

pub use fusion::{Candidates, FusedHit, candidate_limit, fuse};
pub use orchestrator::{QueryOrchestrator, SearchResult, UnifiedSearchResponse};
pub use query::{GeoFilter, MIN_RADIUS_KM, Modalities, Modality, UnifiedQuery};

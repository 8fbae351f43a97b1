//! Unified query description and its validation.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SearchConfig;
use crate::error::{GeoError, GeoResult};
use crate::types::Coordinate;

/// Smallest radius a location filter accepts, in kilometres.
pub const MIN_RADIUS_KM: f64 = 0.001;

bitflags! {
    /// Index modalities a query activates. Each one is enabled independently.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Modalities: u8 {
        const TEXT     = 0b00000001;
        const VECTOR   = 0b00000010;
        const LOCATION = 0b00000100;
    }
}

impl Modalities {
    /// Enabled modalities in fan-out order.
    pub fn each(&self) -> Vec<Modality> {
        Modality::ALL
            .into_iter()
            .filter(|m| self.contains(m.flag()))
            .collect()
    }
}

/// A single modality, used in responses and per-modality counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Vector,
    Location,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Text, Modality::Vector, Modality::Location];

    #[must_use]
    pub const fn flag(&self) -> Modalities {
        match self {
            Self::Text => Modalities::TEXT,
            Self::Vector => Modalities::VECTOR,
            Self::Location => Modalities::LOCATION,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Vector => write!(f, "vector"),
            Self::Location => write!(f, "location"),
        }
    }
}

/// Circle a location search is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFilter {
    pub center: Coordinate,
    pub radius_km: f64,
}

impl GeoFilter {
    pub fn new(center: Coordinate, radius_km: f64) -> Self {
        Self { center, radius_km }
    }
}

/// One request to the unified search.
///
/// By default every modality is on, with a similarity threshold of 0.3 and
/// ten results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedQuery {
    pub text: Option<String>,
    pub location: Option<GeoFilter>,
    pub modalities: Modalities,
    pub similarity_threshold: f32,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for UnifiedQuery {
    fn default() -> Self {
        Self {
            text: None,
            location: None,
            modalities: Modalities::all(),
            similarity_threshold: 0.3,
            limit: 10,
            offset: 0,
        }
    }
}

impl UnifiedQuery {
    /// A query using the configured default threshold and limit.
    pub fn with_defaults(config: &SearchConfig) -> Self {
        Self {
            similarity_threshold: config.default_similarity_threshold,
            limit: config.default_limit,
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_location(mut self, center: Coordinate, radius_km: f64) -> Self {
        self.location = Some(GeoFilter::new(center, radius_km));
        self
    }

    pub fn with_modalities(mut self, modalities: Modalities) -> Self {
        self.modalities = modalities;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Trimmed query text, `None` when absent or blank.
    #[must_use]
    pub fn query_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Rejects queries that cannot run as specified.
    ///
    /// Nothing is inferred: a query without modalities, or with a modality
    /// but not its input, is an `InvalidQuery`.
    pub fn validate(&self, config: &SearchConfig) -> GeoResult<()> {
        if self.modalities.is_empty() {
            return Err(invalid("no search modality enabled"));
        }

        if self.modalities.intersects(Modalities::TEXT | Modalities::VECTOR)
            && self.query_text().is_none()
        {
            return Err(invalid("text and vector search need non-empty query text"));
        }

        if self.limit == 0 {
            return Err(invalid("limit must be at least 1"));
        }
        if self.limit > config.max_limit {
            return Err(invalid(format!(
                "limit {} is above the maximum of {}",
                self.limit, config.max_limit
            )));
        }

        if !self.similarity_threshold.is_finite() || !(0.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(invalid(format!(
                "similarity threshold {} must be within [0, 1]",
                self.similarity_threshold
            )));
        }

        match (&self.location, self.modalities.contains(Modalities::LOCATION)) {
            (None, true) => return Err(invalid("location search needs a coordinate")),
            (Some(filter), _) => validate_radius(filter.radius_km, config)?,
            (None, false) => {}
        }

        Ok(())
    }
}

fn validate_radius(radius_km: f64, config: &SearchConfig) -> GeoResult<()> {
    if !radius_km.is_finite() || radius_km < MIN_RADIUS_KM {
        return Err(invalid(format!(
            "radius {radius_km} km must be at least {MIN_RADIUS_KM} km"
        )));
    }
    if radius_km > config.max_radius_km {
        return Err(GeoError::CapacityExceeded {
            what: "search radius (km)",
            requested: radius_km.to_string(),
            limit: config.max_radius_km.to_string(),
        });
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> GeoError {
    GeoError::InvalidQuery {
        reason: reason.into(),
    }
}

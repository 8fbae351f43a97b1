//! Core domain types for geo-tagged location records.
//!
//! Identities, coordinates and the record itself live here, together with the
//! input normalisation applied before anything reaches the Record Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GeoError, GeoResult};

/// Mean Earth radius used by every great-circle computation, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Text used for embedding when a record has neither description nor tags.
const EMPTY_EMBEDDING_TEXT: &str = "no description";

/// Identity of a location record.
///
/// Assigned by the Record Store, strictly increasing, never reused even after
/// the record is deleted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(transparent)]
pub struct LocationId(u64);

impl LocationId {
    /// Creates a new `LocationId`. Zero is reserved and rejected.
    #[must_use]
    pub fn new(id: u64) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Validates and builds a coordinate.
    ///
    /// Latitude must lie in `[-90, 90]` and longitude in `[-180, 180]`.
    /// Non-finite values are rejected.
    pub fn new(latitude: f64, longitude: f64) -> GeoResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::Validation {
                field: "latitude".to_string(),
                reason: format!("{latitude} is outside [-90, 90]"),
            });
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::Validation {
                field: "longitude".to_string(),
                reason: format!("{longitude} is outside [-180, 180]"),
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance to `other` in kilometers (haversine).
    #[must_use]
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().min(1.0).asin();
        EARTH_RADIUS_KM * c
    }
}

/// Lifecycle status of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Deleted,
}

/// The canonical location entity held by the Record Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub id: LocationId,
    pub coordinate: Coordinate,
    /// Display order is preserved; matching ignores order.
    pub tags: Vec<String>,
    pub description: String,
    /// Absent until computed, or when the embedding capability failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Recorded reason of the last embedding failure (degraded record).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_failure: Option<String>,
    pub status: RecordStatus,
    /// Bumped on every mutation; indices remember the revision they hold.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocationRecord {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }

    /// Text fed to the embedding capability for this record.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.description, &self.tags)
    }
}

/// Fields supplied by a caller to create a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl NewLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            tags: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Validates the coordinate and normalises text fields.
    pub fn validate(&self) -> GeoResult<ValidatedLocation> {
        let coordinate = Coordinate::new(self.latitude, self.longitude)?;
        Ok(ValidatedLocation {
            coordinate,
            tags: normalize_tags(&self.tags),
            description: normalize_description(&self.description),
        })
    }
}

/// A create request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedLocation {
    pub coordinate: Coordinate,
    pub tags: Vec<String>,
    pub description: String,
}

impl ValidatedLocation {
    #[must_use]
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.description, &self.tags)
    }
}

/// Partial update of a record. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationPatch {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl LocationPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latitude.is_none()
            && self.longitude.is_none()
            && self.tags.is_none()
            && self.description.is_none()
    }

    /// Whether applying this patch changes the embedding input.
    #[must_use]
    pub fn touches_text(&self) -> bool {
        self.tags.is_some() || self.description.is_some()
    }

    /// Applies the patch to a copy of `current`, validating the result.
    ///
    /// Does not touch identity, status, revision or timestamps.
    pub fn apply_to(&self, current: &LocationRecord) -> GeoResult<LocationRecord> {
        let coordinate = Coordinate::new(
            self.latitude.unwrap_or(current.coordinate.latitude),
            self.longitude.unwrap_or(current.coordinate.longitude),
        )?;

        let mut next = current.clone();
        next.coordinate = coordinate;
        if let Some(tags) = &self.tags {
            next.tags = normalize_tags(tags);
        }
        if let Some(description) = &self.description {
            next.description = normalize_description(description);
        }
        Ok(next)
    }
}

/// Trims, lower-cases and drops empty tags, keeping the caller's order.
#[must_use]
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

#[must_use]
pub fn normalize_description(description: &str) -> String {
    description.trim().to_string()
}

/// Combines description and tags into the text that gets embedded.
#[must_use]
pub fn embedding_text(description: &str, tags: &[String]) -> String {
    let combined = format!("{} {}", description, tags.join(" "));
    let combined = combined.trim();
    if combined.is_empty() {
        EMPTY_EMBEDDING_TEXT.to_string()
    } else {
        combined.to_string()
    }
}

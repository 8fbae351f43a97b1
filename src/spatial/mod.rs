//! Spatial index over record coordinates.
//!
//! Points are bucketed into a uniform latitude/longitude grid. A radius query
//! turns the search circle into a bounding box, visits the covered cells and
//! filters candidates by exact great-circle distance. The box wraps across
//! the antimeridian and spans every longitude once it reaches a pole.
//!
//! The whole structure sits behind one `RwLock`: an insert is visible to
//! queries only once it is fully in place.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{Coordinate, EARTH_RADIUS_KM, LocationId};

type CellKey = (u32, u32);

#[derive(Debug, Default)]
struct GridState {
    points: HashMap<LocationId, Coordinate>,
    cells: HashMap<CellKey, Vec<LocationId>>,
}

#[derive(Debug)]
pub struct SpatialIndex {
    cell_size: f64,
    rows: u32,
    cols: u32,
    state: RwLock<GridState>,
}

impl SpatialIndex {
    /// Creates an empty grid with cells `cell_size_degrees` wide.
    ///
    /// Sizes outside `(0, 180]` fall back to 0.1 degrees.
    pub fn new(cell_size_degrees: f64) -> Self {
        let cell_size = if cell_size_degrees > 0.0 && cell_size_degrees <= 180.0 {
            cell_size_degrees
        } else {
            0.1
        };
        Self {
            cell_size,
            rows: (180.0 / cell_size).ceil() as u32,
            cols: (360.0 / cell_size).ceil() as u32,
            state: RwLock::new(GridState::default()),
        }
    }

    /// Inserts or moves `id`.
    pub fn insert(&self, id: LocationId, coordinate: Coordinate) {
        let mut state = self.state.write();
        self.insert_locked(&mut state, id, coordinate);
    }

    /// Inserts many points under one write lock.
    pub fn insert_batch(&self, points: &[(LocationId, Coordinate)]) {
        let mut state = self.state.write();
        for (id, coordinate) in points {
            self.insert_locked(&mut state, *id, *coordinate);
        }
    }

    /// Removes `id`. Returns whether it was present.
    pub fn remove(&self, id: LocationId) -> bool {
        let mut state = self.state.write();
        self.remove_locked(&mut state, id)
    }

    /// Identities within `radius_km` of `center`, nearest first.
    ///
    /// Equal distances are ordered by identity.
    pub fn query_radius(
        &self,
        center: Coordinate,
        radius_km: f64,
        limit: usize,
    ) -> Vec<(LocationId, f64)> {
        if !(radius_km >= 0.0) || limit == 0 {
            return Vec::new();
        }

        let state = self.state.read();
        let mut hits: Vec<(LocationId, f64)> = self
            .covering_cells(center, radius_km)
            .into_iter()
            .filter_map(|key| state.cells.get(&key))
            .flatten()
            .filter_map(|id| {
                let point = state.points.get(id)?;
                let distance = center.distance_km(point);
                (distance <= radius_km).then_some((*id, distance))
            })
            .collect();
        drop(state);

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        hits.truncate(limit);
        hits
    }

    /// Whether `id` is indexed at exactly `coordinate`.
    pub fn matches(&self, id: LocationId, coordinate: &Coordinate) -> bool {
        self.state.read().points.get(&id) == Some(coordinate)
    }

    pub fn contains(&self, id: LocationId) -> bool {
        self.state.read().points.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<LocationId> {
        let mut ids: Vec<_> = self.state.read().points.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.read().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every point.
    pub fn clear(&self) {
        *self.state.write() = GridState::default();
    }

    fn insert_locked(&self, state: &mut GridState, id: LocationId, coordinate: Coordinate) {
        self.remove_locked(state, id);
        let key = self.cell_of(&coordinate);
        state.cells.entry(key).or_default().push(id);
        state.points.insert(id, coordinate);
    }

    fn remove_locked(&self, state: &mut GridState, id: LocationId) -> bool {
        let Some(previous) = state.points.remove(&id) else {
            return false;
        };
        let key = self.cell_of(&previous);
        if let Some(members) = state.cells.get_mut(&key) {
            if let Some(position) = members.iter().position(|m| *m == id) {
                members.swap_remove(position);
            }
            if members.is_empty() {
                state.cells.remove(&key);
            }
        }
        true
    }

    fn row_of(&self, latitude: f64) -> u32 {
        let row = ((latitude + 90.0) / self.cell_size).floor() as i64;
        row.clamp(0, i64::from(self.rows) - 1) as u32
    }

    fn col_of(&self, longitude: f64) -> u32 {
        let col = ((longitude + 180.0) / self.cell_size).floor() as i64;
        col.rem_euclid(i64::from(self.cols)) as u32
    }

    fn cell_of(&self, coordinate: &Coordinate) -> CellKey {
        (
            self.row_of(coordinate.latitude),
            self.col_of(coordinate.longitude),
        )
    }

    /// Grid cells overlapping the bounding box of the search circle.
    fn covering_cells(&self, center: Coordinate, radius_km: f64) -> Vec<CellKey> {
        let angular = radius_km / EARTH_RADIUS_KM;
        let lat_delta = angular.to_degrees();
        let min_lat = center.latitude - lat_delta;
        let max_lat = center.latitude + lat_delta;

        let all_cols = min_lat <= -90.0 || max_lat >= 90.0 || angular >= std::f64::consts::PI;
        let lon_delta = if all_cols {
            180.0
        } else {
            // Widest longitude offset reached by the circle at this latitude
            let ratio = angular.sin() / center.latitude.to_radians().cos();
            if ratio >= 1.0 { 180.0 } else { ratio.asin().to_degrees() }
        };

        let first_row = self.row_of(min_lat.max(-90.0));
        let last_row = self.row_of(max_lat.min(90.0));

        let cols: Vec<u32> = if lon_delta >= 180.0 {
            (0..self.cols).collect()
        } else {
            let start = ((center.longitude - lon_delta + 180.0) / self.cell_size).floor() as i64;
            let end = ((center.longitude + lon_delta + 180.0) / self.cell_size).floor() as i64;
            if end - start + 1 >= i64::from(self.cols) {
                (0..self.cols).collect()
            } else {
                (start..=end)
                    .map(|c| c.rem_euclid(i64::from(self.cols)) as u32)
                    .collect()
            }
        };

        let mut keys = Vec::with_capacity((last_row - first_row + 1) as usize * cols.len());
        for row in first_row..=last_row {
            keys.extend(cols.iter().map(|col| (row, *col)));
        }
        keys
    }
}

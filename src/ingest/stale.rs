//! Identities whose index entries are known to lag the Record Store.

use std::collections::HashMap;

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::LocationId;

bitflags! {
    /// Index kinds an identity can be stale in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct IndexKind: u8 {
        const SPATIAL = 0b00000001;
        const TEXT    = 0b00000010;
        const VECTOR  = 0b00000100;
    }
}

impl IndexKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        if *self == Self::SPATIAL {
            "spatial"
        } else if *self == Self::TEXT {
            "text"
        } else if *self == Self::VECTOR {
            "vector"
        } else {
            "indices"
        }
    }
}

/// Flags set when an index fan-out fails after the store commit.
///
/// Reconciliation drains the set; until then the divergence is recorded,
/// never silent.
#[derive(Debug, Default)]
pub struct StaleSet {
    entries: Mutex<HashMap<LocationId, IndexKind>>,
}

impl StaleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: LocationId, kinds: IndexKind) {
        *self.entries.lock().entry(id).or_insert(IndexKind::empty()) |= kinds;
    }

    /// Index kinds `id` is stale in; empty when consistent.
    pub fn kinds(&self, id: LocationId) -> IndexKind {
        self.entries
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(IndexKind::empty())
    }

    /// Takes every flagged identity, leaving the set empty.
    pub fn drain(&self) -> HashMap<LocationId, IndexKind> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

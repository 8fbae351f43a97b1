//! Striped per-identity locks.
//!
//! Every mutation of one identity, from the store commit through the index
//! fan-out, runs under that identity's stripe. Distinct identities usually
//! hash to different stripes and proceed in parallel.

use parking_lot::{Mutex, MutexGuard};

use crate::types::LocationId;

const DEFAULT_STRIPES: usize = 64;

#[derive(Debug)]
pub struct IdentityLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for IdentityLocks {
    fn default() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }
}

impl IdentityLocks {
    pub fn with_stripes(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Blocks until `id` may be mutated.
    pub fn lock(&self, id: LocationId) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(id)].lock()
    }

    /// Locks the stripes of every id in `ids`.
    ///
    /// Stripes are taken once each, in ascending order, so two callers
    /// locking overlapping sets cannot deadlock.
    pub fn lock_many<I>(&self, ids: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = LocationId>,
    {
        let mut stripes: Vec<usize> = ids.into_iter().map(|id| self.stripe_of(id)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes.into_iter().map(|s| self.stripes[s].lock()).collect()
    }

    fn stripe_of(&self, id: LocationId) -> usize {
        (id.get() % self.stripes.len() as u64) as usize
    }
}

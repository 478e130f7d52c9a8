use super::*;
use bloom::BloomFilter;
use bundle::BundleId;
use eid::Eid;
use hashbrown::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Neighbor {0} is not available")]
    NeighborNotAvailable(Eid),

    #[error("No more transfers available to {0}")]
    NoMoreTransfersAvailable(Eid),

    #[error("Bundle {0} is already in transit")]
    AlreadyInTransit(BundleId),

    /// No summary vector was ever received from the neighbor, or it expired.
    /// This means "unknown", which is not the same as "empty".
    #[error("No summary vector available for {0}")]
    BloomfilterNotAvailable(Eid),
}

#[derive(Debug, Clone)]
struct Summary {
    filter: BloomFilter,
    expires: Option<OffsetDateTime>,
}

/// What the router knows about one neighbor.
///
/// Handed out as snapshot copies so callers can make decisions without
/// holding the database lock.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    eid: Eid,
    summary: Option<Summary>,
    transit: HashSet<BundleId>,
    delivered: HashSet<BundleId>,
    max_transfers: usize,
    available: bool,
    last_seen: Option<OffsetDateTime>,
    last_update: Option<OffsetDateTime>,
}

impl NeighborEntry {
    fn new(eid: Eid, max_transfers: usize) -> Self {
        Self {
            eid,
            summary: None,
            transit: HashSet::new(),
            delivered: HashSet::new(),
            max_transfers,
            available: false,
            last_seen: None,
            last_update: None,
        }
    }

    pub fn eid(&self) -> &Eid {
        &self.eid
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn last_seen(&self) -> Option<OffsetDateTime> {
        self.last_seen
    }

    pub fn last_update(&self) -> Option<OffsetDateTime> {
        self.last_update
    }

    /// Replaces the summary vector of this neighbor.
    ///
    /// Bundles confirmed since the last vector are forgotten, the new vector
    /// is the better source.
    pub fn update_bundles(
        &mut self,
        filter: BloomFilter,
        expires: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) {
        self.summary = Some(Summary { filter, expires });
        self.delivered.clear();
        self.last_update = Some(now);
    }

    /// Records that the neighbor now holds `id`.
    ///
    /// The summary vector, if any, is updated too. Without one `get_bundles`
    /// still fails, only [`NeighborEntry::has`] learns about `id`.
    pub fn add_bundle(&mut self, id: &BundleId) {
        if let Some(summary) = &mut self.summary {
            summary.filter.insert(&id.to_string());
        }
        self.delivered.insert(id.clone());
    }

    pub fn get_bundles(&self) -> Result<&BloomFilter, Error> {
        self.summary
            .as_ref()
            .map(|s| &s.filter)
            .ok_or_else(|| Error::BloomfilterNotAvailable(self.eid.clone()))
    }

    /// Returns `true` if the neighbor probably has `id`, or it is on its way.
    ///
    /// With `require_filter`, fails with [`Error::BloomfilterNotAvailable`]
    /// when there is no summary vector to decide from.
    pub fn has(&self, id: &BundleId, require_filter: bool) -> Result<bool, Error> {
        if self.transit.contains(id) || self.delivered.contains(id) {
            return Ok(true);
        }
        match &self.summary {
            Some(summary) => Ok(summary.filter.contains(&id.to_string())),
            None if require_filter => Err(Error::BloomfilterNotAvailable(self.eid.clone())),
            None => Ok(false),
        }
    }

    pub fn acquire_transfer(&mut self, id: &BundleId) -> Result<(), Error> {
        if self.transit.contains(id) {
            return Err(Error::AlreadyInTransit(id.clone()));
        }
        if self.transit.len() >= self.max_transfers {
            return Err(Error::NoMoreTransfersAvailable(self.eid.clone()));
        }
        self.transit.insert(id.clone());
        Ok(())
    }

    /// Returns `false` if `id` was not in transit.
    pub fn release_transfer(&mut self, id: &BundleId) -> bool {
        self.transit.remove(id)
    }

    pub fn transfers(&self) -> usize {
        self.transit.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.transit.len() < self.max_transfers
    }

    fn expire(&mut self, now: OffsetDateTime) -> bool {
        match &self.summary {
            Some(Summary {
                expires: Some(expires),
                ..
            }) if *expires <= now => {
                self.summary = None;
                true
            }
            _ => false,
        }
    }
}

/// Per-neighbor routing state shared by every extension.
///
/// All operations take one coarse lock that is never held across I/O.
pub struct NeighborDatabase {
    entries: Mutex<HashMap<Eid, NeighborEntry>>,
    max_transfers: usize,
}

impl NeighborDatabase {
    pub fn new(max_transfers: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_transfers: max_transfers.max(1),
        }
    }

    fn with_entry<R>(
        &self,
        eid: &Eid,
        f: impl FnOnce(&mut NeighborEntry) -> R,
    ) -> Result<R, Error> {
        self.entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .get_mut(eid)
            .map(f)
            .ok_or_else(|| Error::NeighborNotAvailable(eid.clone()))
    }

    fn with_entry_or_create<R>(&self, eid: &Eid, f: impl FnOnce(&mut NeighborEntry) -> R) -> R {
        f(self
            .entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .entry(eid.clone())
            .or_insert_with(|| NeighborEntry::new(eid.clone(), self.max_transfers)))
    }

    /// A snapshot of the entry for `eid`.
    pub fn get(&self, eid: &Eid) -> Result<NeighborEntry, Error> {
        self.with_entry(eid, |entry| entry.clone())
    }

    /// Creates the entry for `eid` if it has never been seen.
    pub fn create(&self, eid: &Eid) {
        self.with_entry_or_create(eid, |_| {})
    }

    pub fn set_available(&self, eid: &Eid, now: OffsetDateTime) {
        self.with_entry_or_create(eid, |entry| {
            entry.available = true;
            entry.last_seen = Some(now);
        })
    }

    /// Marks `eid` unavailable, releasing all of its transfer slots.
    ///
    /// Returns the bundles that were still in transit.
    pub fn set_unavailable(&self, eid: &Eid, now: OffsetDateTime) -> Vec<BundleId> {
        self.with_entry(eid, |entry| {
            entry.available = false;
            entry.last_seen = Some(now);
            entry.transit.drain().collect()
        })
        .unwrap_or_default()
    }

    /// Drops all knowledge of `eid`
    pub fn remove(&self, eid: &Eid) -> Option<NeighborEntry> {
        self.entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .remove(eid)
    }

    pub fn update_bundles(
        &self,
        eid: &Eid,
        filter: BloomFilter,
        lifetime: Option<time::Duration>,
        now: OffsetDateTime,
    ) {
        self.with_entry_or_create(eid, |entry| {
            entry.update_bundles(filter, lifetime.map(|l| now.saturating_add(l)), now)
        })
    }

    pub fn add_bundle(&self, eid: &Eid, id: &BundleId) -> Result<(), Error> {
        self.with_entry(eid, |entry| entry.add_bundle(id))
    }

    pub fn get_bundles(&self, eid: &Eid) -> Result<BloomFilter, Error> {
        self.with_entry(eid, |entry| entry.get_bundles().cloned())?
    }

    pub fn has(&self, eid: &Eid, id: &BundleId, require_filter: bool) -> Result<bool, Error> {
        self.with_entry(eid, |entry| entry.has(id, require_filter))?
    }

    pub fn acquire_transfer(&self, eid: &Eid, id: &BundleId) -> Result<(), Error> {
        self.with_entry(eid, |entry| entry.acquire_transfer(id))?
    }

    pub fn release_transfer(&self, eid: &Eid, id: &BundleId) -> bool {
        self.with_entry(eid, |entry| entry.release_transfer(id))
            .unwrap_or(false)
    }

    /// Releases `id` on every neighbor it is in transit to.
    pub fn release_bundle(&self, id: &BundleId) {
        for entry in self
            .entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .values_mut()
        {
            entry.release_transfer(id);
        }
    }

    /// Forgets that any neighbor was given `id`.
    pub fn forget_bundle(&self, id: &BundleId) {
        for entry in self
            .entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .values_mut()
        {
            entry.delivered.remove(id);
        }
    }

    /// Forgets that `eid` was given `id`.
    ///
    /// Only the confirmation is dropped, a summary vector listing `id` still
    /// counts.
    pub fn forget_delivered(&self, eid: &Eid, id: &BundleId) -> bool {
        self.with_entry(eid, |entry| entry.delivered.remove(id))
            .unwrap_or(false)
    }

    /// Releases every transfer slot of every neighbor.
    pub fn release_all(&self) {
        for entry in self
            .entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .values_mut()
        {
            entry.transit.clear();
        }
    }

    /// The currently available neighbors.
    pub fn available(&self) -> Vec<Eid> {
        let mut available = self
            .entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .values()
            .filter(|entry| entry.available)
            .map(|entry| entry.eid.clone())
            .collect::<Vec<_>>();
        available.sort();
        available
    }

    pub fn is_available(&self, eid: &Eid) -> bool {
        self.with_entry(eid, |entry| entry.available)
            .unwrap_or(false)
    }

    /// Drops expired summary vectors, returning the neighbors affected.
    pub fn expire(&self, now: OffsetDateTime) -> Vec<Eid> {
        self.entries
            .lock()
            .trace_expect("Failed to lock mutex")
            .values_mut()
            .filter_map(|entry| entry.expire(now).then(|| entry.eid.clone()))
            .collect()
    }

    pub fn max_transfers(&self) -> usize {
        self.max_transfers
    }
}

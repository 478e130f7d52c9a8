use super::*;
use bloom::BloomFilter;
use bundle::BundleId;
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;

/// A time-indexed set of bundle ids with a summary vector over its members.
///
/// Used both for the locally known bundles and for the purge vector. Every
/// member carries an expiry; [`BundleSet::expire`] drops members whose expiry
/// has passed. The bloom filter cannot forget members, so it is rebuilt
/// lazily after removals.
pub struct BundleSet {
    entries: HashMap<BundleId, OffsetDateTime>,
    index: BTreeSet<(OffsetDateTime, BundleId)>,
    filter: BloomFilter,
    stale: bool,
    generation: u64,
    length: usize,
    hashes: u16,
}

impl BundleSet {
    pub fn new(length: usize, hashes: u16) -> Self {
        Self {
            entries: HashMap::new(),
            index: BTreeSet::new(),
            filter: BloomFilter::new(length, hashes),
            stale: false,
            generation: 0,
            length,
            hashes,
        }
    }

    /// Adds `id`, returns `false` if it was already a member.
    ///
    /// A repeated add refreshes the expiry but does not bump the generation.
    pub fn add(&mut self, id: &BundleId, expires: OffsetDateTime) -> bool {
        match self.entries.insert(id.clone(), expires) {
            Some(previous) => {
                self.index.remove(&(previous, id.clone()));
                self.index.insert((expires, id.clone()));
                false
            }
            None => {
                self.index.insert((expires, id.clone()));
                if !self.stale {
                    self.filter.insert(&id.to_string());
                }
                self.generation += 1;
                true
            }
        }
    }

    pub fn contains(&self, id: &BundleId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &BundleId) -> bool {
        match self.entries.remove(id) {
            Some(expires) => {
                self.index.remove(&(expires, id.clone()));
                self.stale = true;
                self.generation += 1;
                true
            }
            None => false,
        }
    }

    /// Drops every member whose expiry is at or before `now`.
    pub fn expire(&mut self, now: OffsetDateTime) -> Vec<BundleId> {
        let mut expired = Vec::new();
        while let Some((expires, _)) = self.index.first() {
            if *expires > now {
                break;
            }
            if let Some((_, id)) = self.index.pop_first() {
                self.entries.remove(&id);
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            self.stale = true;
            self.generation += 1;
        }
        expired
    }

    /// The summary vector over the current members.
    pub fn vector(&mut self) -> BloomFilter {
        if self.stale {
            let mut filter = BloomFilter::new(self.length, self.hashes);
            for id in self.entries.keys() {
                filter.insert(&id.to_string());
            }
            self.filter = filter;
            self.stale = false;
        }
        self.filter.clone()
    }

    /// Changes whenever membership changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BundleSet {
    fn default() -> Self {
        Self::new(BloomFilter::DEFAULT_LENGTH, BloomFilter::DEFAULT_HASHES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn id(seq: u64) -> BundleId {
        BundleId::new("dtn://src/app".parse().unwrap(), 1, seq)
    }

    #[test]
    fn add_is_idempotent() {
        let mut set = BundleSet::default();
        assert!(set.add(&id(1), at(10)));
        let generation = set.generation();
        assert!(!set.add(&id(1), at(20)));
        assert_eq!(set.generation(), generation);
        assert_eq!(set.len(), 1);
        assert!(set.vector().contains(&id(1).to_string()));
    }

    #[test]
    fn expire_in_deadline_order() {
        let mut set = BundleSet::default();
        set.add(&id(1), at(30));
        set.add(&id(2), at(10));
        set.add(&id(3), at(20));

        assert!(set.expire(at(9)).is_empty());
        assert_eq!(set.expire(at(20)), vec![id(2), id(3)]);
        assert!(set.contains(&id(1)));

        let vector = set.vector();
        assert!(vector.contains(&id(1).to_string()));
        assert!(!vector.contains(&id(2).to_string()));
    }

    #[test]
    fn refreshed_expiry() {
        let mut set = BundleSet::default();
        set.add(&id(1), at(10));
        set.add(&id(1), at(50));
        assert!(set.expire(at(20)).is_empty());
        assert_eq!(set.expire(at(50)), vec![id(1)]);
        assert!(set.is_empty());
    }

    #[test]
    fn remove_rebuilds_vector() {
        let mut set = BundleSet::default();
        set.add(&id(1), at(10));
        set.add(&id(2), at(10));
        assert!(set.remove(&id(1)));
        assert!(!set.remove(&id(1)));

        let vector = set.vector();
        assert!(vector.contains(&id(2).to_string()));
        assert!(!vector.contains(&id(1).to_string()));
    }
}

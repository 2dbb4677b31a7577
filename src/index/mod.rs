//! Ordered key indexes backing point, range and multi-value lookups.
//!
//! One `KeyIndex` exists per declared key per entity. Entries are only
//! maintained for null-complete tuples: a row whose key contains a null
//! field is simply not indexed under that key, which also exempts nulls
//! from uniqueness.

use crate::error::{Result, StoreError};
use crate::types::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Ordered field values of one key, in key declaration order.
///
/// Tuple ordering is lexicographic, so a shorter tuple acts as a prefix
/// bound when ranging over a multi-field key.
pub type KeyTuple = Vec<Value>;

/// Iteration order for key selections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Filter over one key's entries.
#[derive(Clone, Debug)]
pub enum KeyFilter {
    /// Every indexed row.
    All,
    /// Rows indexed under exactly this tuple.
    Point(KeyTuple),
    /// Rows indexed under any of these tuples.
    Multi(Vec<KeyTuple>),
    /// Rows whose tuple falls within the bounds.
    Range {
        lo: Bound<KeyTuple>,
        hi: Bound<KeyTuple>,
    },
}

impl KeyFilter {
    pub fn point(tuple: impl Into<KeyTuple>) -> Self {
        KeyFilter::Point(tuple.into())
    }

    pub fn between(lo: KeyTuple, hi: KeyTuple) -> Self {
        KeyFilter::Range {
            lo: Bound::Included(lo),
            hi: Bound::Included(hi),
        }
    }

    pub fn at_least(lo: KeyTuple) -> Self {
        KeyFilter::Range {
            lo: Bound::Included(lo),
            hi: Bound::Unbounded,
        }
    }

    pub fn below(hi: KeyTuple) -> Self {
        KeyFilter::Range {
            lo: Bound::Unbounded,
            hi: Bound::Excluded(hi),
        }
    }
}

/// Ordered key-to-row index, possibly unique.
#[derive(Debug)]
pub struct KeyIndex {
    entity: String,
    key: String,
    unique: bool,
    map: BTreeMap<KeyTuple, BTreeSet<u32>>,
}

impl KeyIndex {
    pub(crate) fn new(entity: &str, key: &str, unique: bool) -> Self {
        Self {
            entity: entity.to_string(),
            key: key.to_string(),
            unique,
            map: BTreeMap::new(),
        }
    }

    fn indexable(tuple: &[Value]) -> bool {
        !tuple.iter().any(Value::is_null)
    }

    /// Index `slot` under `tuple`, enforcing uniqueness.
    pub(crate) fn add(&mut self, tuple: KeyTuple, slot: u32) -> Result<()> {
        if !Self::indexable(&tuple) {
            return Ok(());
        }
        let set = self.map.entry(tuple).or_default();
        if self.unique && !set.is_empty() && !set.contains(&slot) {
            return Err(StoreError::NotUnique {
                entity: self.entity.clone(),
                key: self.key.clone(),
            });
        }
        set.insert(slot);
        Ok(())
    }

    /// Index `slot` under `tuple` without the uniqueness check; used when
    /// rollback re-inserts a previously-valid state.
    pub(crate) fn add_unchecked(&mut self, tuple: KeyTuple, slot: u32) {
        if Self::indexable(&tuple) {
            self.map.entry(tuple).or_default().insert(slot);
        }
    }

    /// Drop `slot`'s entry under `tuple`; no-op when not indexed there.
    pub(crate) fn remove(&mut self, tuple: &KeyTuple, slot: u32) {
        if let Some(set) = self.map.get_mut(tuple) {
            set.remove(&slot);
            if set.is_empty() {
                self.map.remove(tuple);
            }
        }
    }

    /// Point lookup for unique keys; first slot in tuple order otherwise.
    pub(crate) fn get(&self, tuple: &KeyTuple) -> Option<u32> {
        self.map.get(tuple).and_then(|s| s.iter().next().copied())
    }

    /// Number of indexed rows.
    pub(crate) fn len(&self) -> usize {
        self.map.values().map(BTreeSet::len).sum()
    }

    /// Slots matching `filter`, ordered by key tuple in `direction`.
    pub(crate) fn select(&self, filter: &KeyFilter, direction: Direction) -> Vec<u32> {
        match filter {
            KeyFilter::All => self.collect_ordered(self.map.iter(), direction),
            KeyFilter::Point(tuple) => {
                let Some(set) = self.map.get(tuple) else {
                    return Vec::new();
                };
                Self::collect_set(set, direction)
            }
            KeyFilter::Multi(tuples) => {
                let mut ordered: Vec<&KeyTuple> = tuples.iter().collect();
                ordered.sort();
                ordered.dedup();
                if direction == Direction::Desc {
                    ordered.reverse();
                }
                let mut slots = Vec::new();
                for tuple in ordered {
                    if let Some(set) = self.map.get(tuple) {
                        slots.extend(Self::collect_set(set, direction));
                    }
                }
                slots
            }
            KeyFilter::Range { lo, hi } => {
                let range = self.map.range((lo.clone(), hi.clone()));
                self.collect_ordered(range, direction)
            }
        }
    }

    fn collect_ordered<'a>(
        &self,
        iter: impl DoubleEndedIterator<Item = (&'a KeyTuple, &'a BTreeSet<u32>)>,
        direction: Direction,
    ) -> Vec<u32> {
        let mut slots = Vec::new();
        match direction {
            Direction::Asc => {
                for (_, set) in iter {
                    slots.extend(set.iter().copied());
                }
            }
            Direction::Desc => {
                for (_, set) in iter.rev() {
                    slots.extend(set.iter().rev().copied());
                }
            }
        }
        slots
    }

    fn collect_set(set: &BTreeSet<u32>, direction: Direction) -> Vec<u32> {
        match direction {
            Direction::Asc => set.iter().copied().collect(),
            Direction::Desc => set.iter().rev().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(v: i64) -> KeyTuple {
        vec![Value::Long(v)]
    }

    #[test]
    fn test_unique_violation() {
        let mut index = KeyIndex::new("person", "pk", true);

        index.add(tuple(1), 0).unwrap();
        // re-adding the same slot is fine
        index.add(tuple(1), 0).unwrap();

        let err = index.add(tuple(1), 1).unwrap_err();
        assert!(matches!(err, StoreError::NotUnique { .. }));
    }

    #[test]
    fn test_add_unchecked_bypasses_uniqueness() {
        let mut index = KeyIndex::new("person", "pk", true);

        index.add(tuple(1), 0).unwrap();
        index.add_unchecked(tuple(1), 1);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let mut index = KeyIndex::new("person", "pk", true);

        index.add(tuple(1), 0).unwrap();
        index.remove(&tuple(2), 0);
        index.remove(&tuple(1), 9);
        assert_eq!(index.get(&tuple(1)), Some(0));
    }

    #[test]
    fn test_null_tuples_not_indexed() {
        let mut index = KeyIndex::new("person", "by_age", true);

        index.add(vec![Value::Null], 0).unwrap();
        index.add(vec![Value::Null], 1).unwrap();
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_range_and_direction() {
        let mut index = KeyIndex::new("person", "by_age", false);
        for (slot, age) in [(0u32, 30i64), (1, 10), (2, 20), (3, 20)] {
            index.add(tuple(age), slot).unwrap();
        }

        let asc = index.select(&KeyFilter::All, Direction::Asc);
        assert_eq!(asc, vec![1, 2, 3, 0]);

        let desc = index.select(&KeyFilter::All, Direction::Desc);
        assert_eq!(desc, vec![0, 3, 2, 1]);

        let mid = index.select(&KeyFilter::between(tuple(10), tuple(20)), Direction::Asc);
        assert_eq!(mid, vec![1, 2, 3]);

        let above = index.select(&KeyFilter::at_least(tuple(20)), Direction::Desc);
        assert_eq!(above, vec![0, 3, 2]);
    }

    #[test]
    fn test_multi_select_dedups_and_orders() {
        let mut index = KeyIndex::new("person", "by_age", false);
        for (slot, age) in [(0u32, 30i64), (1, 10), (2, 20)] {
            index.add(tuple(age), slot).unwrap();
        }

        let filter = KeyFilter::Multi(vec![tuple(30), tuple(10), tuple(30), tuple(99)]);
        assert_eq!(index.select(&filter, Direction::Asc), vec![1, 0]);
        assert_eq!(index.select(&filter, Direction::Desc), vec![0, 1]);
    }
}

//! Sparse user → (item, count) history used for training and evaluation.

use ahash::AHashSet;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::error::{PmfError, Result};
use crate::grouped::GroupedStore;

/// One observation: `count` visits of `item` by the owning user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Record {
    pub item: u32,
    pub count: i32,
}

impl Record {
    pub fn new(item: u32, count: i32) -> Self {
        Self { item, count }
    }
}

/// Users are groups; the item space is declared separately because items
/// nobody touched still get parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    data: GroupedStore<Record>,
    item_count: usize,
}

impl History {
    /// Wrap an existing store, rejecting item ids outside the item space and
    /// negative counts.
    pub fn new(data: GroupedStore<Record>, item_count: usize) -> Result<Self> {
        if !data.is_initialized() {
            return Err(PmfError::InvalidState("history store is uninitialized"));
        }
        if let Some(pos) = data
            .records()
            .iter()
            .position(|r| r.item as usize >= item_count)
        {
            return Err(PmfError::Integrity {
                position: pos,
                reason: format!(
                    "item {} outside item space of {item_count}",
                    data.records()[pos].item
                ),
            });
        }
        if let Some(pos) = data.records().iter().position(|r| r.count < 0) {
            return Err(PmfError::Integrity {
                position: pos,
                reason: format!("negative count {}", data.records()[pos].count),
            });
        }
        Ok(Self { data, item_count })
    }

    pub fn from_groups(groups: Vec<Vec<Record>>, item_count: usize) -> Result<Self> {
        Self::new(GroupedStore::build(groups)?, item_count)
    }

    /// Build from CSR arrays: `indptr` has `user_count + 1` offsets into the
    /// parallel `items` / `counts` arrays.
    pub fn from_csr(indptr: &[usize], items: &[u32], counts: &[i32], item_count: usize) -> Result<Self> {
        if items.len() != counts.len() {
            return Err(PmfError::ShapeMismatch {
                what: "csr counts",
                expected: items.len(),
                found: counts.len(),
            });
        }
        let records = items
            .iter()
            .zip(counts)
            .map(|(&item, &count)| Record { item, count })
            .collect();
        Self::new(GroupedStore::from_index(indptr.to_vec(), records)?, item_count)
    }

    pub fn user_count(&self) -> usize {
        self.data.group_count()
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Number of stored (user, item) observations.
    pub fn nnz(&self) -> usize {
        self.data.total_size()
    }

    pub fn store(&self) -> &GroupedStore<Record> {
        &self.data
    }

    pub fn user(&self, u: usize) -> Result<&[Record]> {
        self.data.range(u)
    }

    /// Validate every user group: no repeated item. Returns the total visit
    /// count.
    pub fn check(&self) -> Result<u64> {
        let index = self.data.index();
        (0..self.user_count())
            .into_par_iter()
            .map(|u| {
                let mut seen = AHashSet::with_capacity(self.data.group(u).len());
                let mut total = 0u64;
                for (j, rec) in self.data.group(u).iter().enumerate() {
                    let position = index[u] + j;
                    if !seen.insert(rec.item) {
                        return Err(PmfError::Integrity {
                            position,
                            reason: format!("duplicated item {} in user {u}", rec.item),
                        });
                    }
                    total += rec.count as u64;
                }
                Ok(total)
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }

    /// Number of users that touched each item.
    pub fn item_support(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.item_count];
        for rec in self.data.records() {
            counts[rec.item as usize] += 1;
        }
        counts
    }

    /// Move the records at the given global positions into a new history of
    /// the same shape, removing them from `self`.
    pub fn extract(&mut self, positions: &[usize]) -> Result<History> {
        let mut positions = positions.to_vec();
        positions.sort_unstable();
        positions.dedup();

        let mut held: Vec<Vec<Record>> = vec![Vec::new(); self.user_count()];
        for &p in &positions {
            let u = self.data.owner_of(p).map_err(|_| PmfError::Integrity {
                position: p,
                reason: format!("position outside history of {} records", self.nnz()),
            })?;
            held[u].push(self.data.records()[p]);
        }

        let mut pending = positions.iter().copied().peekable();
        let mut at = 0usize;
        let removed = self.data.compact(|_| {
            let take = pending.next_if_eq(&at).is_some();
            at += 1;
            !take
        })?;
        if removed != positions.len() {
            return Err(PmfError::Integrity {
                position: at,
                reason: format!("removed {removed} records, expected {}", positions.len()),
            });
        }
        History::from_groups(held, self.item_count)
    }

    /// Randomly hold out `fraction` of the observations.
    pub fn split_holdout(&mut self, fraction: f64, seed: u64) -> Result<History> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(PmfError::Configuration(format!(
                "holdout fraction {fraction} outside [0, 1)"
            )));
        }
        let amount = (self.nnz() as f64 * fraction).round() as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let picked = rand::seq::index::sample(&mut rng, self.nnz(), amount.min(self.nnz())).into_vec();
        self.extract(&picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(item: u32, count: i32) -> Record {
        Record::new(item, count)
    }

    fn sample() -> History {
        History::from_groups(
            vec![
                vec![r(0, 2), r(1, 1), r(3, 4)],
                vec![],
                vec![r(1, 5), r(2, 1)],
            ],
            4,
        )
        .unwrap()
    }

    #[test]
    fn shape_accessors() {
        let h = sample();
        assert_eq!(h.user_count(), 3);
        assert_eq!(h.item_count(), 4);
        assert_eq!(h.nnz(), 5);
        assert_eq!(h.user(2).unwrap(), &[r(1, 5), r(2, 1)]);
        assert_eq!(h.check().unwrap(), 13);
        assert_eq!(h.item_support(), vec![1, 2, 1, 1]);
    }

    #[test]
    fn item_outside_space_rejected() {
        let err = History::from_groups(vec![vec![r(0, 1), r(7, 1)]], 4).unwrap_err();
        assert!(matches!(err, PmfError::Integrity { position: 1, .. }));
    }

    #[test]
    fn duplicate_item_reports_position() {
        let h = History::from_groups(vec![vec![r(0, 1)], vec![r(2, 1), r(3, 1), r(2, 4)]], 4).unwrap();
        match h.check() {
            Err(PmfError::Integrity { position, .. }) => assert_eq!(position, 3),
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[test]
    fn negative_count_rejected_at_construction() {
        let err = History::from_groups(vec![vec![r(0, 1)], vec![r(1, 2), r(0, -5)]], 2).unwrap_err();
        assert!(matches!(err, PmfError::Integrity { position: 2, .. }));
        assert!(History::from_csr(&[0, 1], &[0], &[-1], 1).is_err());
        assert!(History::from_groups(vec![vec![r(0, 0)]], 1).is_ok());
    }

    #[test]
    fn from_csr_matches_groups() {
        let h = History::from_csr(&[0, 3, 3, 5], &[0, 1, 3, 1, 2], &[2, 1, 4, 5, 1], 4).unwrap();
        assert_eq!(h, sample());
        assert!(History::from_csr(&[0, 1], &[0], &[], 1).is_err());
    }

    #[test]
    fn extract_moves_records() {
        let mut h = sample();
        let held = h.extract(&[4, 1, 1]).unwrap();
        assert_eq!(h.nnz(), 3);
        assert_eq!(held.nnz(), 2);
        assert_eq!(held.user_count(), 3);
        assert_eq!(h.user(0).unwrap(), &[r(0, 2), r(3, 4)]);
        assert_eq!(h.user(2).unwrap(), &[r(1, 5)]);
        assert_eq!(held.user(0).unwrap(), &[r(1, 1)]);
        assert_eq!(held.user(2).unwrap(), &[r(2, 1)]);
    }

    #[test]
    fn extract_out_of_range_is_integrity_error() {
        let mut h = sample();
        assert!(matches!(
            h.extract(&[5]),
            Err(PmfError::Integrity { position: 5, .. })
        ));
        assert_eq!(h, sample());
    }

    #[test]
    fn holdout_split_preserves_total() {
        let mut h = sample();
        let held = h.split_holdout(0.4, 7).unwrap();
        assert_eq!(held.nnz(), 2);
        assert_eq!(h.nnz(), 3);
        assert_eq!(h.check().unwrap() + held.check().unwrap(), 13);
        assert!(sample().split_holdout(1.0, 7).is_err());
    }
}

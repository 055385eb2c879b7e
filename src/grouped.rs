//! Grouped sequence store.
//!
//! One flat record array plus an index table of `group_count + 1` offsets,
//! the same layout as a CSR `indptr`/`indices` pair. Group `g` owns the
//! records in `index[g]..index[g + 1]`.

use crate::error::{PmfError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct GroupedStore<T> {
    index: Vec<usize>,
    records: Vec<T>,
}

impl<T> Default for GroupedStore<T> {
    /// An uninitialized store: no index table, no groups.
    fn default() -> Self {
        Self {
            index: Vec::new(),
            records: Vec::new(),
        }
    }
}

fn checked_total(sizes: impl Iterator<Item = usize>) -> Result<usize> {
    sizes
        .enumerate()
        .try_fold(0usize, |acc, (g, n)| {
            acc.checked_add(n).ok_or_else(|| {
                PmfError::Configuration(format!("record count overflows usize at group {g}"))
            })
        })
}

impl<T> GroupedStore<T> {
    /// Concatenate per-group record lists, keeping group order.
    pub fn build(groups: Vec<Vec<T>>) -> Result<Self> {
        let total = checked_total(groups.iter().map(Vec::len))?;
        let mut index = Vec::with_capacity(groups.len() + 1);
        let mut records = Vec::with_capacity(total);
        index.push(0);
        for group in groups {
            records.extend(group);
            index.push(records.len());
        }
        Ok(Self { index, records })
    }

    /// Preallocate groups of the given sizes, filled with `T::default()`.
    /// Records are written afterwards through [`range_mut`](Self::range_mut).
    pub fn build_from_sizes(sizes: &[usize]) -> Result<Self>
    where
        T: Default + Clone,
    {
        let total = checked_total(sizes.iter().copied())?;
        let mut index = Vec::with_capacity(sizes.len() + 1);
        index.push(0);
        let mut acc = 0usize;
        for &n in sizes {
            acc += n;
            index.push(acc);
        }
        Ok(Self {
            index,
            records: vec![T::default(); total],
        })
    }

    /// Adopt a raw cumulative index table and its record array.
    pub fn from_index(index: Vec<usize>, records: Vec<T>) -> Result<Self> {
        match index.first() {
            None => {
                return Err(PmfError::Integrity {
                    position: 0,
                    reason: "index table is empty".into(),
                })
            }
            Some(&first) if first != 0 => {
                return Err(PmfError::Integrity {
                    position: 0,
                    reason: format!("index must start at 0, found {first}"),
                })
            }
            _ => {}
        }
        if let Some(pos) = index.windows(2).position(|w| w[1] < w[0]) {
            return Err(PmfError::Integrity {
                position: pos + 1,
                reason: format!("index decreases from {} to {}", index[pos], index[pos + 1]),
            });
        }
        let last = index[index.len() - 1];
        if last != records.len() {
            return Err(PmfError::Integrity {
                position: index.len() - 1,
                reason: format!("index ends at {last} but {} records given", records.len()),
            });
        }
        Ok(Self { index, records })
    }

    pub fn is_initialized(&self) -> bool {
        !self.index.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.index.len().saturating_sub(1)
    }

    pub fn total_size(&self) -> usize {
        self.records.len()
    }

    /// Read-only cumulative index table (`group_count + 1` entries).
    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    #[inline]
    fn check(&self, g: usize) -> Result<()> {
        if g >= self.group_count() {
            return Err(PmfError::OutOfBounds {
                index: g,
                count: self.group_count(),
            });
        }
        Ok(())
    }

    /// Records of group `g`.
    pub fn range(&self, g: usize) -> Result<&[T]> {
        self.check(g)?;
        Ok(&self.records[self.index[g]..self.index[g + 1]])
    }

    pub fn range_mut(&mut self, g: usize) -> Result<&mut [T]> {
        self.check(g)?;
        Ok(&mut self.records[self.index[g]..self.index[g + 1]])
    }

    pub fn size(&self, g: usize) -> Result<usize> {
        self.check(g)?;
        Ok(self.index[g + 1] - self.index[g])
    }

    /// Unchecked-by-contract group access for hot loops; the caller has
    /// already validated `g`. Still panics rather than reading out of bounds.
    #[inline(always)]
    pub fn group(&self, g: usize) -> &[T] {
        debug_assert!(g < self.group_count(), "group {g} out of range");
        &self.records[self.index[g]..self.index[g + 1]]
    }

    /// Group that owns the record at global `position`.
    pub fn owner_of(&self, position: usize) -> Result<usize> {
        if position >= self.records.len() {
            return Err(PmfError::OutOfBounds {
                index: position,
                count: self.records.len(),
            });
        }
        // upper bound: first offset strictly greater than `position`
        Ok(self.index.partition_point(|&b| b <= position) - 1)
    }

    pub fn iter_groups(&self) -> impl ExactSizeIterator<Item = &[T]> + '_ {
        self.index
            .windows(2)
            .map(move |w| &self.records[w[0]..w[1]])
    }

    /// Drop every record failing `keep`, preserving group boundaries and the
    /// relative order inside each group. `keep` is called exactly once per
    /// record, in storage order. Returns the number of removed records.
    pub fn compact<F>(&mut self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&T) -> bool,
    {
        if !self.is_initialized() {
            return Err(PmfError::InvalidState("compact called on an uninitialized store"));
        }
        let mut write = 0usize;
        let mut read = 0usize;
        for g in 0..self.group_count() {
            let end = self.index[g + 1];
            while read < end {
                if keep(&self.records[read]) {
                    self.records.swap(write, read);
                    write += 1;
                }
                read += 1;
            }
            self.index[g + 1] = write;
        }
        let removed = self.records.len() - write;
        self.records.truncate(write);
        Ok(removed)
    }
}

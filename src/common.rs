use std::ops::Range;

/// Splits `group_count` users into one contiguous range per worker.
/// Worker `w` always gets the same range for a given shape, so the phi
/// writer and every later reader walk the records in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPartition {
    bounds: Vec<usize>,
}

impl WorkPartition {
    pub fn even(group_count: usize, workers: usize) -> Self {
        let workers = workers.max(1);
        let chunk = group_count.div_ceil(workers);
        let bounds = (0..=workers)
            .map(|w| (w * chunk).min(group_count))
            .collect();
        Self { bounds }
    }

    pub fn workers(&self) -> usize {
        self.bounds.len() - 1
    }

    /// `workers + 1` group offsets, starting at 0.
    pub fn bounds(&self) -> &[usize] {
        &self.bounds
    }

    pub fn range(&self, worker: usize) -> Range<usize> {
        self.bounds[worker]..self.bounds[worker + 1]
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.bounds.windows(2).map(|w| w[0]..w[1])
    }

    /// Translate group offsets into record offsets using a store's index
    /// table, scaled by `stride` values per record.
    pub fn record_bounds(&self, index: &[usize], stride: usize) -> Vec<usize> {
        self.bounds.iter().map(|&g| index[g] * stride).collect()
    }
}

/// Cut `slice` into disjoint consecutive pieces at the given offsets
/// (`bounds[0]` must be 0).
pub fn split_by_bounds_mut<'a, T>(mut slice: &'a mut [T], bounds: &[usize]) -> Vec<&'a mut [T]> {
    debug_assert_eq!(bounds.first().copied().unwrap_or(0), 0);
    let mut out = Vec::with_capacity(bounds.len().saturating_sub(1));
    for w in bounds.windows(2) {
        let (head, tail) = std::mem::take(&mut slice).split_at_mut(w[1] - w[0]);
        out.push(head);
        slice = tail;
    }
    out
}

pub fn split_by_bounds<'a, T>(slice: &'a [T], bounds: &[usize]) -> Vec<&'a [T]> {
    bounds.windows(2).map(|w| &slice[w[0]..w[1]]).collect()
}

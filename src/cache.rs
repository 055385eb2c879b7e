//! Responsibility ("phi") cache.
//!
//! One K-vector per history record, written once per iteration by the
//! E-step and read back (twice) by the M-step, always in record order.
//!
//! Memory strategy:
//!   • `Memory`: one flat `records × K` buffer sharing the history's index
//!     table. Workers get disjoint slices of it.
//!   • `Disk`: one shard file per worker, accessed strictly sequentially.
//!     Each shard keeps a ring buffer of `buffer_size` vectors that is
//!     flushed when full (write) or refilled when drained (read), so peak
//!     memory is `workers × buffer_size × K` doubles whatever the history size.
//!
//! Both backings hand out sessions; a session flushes and releases its file
//! on `close()` or, failing that, when dropped.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::common::{split_by_bounds, split_by_bounds_mut, WorkPartition};
use crate::config::CacheConfig;
use crate::error::{PmfError, Result};
use crate::history::History;

pub struct ResponsibilityCache {
    k: usize,
    index: Vec<usize>,
    backing: Backing,
}

enum Backing {
    Memory(Vec<f64>),
    Disk(Vec<DiskShard>),
}

impl ResponsibilityCache {
    /// In-memory cache shaped like `history`.
    pub fn in_memory(history: &History, k: usize) -> Result<Self> {
        check_k(k)?;
        let index = history.store().index().to_vec();
        let total = history.nnz().checked_mul(k).ok_or_else(|| {
            PmfError::Configuration(format!("{} records × K = {k} overflows usize", history.nnz()))
        })?;
        Ok(Self {
            k,
            index,
            backing: Backing::Memory(vec![0.0; total]),
        })
    }

    /// Disk-backed cache with one shard file `<path>.<shard>` per worker.
    pub fn on_disk(history: &History, k: usize, path: &Path, buffer_size: usize, shards: usize) -> Result<Self> {
        check_k(k)?;
        if buffer_size == 0 {
            return Err(PmfError::Configuration("phi buffer size must be at least 1".into()));
        }
        if shards == 0 {
            return Err(PmfError::Configuration("disk cache needs at least one shard".into()));
        }
        // ring buffer bytes must fit an allocation
        buffer_size
            .checked_mul(k)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f64>()))
            .filter(|&bytes| bytes <= isize::MAX as usize)
            .ok_or_else(|| {
                PmfError::Configuration(format!("phi buffer of {buffer_size} × K = {k} overflows usize"))
            })?;
        let shards = (0..shards)
            .map(|id| DiskShard::new(id, shard_path(path, id), k, buffer_size))
            .collect();
        Ok(Self {
            k,
            index: history.store().index().to_vec(),
            backing: Backing::Disk(shards),
        })
    }

    /// Pick the backing from `config`: disk when a path is given.
    pub fn from_config(history: &History, k: usize, config: &CacheConfig, shards: usize) -> Result<Self> {
        match &config.path {
            Some(path) => Self::on_disk(history, k, path, config.buffer_size, shards),
            None => Self::in_memory(history, k),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.backing, Backing::Disk(_))
    }

    /// Number of shard files, `None` for the in-memory backing.
    pub fn shard_count(&self) -> Option<usize> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::Disk(shards) => Some(shards.len()),
        }
    }

    /// Disk: elements written by the last write session of every shard.
    /// Memory: the configured number of records.
    pub fn total_size(&self) -> usize {
        match &self.backing {
            Backing::Memory(_) => self.index.last().copied().unwrap_or(0),
            Backing::Disk(shards) => shards.iter().map(|s| s.written).sum(),
        }
    }

    /// The cache must have been built for exactly this history shape.
    pub fn check_shape(&self, history: &History) -> Result<()> {
        let other = history.store().index();
        if self.index.len() != other.len() {
            return Err(PmfError::ShapeMismatch {
                what: "phi group count",
                expected: other.len().saturating_sub(1),
                found: self.index.len().saturating_sub(1),
            });
        }
        if let Some(g) = self.index.iter().zip(other).position(|(a, b)| a != b) {
            return Err(PmfError::ShapeMismatch {
                what: "phi index table",
                expected: other[g],
                found: self.index[g],
            });
        }
        Ok(())
    }

    fn check_workers(&self, partition: &WorkPartition) -> Result<()> {
        if *partition.bounds().last().unwrap_or(&0) != self.index.len().saturating_sub(1) {
            return Err(PmfError::ShapeMismatch {
                what: "partition group count",
                expected: self.index.len().saturating_sub(1),
                found: *partition.bounds().last().unwrap_or(&0),
            });
        }
        if let Backing::Disk(shards) = &self.backing {
            if shards.len() != partition.workers() {
                return Err(PmfError::Configuration(format!(
                    "disk cache has {} shards but {} workers were requested",
                    shards.len(),
                    partition.workers()
                )));
            }
        }
        Ok(())
    }

    /// One write session per worker of `partition`, cursors at 0.
    pub fn open_for_write(&mut self, partition: &WorkPartition) -> Result<Vec<WriteSession<'_>>> {
        self.check_workers(partition)?;
        let k = self.k;
        match &mut self.backing {
            Backing::Memory(data) => {
                let bounds = partition.record_bounds(&self.index, k);
                Ok(split_by_bounds_mut(data, &bounds)
                    .into_iter()
                    .enumerate()
                    .map(|(shard, slots)| WriteSession::memory(shard, slots, k))
                    .collect())
            }
            Backing::Disk(shards) => {
                let mut sessions = Vec::with_capacity(shards.len());
                for shard in shards.iter_mut() {
                    shard.begin_write()?;
                    sessions.push(WriteSession::disk(shard));
                }
                Ok(sessions)
            }
        }
    }

    /// One read session per worker of `partition`; disk shards are primed
    /// with their first buffer.
    pub fn open_for_read(&mut self, partition: &WorkPartition) -> Result<Vec<ReadSession<'_>>> {
        self.check_workers(partition)?;
        let k = self.k;
        match &mut self.backing {
            Backing::Memory(data) => {
                let bounds = partition.record_bounds(&self.index, k);
                Ok(split_by_bounds(data, &bounds)
                    .into_iter()
                    .enumerate()
                    .map(|(shard, slots)| ReadSession::memory(shard, slots, k))
                    .collect())
            }
            Backing::Disk(shards) => {
                let mut sessions = Vec::with_capacity(shards.len());
                for shard in shards.iter_mut() {
                    shard.begin_read()?;
                    sessions.push(ReadSession::disk(shard));
                }
                Ok(sessions)
            }
        }
    }
}

fn check_k(k: usize) -> Result<()> {
    if k == 0 {
        return Err(PmfError::Configuration("phi vectors need K >= 1".into()));
    }
    Ok(())
}

fn shard_path(base: &Path, id: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{id}"));
    PathBuf::from(name)
}

// ── Disk shard ─────────────────────────────────────────────────────

struct DiskShard {
    id: usize,
    path: PathBuf,
    k: usize,
    /// Ring buffer of `capacity` K-vectors.
    buffer: Vec<f64>,
    capacity: usize,
    file: Option<File>,
    /// Slot cursor inside `buffer`.
    cursor: usize,
    /// Valid slots in `buffer` while reading.
    filled: usize,
    /// Elements persisted by the last completed (or running) write.
    written: usize,
    /// Elements moved from file to buffer during the current read.
    loaded: usize,
    /// Elements handed out during the current read.
    consumed: usize,
}

impl DiskShard {
    fn new(id: usize, path: PathBuf, k: usize, capacity: usize) -> Self {
        Self {
            id,
            path,
            k,
            buffer: vec![0.0; capacity * k],
            capacity,
            file: None,
            cursor: 0,
            filled: 0,
            written: 0,
            loaded: 0,
            consumed: 0,
        }
    }

    fn begin_write(&mut self) -> Result<()> {
        self.file = Some(File::create(&self.path)?);
        self.cursor = 0;
        self.written = 0;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.cursor == 0 {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or(PmfError::InvalidState("phi shard is not open for writing"))?;
        file.write_all(bytemuck::cast_slice(&self.buffer[..self.cursor * self.k]))?;
        self.cursor = 0;
        Ok(())
    }

    fn write_slot(&mut self) -> Result<&mut [f64]> {
        if self.cursor == self.capacity {
            self.flush_buffer()?;
        }
        let start = self.cursor * self.k;
        self.cursor += 1;
        self.written += 1;
        Ok(&mut self.buffer[start..start + self.k])
    }

    fn end_write(&mut self) -> Result<usize> {
        let flushed = self.flush_buffer();
        // the handle goes away even when the last flush failed
        let file = self.file.take();
        flushed?;
        if let Some(mut f) = file {
            f.flush()?;
        }
        debug!(shard = self.id, written = self.written, "phi shard written");
        Ok(self.written)
    }

    fn begin_read(&mut self) -> Result<()> {
        self.file = Some(File::open(&self.path)?);
        self.cursor = 0;
        self.filled = 0;
        self.loaded = 0;
        self.consumed = 0;
        self.refill()
    }

    fn refill(&mut self) -> Result<()> {
        let n = (self.written - self.loaded).min(self.capacity);
        if n > 0 {
            let file = self
                .file
                .as_mut()
                .ok_or(PmfError::InvalidState("phi shard is not open for reading"))?;
            file.read_exact(bytemuck::cast_slice_mut(&mut self.buffer[..n * self.k]))?;
        }
        self.loaded += n;
        self.filled = n;
        self.cursor = 0;
        Ok(())
    }

    fn read_slot(&mut self) -> Result<&[f64]> {
        if self.consumed == self.written {
            return Err(PmfError::ReadPastEnd {
                shard: self.id,
                written: self.written,
            });
        }
        if self.cursor == self.filled {
            self.refill()?;
        }
        let start = self.cursor * self.k;
        self.cursor += 1;
        self.consumed += 1;
        Ok(&self.buffer[start..start + self.k])
    }

    fn end_read(&mut self) -> Result<usize> {
        self.file = None;
        if self.consumed != self.written {
            return Err(PmfError::Integrity {
                position: self.consumed,
                reason: format!(
                    "phi shard {} closed after {} of {} elements",
                    self.id, self.consumed, self.written
                ),
            });
        }
        Ok(self.consumed)
    }
}

impl Drop for DiskShard {
    fn drop(&mut self) {
        self.file = None;
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "could not remove phi shard");
            }
        }
    }
}

// ── Sessions ───────────────────────────────────────────────────────

enum WriteTarget<'a> {
    Memory {
        shard: usize,
        slots: &'a mut [f64],
        k: usize,
        cursor: usize,
    },
    Disk(&'a mut DiskShard),
}

/// Sequential writer over one worker's share of the cache.
pub struct WriteSession<'a> {
    target: WriteTarget<'a>,
    closed: bool,
}

impl<'a> WriteSession<'a> {
    fn memory(shard: usize, slots: &'a mut [f64], k: usize) -> Self {
        Self {
            target: WriteTarget::Memory {
                shard,
                slots,
                k,
                cursor: 0,
            },
            closed: false,
        }
    }

    fn disk(shard: &'a mut DiskShard) -> Self {
        Self {
            target: WriteTarget::Disk(shard),
            closed: false,
        }
    }

    /// Next K-vector to fill.
    pub fn next_write_slot(&mut self) -> Result<&mut [f64]> {
        match &mut self.target {
            WriteTarget::Memory {
                shard,
                slots,
                k,
                cursor,
            } => {
                let start = *cursor * *k;
                if start + *k > slots.len() {
                    return Err(PmfError::CacheOverrun {
                        shard: *shard,
                        capacity: slots.len() / *k,
                    });
                }
                *cursor += 1;
                Ok(&mut slots[start..start + *k])
            }
            WriteTarget::Disk(shard) => shard.write_slot(),
        }
    }

    fn finish(&mut self) -> Result<usize> {
        self.closed = true;
        match &mut self.target {
            WriteTarget::Memory { cursor, .. } => Ok(*cursor),
            WriteTarget::Disk(shard) => shard.end_write(),
        }
    }

    /// Flush buffered vectors, release the shard file, and return how many
    /// vectors this session wrote.
    pub fn close(mut self) -> Result<usize> {
        self.finish()
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.finish() {
                warn!(error = %e, "phi write session failed to flush on drop");
            }
        }
    }
}

enum ReadSource<'a> {
    Memory {
        shard: usize,
        slots: &'a [f64],
        k: usize,
        cursor: usize,
    },
    Disk(&'a mut DiskShard),
}

/// Sequential reader over one worker's share of the cache, in write order.
pub struct ReadSession<'a> {
    source: ReadSource<'a>,
    closed: bool,
}

impl<'a> ReadSession<'a> {
    fn memory(shard: usize, slots: &'a [f64], k: usize) -> Self {
        Self {
            source: ReadSource::Memory {
                shard,
                slots,
                k,
                cursor: 0,
            },
            closed: false,
        }
    }

    fn disk(shard: &'a mut DiskShard) -> Self {
        Self {
            source: ReadSource::Disk(shard),
            closed: false,
        }
    }

    pub fn next_read_slot(&mut self) -> Result<&[f64]> {
        match &mut self.source {
            ReadSource::Memory {
                shard,
                slots,
                k,
                cursor,
            } => {
                let start = *cursor * *k;
                if start + *k > slots.len() {
                    return Err(PmfError::ReadPastEnd {
                        shard: *shard,
                        written: slots.len() / *k,
                    });
                }
                *cursor += 1;
                Ok(&slots[start..start + *k])
            }
            ReadSource::Disk(shard) => shard.read_slot(),
        }
    }

    fn finish(&mut self) -> Result<usize> {
        self.closed = true;
        match &mut self.source {
            ReadSource::Memory {
                shard,
                slots,
                k,
                cursor,
            } => {
                let available = slots.len() / *k;
                if *cursor != available {
                    return Err(PmfError::Integrity {
                        position: *cursor,
                        reason: format!("phi shard {shard} closed after {cursor} of {available} elements"),
                    });
                }
                Ok(*cursor)
            }
            ReadSource::Disk(shard) => shard.end_read(),
        }
    }

    /// Release the shard and check that every stored vector was consumed.
    pub fn close(mut self) -> Result<usize> {
        self.finish()
    }
}

impl Drop for ReadSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            // early exit: the mismatch is expected, only the handle matters
            self.closed = true;
            if let ReadSource::Disk(shard) = &mut self.source {
                shard.file = None;
            }
        }
    }
}

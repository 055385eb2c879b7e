use std::io;

/// Everything that can go wrong while building, training or evaluating.
#[derive(Debug, thiserror::Error)]
pub enum PmfError {
    /// Invalid settings: changed K, shard/worker disagreement, bad prior.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two structures that must share a shape do not.
    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        /// What was being compared
        what: &'static str,
        /// Size required by the reference structure
        expected: usize,
        /// Size actually found
        found: usize,
    },

    /// Group index outside `0..group_count`.
    #[error("group index {index} out of range ({count} groups)")]
    OutOfBounds {
        /// Requested group
        index: usize,
        /// Number of groups in the store
        count: usize,
    },

    /// Stored data violates an invariant.
    #[error("integrity error at position {position}: {reason}")]
    Integrity {
        /// Offending record / index position
        position: usize,
        /// Human readable description
        reason: String,
    },

    /// Operation called on a store or cache that is not ready for it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Reader asked for more responsibility vectors than were written.
    #[error("read past end of responsibility shard {shard}: {written} elements written")]
    ReadPastEnd {
        /// Shard being read
        shard: usize,
        /// Number of elements available
        written: usize,
    },

    /// Writer asked for more slots than the in-memory shape holds.
    #[error("write past end of responsibility shard {shard}: capacity {capacity}")]
    CacheOverrun {
        /// Shard being written
        shard: usize,
        /// Number of slots in the shard
        capacity: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("snapshot decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PmfError>;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod grouped;
pub mod history;
pub mod metrics;
pub mod model;
pub mod train;

pub use cache::{ReadSession, ResponsibilityCache, WriteSession};
pub use common::WorkPartition;
pub use config::{CacheConfig, TrainConfig};
pub use error::{PmfError, Result};
pub use grouped::GroupedStore;
pub use history::{History, Record};
pub use metrics::pmf_logloss;
pub use model::{Model, Param, Prior};
pub use train::{IterationReport, ProgressSink, TracingProgress, TrainingEngine};

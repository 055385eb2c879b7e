use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PmfError, Result};
use crate::model::Prior;

/// Where responsibilities live during an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shard file prefix; `None` keeps phi in memory.
    pub path: Option<PathBuf>,
    /// K-vectors held per shard ring buffer.
    pub buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            buffer_size: 1 << 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Latent dimension K.
    pub factors: usize,
    pub prior: Prior,
    pub iterations: usize,
    /// Worker threads (and disk shards); 0 means one per core.
    pub workers: usize,
    pub seed: u64,
    /// Share of observations held out for evaluation.
    pub holdout_fraction: f64,
    pub cache: CacheConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            factors: 10,
            prior: Prior::default(),
            iterations: 20,
            workers: 0,
            seed: 42,
            holdout_fraction: 0.0,
            cache: CacheConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: TrainConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.factors == 0 {
            return Err(PmfError::Configuration("factors must be at least 1".into()));
        }
        self.prior.validate()?;
        if !(0.0..1.0).contains(&self.holdout_fraction) {
            return Err(PmfError::Configuration(format!(
                "holdout_fraction {} outside [0, 1)",
                self.holdout_fraction
            )));
        }
        if self.cache.buffer_size == 0 {
            return Err(PmfError::Configuration("cache.buffer_size must be at least 1".into()));
        }
        Ok(())
    }
}

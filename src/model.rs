//! Gamma posterior parameters for every user and item.

use std::io::{Read, Write};

use faer::Mat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PmfError, Result};

/// Users initialized per RNG stream; keeps the warm start independent of
/// the thread count.
const INIT_CHUNK: usize = 4096;

/// Gamma hyperparameters: `a1, a2, b2` for user activity, `c1, c2, d2` for
/// item popularity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub a1: f64,
    pub a2: f64,
    pub b2: f64,
    pub c1: f64,
    pub c2: f64,
    pub d2: f64,
}

impl Default for Prior {
    fn default() -> Self {
        Self {
            a1: 0.3,
            a2: 0.3,
            b2: 1.0,
            c1: 0.3,
            c2: 0.3,
            d2: 1.0,
        }
    }
}

impl Prior {
    pub fn new(a1: f64, a2: f64, b2: f64, c1: f64, c2: f64, d2: f64) -> Result<Self> {
        let prior = Self { a1, a2, b2, c1, c2, d2 };
        prior.validate()?;
        Ok(prior)
    }

    pub fn validate(&self) -> Result<()> {
        let named = [
            ("a1", self.a1),
            ("a2", self.a2),
            ("b2", self.b2),
            ("c1", self.c1),
            ("c2", self.c2),
            ("d2", self.d2),
        ];
        for (name, value) in named {
            if !(value.is_finite() && value > 0.0) {
                return Err(PmfError::Configuration(format!(
                    "prior {name} must be positive and finite, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Natural parameters of one user's (or item's) Gamma posteriors.
/// Field order is the snapshot order: rates before shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub(crate) rate1: Box<[f64]>,
    pub(crate) shape1: Box<[f64]>,
    pub(crate) rate2: f64,
    pub(crate) shape2: f64,
}

impl Param {
    pub fn new(k: usize) -> Self {
        Self {
            rate1: vec![0.0; k].into_boxed_slice(),
            shape1: vec![0.0; k].into_boxed_slice(),
            rate2: 0.0,
            shape2: 0.0,
        }
    }

    pub fn from_parts(shape1: Vec<f64>, rate1: Vec<f64>, shape2: f64, rate2: f64) -> Result<Self> {
        if shape1.len() != rate1.len() {
            return Err(PmfError::Configuration(format!(
                "shape1 has {} factors but rate1 has {}",
                shape1.len(),
                rate1.len()
            )));
        }
        Ok(Self {
            rate1: rate1.into_boxed_slice(),
            shape1: shape1.into_boxed_slice(),
            rate2,
            shape2,
        })
    }

    pub fn k(&self) -> usize {
        self.shape1.len()
    }

    pub fn shape1(&self) -> &[f64] {
        &self.shape1
    }

    pub fn rate1(&self) -> &[f64] {
        &self.rate1
    }

    pub fn shape2(&self) -> f64 {
        self.shape2
    }

    pub fn rate2(&self) -> f64 {
        self.rate2
    }

    /// Posterior mean `shape1[k] / rate1[k]` of each latent factor.
    pub fn scores(&self) -> Vec<f64> {
        self.shape1.iter().zip(self.rate1.iter()).map(|(s, r)| s / r).collect()
    }

    #[inline]
    pub(crate) fn add_scores_to(&self, acc: &mut [f64]) {
        for ((a, s), r) in acc.iter_mut().zip(self.shape1.iter()).zip(self.rate1.iter()) {
            *a += s / r;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    k: usize,
    prior: Prior,
    users: Vec<Param>,
    items: Vec<Param>,
}

fn jitter(rng: &mut ChaCha8Rng) -> f64 {
    rng.random_range(0.9..1.1)
}

/// Prior means scaled by a uniform factor in [0.9, 1.1): a cheap warm start,
/// not a Gamma draw.
fn init_side(params: &mut [Param], shape: f64, rate: f64, shape2: f64, rate2: f64, seed: u64, side: u64) {
    params
        .par_chunks_mut(INIT_CHUNK)
        .enumerate()
        .for_each(|(chunk, block)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(chunk as u64 * 2 + side);
            for p in block.iter_mut() {
                p.shape2 = shape2;
                p.rate2 = rate2 * jitter(&mut rng);
                for (s, r) in p.shape1.iter_mut().zip(p.rate1.iter_mut()) {
                    *s = shape * jitter(&mut rng);
                    *r = rate * jitter(&mut rng);
                }
            }
        });
}

impl Model {
    pub fn initialize(prior: Prior, k: usize, user_count: usize, item_count: usize, seed: u64) -> Result<Self> {
        prior.validate()?;
        if k == 0 {
            return Err(PmfError::Configuration("latent dimension K must be at least 1".into()));
        }
        let mut users = vec![Param::new(k); user_count];
        let mut items = vec![Param::new(k); item_count];
        let kf = k as f64;
        rayon::join(
            || {
                init_side(
                    &mut users,
                    prior.a1,
                    prior.b2,
                    prior.a2 + kf * prior.a1,
                    prior.a2 / prior.b2,
                    seed,
                    0,
                )
            },
            || {
                init_side(
                    &mut items,
                    prior.c1,
                    prior.d2,
                    prior.c2 + kf * prior.c1,
                    prior.c2 / prior.d2,
                    seed,
                    1,
                )
            },
        );
        Ok(Self { k, prior, users, items })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn users(&self) -> &[Param] {
        &self.users
    }

    pub fn items(&self) -> &[Param] {
        &self.items
    }

    pub fn user_param(&self, u: usize) -> Result<&Param> {
        self.users.get(u).ok_or(PmfError::OutOfBounds {
            index: u,
            count: self.users.len(),
        })
    }

    pub fn item_param(&self, i: usize) -> Result<&Param> {
        self.items.get(i).ok_or(PmfError::OutOfBounds {
            index: i,
            count: self.items.len(),
        })
    }

    fn check_k(&self, param: &Param) -> Result<()> {
        if param.k() != self.k || param.rate1.len() != self.k {
            return Err(PmfError::Configuration(format!(
                "param has {} factors but the model has K = {}",
                param.k(),
                self.k
            )));
        }
        Ok(())
    }

    pub fn replace_user_param(&mut self, u: usize, param: Param) -> Result<()> {
        self.check_k(&param)?;
        let count = self.users.len();
        let slot = self.users.get_mut(u).ok_or(PmfError::OutOfBounds { index: u, count })?;
        *slot = param;
        Ok(())
    }

    pub fn replace_item_param(&mut self, i: usize, param: Param) -> Result<()> {
        self.check_k(&param)?;
        let count = self.items.len();
        let slot = self.items.get_mut(i).ok_or(PmfError::OutOfBounds { index: i, count })?;
        *slot = param;
        Ok(())
    }

    pub fn user_scores(&self, u: usize) -> Result<Vec<f64>> {
        Ok(self.user_param(u)?.scores())
    }

    pub fn item_scores(&self, i: usize) -> Result<Vec<f64>> {
        Ok(self.item_param(i)?.scores())
    }

    /// Dense `[user_count x K]` matrix of posterior means.
    pub fn export_user_scores(&self) -> Mat<f64> {
        export_scores(&self.users, self.k)
    }

    /// Dense `[item_count x K]` matrix of posterior means.
    pub fn export_item_scores(&self) -> Mat<f64> {
        export_scores(&self.items, self.k)
    }

    /// Prior plus disjoint mutable views of both parameter sides.
    pub(crate) fn parts_mut(&mut self) -> (Prior, &mut [Param], &mut [Param]) {
        (self.prior, &mut self.users, &mut self.items)
    }

    /// Snapshot: K, prior, user params, item params, in that order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        bincode::serde::encode_into_std_write(self, writer, bincode::config::standard())?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let model: Model = bincode::serde::decode_from_std_read(reader, bincode::config::standard())?;
        model.validate()?;
        Ok(model)
    }

    /// Every param must carry exactly K factors.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(PmfError::Configuration("latent dimension K must be at least 1".into()));
        }
        self.prior.validate()?;
        for (position, p) in self.users.iter().chain(self.items.iter()).enumerate() {
            if p.shape1.len() != self.k || p.rate1.len() != self.k {
                return Err(PmfError::Integrity {
                    position,
                    reason: format!(
                        "param carries {}/{} factors, snapshot K is {}",
                        p.shape1.len(),
                        p.rate1.len(),
                        self.k
                    ),
                });
            }
        }
        Ok(())
    }
}

/// `Σ_p shape1[k] / rate1[k]` over a whole side, with per-task partials.
pub(crate) fn score_sums(params: &[Param], k: usize) -> Vec<f64> {
    params
        .par_iter()
        .fold(
            || vec![0.0f64; k],
            |mut acc, p| {
                p.add_scores_to(&mut acc);
                acc
            },
        )
        .reduce(
            || vec![0.0f64; k],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(&b) {
                    *x += y;
                }
                a
            },
        )
}

fn export_scores(params: &[Param], k: usize) -> Mat<f64> {
    let mut flat = vec![0.0f64; params.len() * k];
    flat.par_chunks_mut(k.max(1))
        .zip(params.par_iter())
        .for_each(|(row, p)| {
            for ((o, s), r) in row.iter_mut().zip(p.shape1.iter()).zip(p.rate1.iter()) {
                *o = s / r;
            }
        });
    Mat::from_fn(params.len(), k, |i, j| flat[i * k + j])
}

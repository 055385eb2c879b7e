//! Variational EM sweep over a grouped history.
//!
//! One iteration = E-step (phi for every observation, streamed into the
//! responsibility cache) followed by the user-side and item-side M-steps,
//! each of which streams phi back in the same order it was written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use statrs::function::gamma::digamma;
use tracing::{debug, info};

use crate::cache::{ReadSession, ResponsibilityCache, WriteSession};
use crate::common::{split_by_bounds_mut, WorkPartition};
use crate::config::CacheConfig;
use crate::error::{PmfError, Result};
use crate::history::History;
use crate::metrics::pmf_logloss;
use crate::model::{score_sums, Model, Param, Prior};

pub const PHASE_RESPONSIBILITIES: &str = "computing responsibilities";
pub const PHASE_USERS: &str = "updating users";
pub const PHASE_ITEMS: &str = "updating items";

/// Receives plain status strings at phase boundaries.
pub trait ProgressSink {
    fn report(&mut self, status: &str);
}

impl<F> ProgressSink for F
where
    F: FnMut(&str),
{
    fn report(&mut self, status: &str) {
        self(status)
    }
}

/// Forwards phase changes to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&mut self, status: &str) {
        info!("{status}");
    }
}

// ---- Atomic f64 accumulation for the item-side scatter ---------------------

struct AtomicF64Buf {
    data: Vec<AtomicU64>,
}

impl AtomicF64Buf {
    fn filled(n: usize, value: f64) -> Self {
        let data = (0..n).map(|_| AtomicU64::new(value.to_bits())).collect();
        Self { data }
    }

    #[inline(always)]
    fn add(&self, idx: usize, val: f64) {
        let atomic = &self.data[idx];
        let mut cur = atomic.load(Ordering::Relaxed);
        loop {
            let new = (f64::from_bits(cur) + val).to_bits();
            match atomic.compare_exchange_weak(cur, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(x) => cur = x,
            }
        }
    }

    #[inline(always)]
    fn load(&self, idx: usize) -> f64 {
        f64::from_bits(self.data[idx].load(Ordering::Relaxed))
    }
}

// ---- E-step ----------------------------------------------------------------

/// `E[ln x_k] = ψ(shape1[k]) − ln rate1[k]` for every param, row-major.
fn expected_logs(params: &[Param], k: usize) -> Vec<f64> {
    let mut out = vec![0.0f64; params.len() * k];
    out.par_chunks_mut(k)
        .zip(params.par_iter())
        .for_each(|(row, p)| fill_expected_log(p, row));
    out
}

#[inline]
fn fill_expected_log(p: &Param, out: &mut [f64]) {
    for ((o, &s), &r) in out.iter_mut().zip(p.shape1.iter()).zip(p.rate1.iter()) {
        *o = digamma(s) - r.ln();
    }
}

/// `phi ∝ exp(user + item)`, normalized; max-shifted so large K stays finite.
#[inline]
fn normalized_responsibility(user: &[f64], item: &[f64], phi: &mut [f64]) {
    let mut max = f64::NEG_INFINITY;
    for ((p, a), b) in phi.iter_mut().zip(user).zip(item) {
        *p = a + b;
        max = max.max(*p);
    }
    let mut sum = 0.0;
    for p in phi.iter_mut() {
        *p = (*p - max).exp();
        sum += *p;
    }
    for p in phi.iter_mut() {
        *p /= sum;
    }
}

fn compute_responsibilities(
    model: &Model,
    history: &History,
    partition: &WorkPartition,
    sessions: Vec<WriteSession<'_>>,
) -> Result<()> {
    let k = model.k();
    let users = model.users();
    let item_log = expected_logs(model.items(), k);
    let store = history.store();

    sessions
        .into_par_iter()
        .enumerate()
        .try_for_each(|(w, mut session)| {
            let mut user_log = vec![0.0f64; k];
            for u in partition.range(w) {
                fill_expected_log(&users[u], &mut user_log);
                for rec in store.group(u) {
                    let start = rec.item as usize * k;
                    let phi = session.next_write_slot()?;
                    normalized_responsibility(&user_log, &item_log[start..start + k], phi);
                }
            }
            session.close().map(|_| ())
        })
}

// ---- M-step ----------------------------------------------------------------

fn update_users(
    prior: &Prior,
    users: &mut [Param],
    item_sum: &[f64],
    history: &History,
    partition: &WorkPartition,
    sessions: Vec<ReadSession<'_>>,
) -> Result<()> {
    let store = history.store();
    let base_rate2 = prior.a2 / prior.b2;
    let chunks = split_by_bounds_mut(users, partition.bounds());

    chunks
        .into_par_iter()
        .zip(sessions.into_par_iter())
        .enumerate()
        .try_for_each(|(w, (params, mut session))| {
            let first = partition.bounds()[w];
            for (offset, p) in params.iter_mut().enumerate() {
                // activity mean from the previous iteration's rate2
                let activity = p.shape2 / p.rate2;
                p.shape1.fill(prior.a1);
                for (r, s) in p.rate1.iter_mut().zip(item_sum) {
                    *r = s + activity;
                }
                for rec in store.group(first + offset) {
                    let phi = session.next_read_slot()?;
                    let y = rec.count as f64;
                    for (s, f) in p.shape1.iter_mut().zip(phi) {
                        *s += y * f;
                    }
                }
                p.rate2 = base_rate2 + p.shape1.iter().zip(p.rate1.iter()).map(|(s, r)| s / r).sum::<f64>();
            }
            session.close().map(|_| ())
        })
}

fn update_items(
    prior: &Prior,
    users: &[Param],
    items: &mut [Param],
    k: usize,
    history: &History,
    partition: &WorkPartition,
    sessions: Vec<ReadSession<'_>>,
) -> Result<()> {
    // users are already updated at this point
    let user_sum = score_sums(users, k);
    items.par_iter_mut().for_each(|p| {
        let popularity = p.shape2 / p.rate2;
        for (r, s) in p.rate1.iter_mut().zip(&user_sum) {
            *r = s + popularity;
        }
    });

    // Several users can hit the same item concurrently.
    let shape = AtomicF64Buf::filled(items.len() * k, prior.c1);
    let store = history.store();
    sessions
        .into_par_iter()
        .enumerate()
        .try_for_each(|(w, mut session)| {
            for u in partition.range(w) {
                for rec in store.group(u) {
                    let phi = session.next_read_slot()?;
                    let y = rec.count as f64;
                    let base = rec.item as usize * k;
                    for (j, f) in phi.iter().enumerate() {
                        shape.add(base + j, y * f);
                    }
                }
            }
            session.close().map(|_| ())
        })?;

    let base_rate2 = prior.c2 / prior.d2;
    items.par_iter_mut().enumerate().for_each(|(i, p)| {
        for (j, s) in p.shape1.iter_mut().enumerate() {
            *s = shape.load(i * k + j);
        }
        p.rate2 = base_rate2 + p.shape1.iter().zip(p.rate1.iter()).map(|(s, r)| s / r).sum::<f64>();
    });
    Ok(())
}

// ---- Engine ----------------------------------------------------------------

/// Per-iteration summary produced by [`TrainingEngine::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub elapsed: Duration,
    pub train_loss: f64,
    pub holdout_loss: Option<f64>,
}

/// Fixed worker pool plus the user partition derived from it. The disk
/// cache must have exactly one shard per worker.
pub struct TrainingEngine {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl TrainingEngine {
    /// `workers == 0` picks one worker per available core.
    pub fn new(workers: usize) -> Result<Self> {
        let workers = if workers == 0 {
            rayon::current_num_threads()
        } else {
            workers
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("pmf-worker-{i}"))
            .build()?;
        debug!(workers, "training pool ready");
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn check_model(&self, model: &Model, history: &History) -> Result<()> {
        if model.user_count() != history.user_count() {
            return Err(PmfError::ShapeMismatch {
                what: "model users vs history groups",
                expected: history.user_count(),
                found: model.user_count(),
            });
        }
        if model.item_count() != history.item_count() {
            return Err(PmfError::ShapeMismatch {
                what: "model items vs history item space",
                expected: history.item_count(),
                found: model.item_count(),
            });
        }
        Ok(())
    }

    fn check_cache(&self, model: &Model, history: &History, cache: &ResponsibilityCache) -> Result<()> {
        if let Some(shards) = cache.shard_count() {
            if shards != self.workers {
                return Err(PmfError::Configuration(format!(
                    "disk cache has {shards} shards but the engine runs {} workers",
                    self.workers
                )));
            }
        }
        if cache.k() != model.k() {
            return Err(PmfError::ShapeMismatch {
                what: "phi dimension",
                expected: model.k(),
                found: cache.k(),
            });
        }
        cache.check_shape(history)
    }

    /// Cache shaped like `history`; on disk when `config.path` is set, with
    /// one shard per worker.
    pub fn initialize_cache(&self, model: &Model, history: &History, config: &CacheConfig) -> Result<ResponsibilityCache> {
        self.check_model(model, history)?;
        ResponsibilityCache::from_config(history, model.k(), config, self.workers)
    }

    /// One full variational EM iteration. On error the model may be partly
    /// updated and should be restored from a snapshot.
    pub fn train_once(
        &self,
        model: &mut Model,
        history: &History,
        cache: &mut ResponsibilityCache,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        self.check_model(model, history)?;
        self.check_cache(model, history, cache)?;
        let partition = WorkPartition::even(history.user_count(), self.workers);
        let k = model.k();

        sink.report(PHASE_RESPONSIBILITIES);
        let t = Instant::now();
        self.pool.install(|| {
            let sessions = cache.open_for_write(&partition)?;
            compute_responsibilities(model, history, &partition, sessions)
        })?;
        debug!(elapsed_ms = t.elapsed().as_millis() as u64, phi = cache.total_size(), "E-step done");

        let (prior, users, items) = model.parts_mut();

        sink.report(PHASE_USERS);
        let t = Instant::now();
        self.pool.install(|| {
            let item_sum = score_sums(items, k);
            let sessions = cache.open_for_read(&partition)?;
            update_users(&prior, users, &item_sum, history, &partition, sessions)
        })?;
        debug!(elapsed_ms = t.elapsed().as_millis() as u64, "user M-step done");

        sink.report(PHASE_ITEMS);
        let t = Instant::now();
        self.pool.install(|| {
            let sessions = cache.open_for_read(&partition)?;
            update_items(&prior, users, items, k, history, &partition, sessions)
        })?;
        debug!(elapsed_ms = t.elapsed().as_millis() as u64, "item M-step done");
        Ok(())
    }

    /// Negated Poisson log-likelihood; lower is better.
    pub fn evaluate(&self, model: &Model, history: &History) -> Result<f64> {
        self.pool.install(|| pmf_logloss(model, history))
    }

    /// Run `iterations` sweeps, scoring the training (and optional held-out)
    /// history after each one.
    pub fn fit(
        &self,
        model: &mut Model,
        history: &History,
        cache: &mut ResponsibilityCache,
        iterations: usize,
        holdout: Option<&History>,
        sink: &mut dyn ProgressSink,
    ) -> Result<Vec<IterationReport>> {
        info!(
            users = model.user_count(),
            items = model.item_count(),
            nnz = history.nnz(),
            k = model.k(),
            workers = self.workers,
            disk = cache.is_disk(),
            "training"
        );
        let mut reports = Vec::with_capacity(iterations);
        for iteration in 1..=iterations {
            let t = Instant::now();
            self.train_once(model, history, cache, sink)?;
            let elapsed = t.elapsed();
            let train_loss = self.evaluate(model, history)?;
            let holdout_loss = holdout.map(|h| self.evaluate(model, h)).transpose()?;
            info!(
                iteration,
                train_loss,
                holdout_loss = holdout_loss.unwrap_or(f64::NAN),
                secs = elapsed.as_secs_f64(),
                "iteration done"
            );
            reports.push(IterationReport {
                iteration,
                elapsed,
                train_loss,
                holdout_loss,
            });
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Record;
    use approx::assert_relative_eq;

    fn unit_prior() -> Prior {
        Prior::new(1.0, 1.0, 1.0, 1.0, 1.0, 1.0).unwrap()
    }

    fn quiet() -> impl FnMut(&str) {
        |_: &str| {}
    }

    #[test]
    fn responsibility_is_normalized_softmax() {
        let mut phi = [0.0; 3];
        normalized_responsibility(&[0.0, 1.0, 2.0], &[0.0, 0.0, 0.0], &mut phi);
        let z = 1.0 + 1f64.exp() + 2f64.exp();
        assert_relative_eq!(phi[0], 1.0 / z, epsilon = 1e-12);
        assert_relative_eq!(phi[2], 2f64.exp() / z, epsilon = 1e-12);
        assert_relative_eq!(phi.iter().sum::<f64>(), 1.0, epsilon = 1e-12);

        // shift-invariant, stays finite for huge exponents
        normalized_responsibility(&[800.0, 801.0, 802.0], &[0.0, 0.0, 0.0], &mut phi);
        assert_relative_eq!(phi[2], 2f64.exp() / z, epsilon = 1e-12);
    }

    #[test]
    fn atomic_buffer_accumulates_across_threads() {
        let buf = AtomicF64Buf::filled(4, 1.0);
        (0..1000).into_par_iter().for_each(|i| buf.add(i % 4, 0.5));
        for j in 0..4 {
            assert_eq!(buf.load(j), 1.0 + 125.0);
        }
    }

    #[test]
    fn single_observation_moves_scores_up() {
        let history = History::from_groups(vec![vec![Record::new(0, 5)]], 1).unwrap();
        let mut model = Model::initialize(unit_prior(), 1, 1, 1, 17).unwrap();
        let user_before = model.user_scores(0).unwrap()[0];
        let item_before = model.item_scores(0).unwrap()[0];

        let engine = TrainingEngine::new(1).unwrap();
        let mut cache = engine.initialize_cache(&model, &history, &CacheConfig::default()).unwrap();
        let mut statuses = Vec::new();
        engine
            .train_once(&mut model, &history, &mut cache, &mut |s: &str| statuses.push(s.to_string()))
            .unwrap();
        assert_eq!(statuses, vec![PHASE_RESPONSIBILITIES, PHASE_USERS, PHASE_ITEMS]);

        let user = &model.users()[0];
        let item = &model.items()[0];
        // K = 1: phi is exactly 1, so shape1 = prior + count
        assert_relative_eq!(user.shape1()[0], 6.0, epsilon = 1e-12);
        assert_relative_eq!(item.shape1()[0], 6.0, epsilon = 1e-12);
        assert!(model.user_scores(0).unwrap()[0] > user_before);
        assert!(model.item_scores(0).unwrap()[0] > item_before);
        assert_relative_eq!(user.rate2(), 1.0 + user.shape1()[0] / user.rate1()[0], epsilon = 1e-12);

        let loss = engine.evaluate(&model, &history).unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn user_rate_uses_previous_rate2() {
        let history = History::from_groups(vec![vec![Record::new(0, 2)], vec![]], 1).unwrap();
        let mut model = Model::initialize(unit_prior(), 2, 2, 1, 3).unwrap();
        let before = model.clone();
        let item_sum = score_sums(before.items(), 2);

        let engine = TrainingEngine::new(2).unwrap();
        let mut cache = engine.initialize_cache(&model, &history, &CacheConfig::default()).unwrap();
        engine.train_once(&mut model, &history, &mut cache, &mut quiet()).unwrap();

        // user 1 has no observations: shape1 falls back to the prior
        let idle = &model.users()[1];
        let old = &before.users()[1];
        assert_eq!(idle.shape1(), &[1.0, 1.0]);
        for k in 0..2 {
            assert_relative_eq!(idle.rate1()[k], item_sum[k] + old.shape2() / old.rate2(), epsilon = 1e-12);
        }
        // phi sums to one, so the total added mass equals the count
        let active = &model.users()[0];
        assert_relative_eq!(active.shape1().iter().sum::<f64>(), 2.0 + 2.0, epsilon = 1e-12);
    }

    #[test]
    fn item_rate_uses_updated_users() {
        let history = History::from_groups(
            vec![vec![Record::new(0, 3), Record::new(1, 1)], vec![Record::new(1, 4)]],
            3,
        )
        .unwrap();
        let mut model = Model::initialize(unit_prior(), 2, 2, 3, 8).unwrap();
        let before = model.clone();
        let engine = TrainingEngine::new(2).unwrap();
        let mut cache = engine.initialize_cache(&model, &history, &CacheConfig::default()).unwrap();
        engine.train_once(&mut model, &history, &mut cache, &mut quiet()).unwrap();

        let user_sum = score_sums(model.users(), 2);
        let untouched = &model.items()[2];
        let old = &before.items()[2];
        assert_eq!(untouched.shape1(), &[1.0, 1.0]);
        for k in 0..2 {
            assert_relative_eq!(untouched.rate1()[k], user_sum[k] + old.shape2() / old.rate2(), epsilon = 1e-12);
        }
        assert_relative_eq!(model.items()[1].shape1().iter().sum::<f64>(), 2.0 + 5.0, epsilon = 1e-12);
    }

    #[test]
    fn shape_mismatch_fails_before_work() {
        let history = History::from_groups(vec![vec![Record::new(0, 1)]], 1).unwrap();
        let mut model = Model::initialize(unit_prior(), 2, 2, 1, 0).unwrap();
        let engine = TrainingEngine::new(1).unwrap();
        assert!(matches!(
            engine.initialize_cache(&model, &history, &CacheConfig::default()),
            Err(PmfError::ShapeMismatch { .. })
        ));
        let mut cache = ResponsibilityCache::in_memory(&history, 2).unwrap();
        let untouched = model.clone();
        assert!(engine.train_once(&mut model, &history, &mut cache, &mut quiet()).is_err());
        assert_eq!(model, untouched);
    }

    #[test]
    fn cache_dimension_must_match_model() {
        let history = History::from_groups(vec![vec![Record::new(0, 1)]], 1).unwrap();
        let mut model = Model::initialize(unit_prior(), 2, 1, 1, 0).unwrap();
        let engine = TrainingEngine::new(1).unwrap();
        let mut cache = ResponsibilityCache::in_memory(&history, 3).unwrap();
        assert!(matches!(
            engine.train_once(&mut model, &history, &mut cache, &mut quiet()),
            Err(PmfError::ShapeMismatch { what: "phi dimension", .. })
        ));
    }

    #[test]
    fn disk_shards_must_match_workers() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_groups(vec![vec![Record::new(0, 1)], vec![]], 1).unwrap();
        let mut model = Model::initialize(unit_prior(), 2, 2, 1, 0).unwrap();
        let engine = TrainingEngine::new(2).unwrap();
        let mut cache = ResponsibilityCache::on_disk(&history, 2, &dir.path().join("phi"), 4, 3).unwrap();
        assert!(matches!(
            engine.train_once(&mut model, &history, &mut cache, &mut quiet()),
            Err(PmfError::Configuration(_))
        ));
    }

    #[test]
    fn shard_io_error_aborts_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_groups(vec![vec![Record::new(0, 2)], vec![Record::new(1, 1)]], 2).unwrap();
        let mut model = Model::initialize(unit_prior(), 2, 2, 2, 0).unwrap();
        let untouched = model.clone();
        let engine = TrainingEngine::new(2).unwrap();
        let config = CacheConfig {
            path: Some(dir.path().join("missing").join("phi")),
            buffer_size: 4,
        };
        let mut cache = engine.initialize_cache(&model, &history, &config).unwrap();

        let mut statuses = Vec::new();
        let result = engine.train_once(&mut model, &history, &mut cache, &mut |s: &str| statuses.push(s.to_string()));
        assert!(matches!(result, Err(PmfError::Io(_))));
        assert_eq!(statuses, vec![PHASE_RESPONSIBILITIES]);
        assert_eq!(model, untouched);
    }

    #[test]
    fn fit_reports_each_iteration() {
        let history = History::from_groups(
            vec![
                vec![Record::new(0, 3), Record::new(2, 1)],
                vec![Record::new(1, 2)],
                vec![Record::new(0, 1), Record::new(1, 1), Record::new(2, 6)],
            ],
            3,
        )
        .unwrap();
        let mut model = Model::initialize(Prior::default(), 2, 3, 3, 5).unwrap();
        let engine = TrainingEngine::new(2).unwrap();
        let mut cache = engine.initialize_cache(&model, &history, &CacheConfig::default()).unwrap();
        let reports = engine
            .fit(&mut model, &history, &mut cache, 4, Some(&history), &mut TracingProgress)
            .unwrap();
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[3].iteration, 4);
        assert!(reports.iter().all(|r| r.train_loss.is_finite()));
        let held = reports[0].holdout_loss.unwrap();
        assert_relative_eq!(held, reports[0].train_loss, max_relative = 1e-12);
    }
}

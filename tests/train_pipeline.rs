use std::io::Write;

use approx::assert_relative_eq;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusket_pmf::{
    CacheConfig, History, Model, PmfError, Prior, Record, ResponsibilityCache, TrainConfig, TrainingEngine,
};

fn toy_history() -> History {
    let groups = (0..23usize)
        .map(|u| {
            (0..(u % 5))
                .map(|j| Record::new(((u * 7 + j * 3) % 11) as u32, (1 + (u + j) % 4) as i32))
                .collect()
        })
        .collect();
    History::from_groups(groups, 11).unwrap()
}

fn quiet() -> impl FnMut(&str) {
    |_: &str| {}
}

fn assert_models_close(a: &Model, b: &Model) {
    for (p, q) in a.users().iter().chain(a.items()).zip(b.users().iter().chain(b.items())) {
        for (x, y) in p.shape1().iter().zip(q.shape1()) {
            assert_relative_eq!(x, y, max_relative = 1e-9);
        }
        for (x, y) in p.rate1().iter().zip(q.rate1()) {
            assert_relative_eq!(x, y, max_relative = 1e-9);
        }
        assert_relative_eq!(p.rate2(), q.rate2(), max_relative = 1e-9);
    }
}

#[test]
fn disk_cache_trains_like_memory_cache() {
    let history = toy_history();
    history.check().unwrap();
    let engine = TrainingEngine::new(3).unwrap();
    let start = Model::initialize(Prior::default(), 4, history.user_count(), history.item_count(), 99).unwrap();

    let mut in_memory = start.clone();
    let mut cache = engine
        .initialize_cache(&in_memory, &history, &CacheConfig::default())
        .unwrap();
    engine.fit(&mut in_memory, &history, &mut cache, 3, None, &mut quiet()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let disk_config = CacheConfig {
        path: Some(dir.path().join("phi")),
        buffer_size: 3,
    };
    let mut on_disk = start.clone();
    let mut cache = engine.initialize_cache(&on_disk, &history, &disk_config).unwrap();
    assert!(cache.is_disk());
    engine.fit(&mut on_disk, &history, &mut cache, 3, None, &mut quiet()).unwrap();

    assert_models_close(&in_memory, &on_disk);
    drop(cache);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn training_lowers_the_loss() {
    let history = toy_history();
    let engine = TrainingEngine::new(2).unwrap();
    let mut model = Model::initialize(Prior::default(), 3, history.user_count(), history.item_count(), 1).unwrap();
    let before = engine.evaluate(&model, &history).unwrap();
    let mut cache = ResponsibilityCache::in_memory(&history, 3).unwrap();
    let reports = engine.fit(&mut model, &history, &mut cache, 10, None, &mut quiet()).unwrap();
    let after = reports.last().unwrap().train_loss;
    assert!(after < before, "loss went from {before} to {after}");
}

#[test]
fn holdout_is_scored_separately() {
    let mut history = toy_history();
    let total = history.check().unwrap();
    let holdout = history.split_holdout(0.25, 4).unwrap();
    assert_eq!(history.check().unwrap() + holdout.check().unwrap(), total);

    let config = TrainConfig::from_json(r#"{ "factors": 2, "iterations": 2, "workers": 2 }"#).unwrap();
    let engine = TrainingEngine::new(config.workers).unwrap();
    let mut model = Model::initialize(
        config.prior,
        config.factors,
        history.user_count(),
        history.item_count(),
        config.seed,
    )
    .unwrap();
    let mut cache = engine.initialize_cache(&model, &history, &config.cache).unwrap();
    let reports = engine
        .fit(&mut model, &history, &mut cache, config.iterations, Some(&holdout), &mut quiet())
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.holdout_loss.is_some_and(f64::is_finite)));
}

#[test]
fn gzip_snapshot_round_trip() {
    let history = toy_history();
    let engine = TrainingEngine::new(2).unwrap();
    let mut model = Model::initialize(Prior::default(), 3, history.user_count(), history.item_count(), 5).unwrap();
    let mut cache = ResponsibilityCache::in_memory(&history, 3).unwrap();
    engine.train_once(&mut model, &history, &mut cache, &mut quiet()).unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    model.write_to(&mut encoder).unwrap();
    encoder.flush().unwrap();
    let bytes = encoder.finish().unwrap();

    let restored = Model::read_from(&mut GzDecoder::new(bytes.as_slice())).unwrap();
    assert_eq!(restored, model);

    let truncated = &bytes[..bytes.len() / 2];
    assert!(Model::read_from(&mut GzDecoder::new(truncated)).is_err());
}

#[test]
fn mismatched_history_is_rejected() {
    let history = toy_history();
    let engine = TrainingEngine::new(1).unwrap();
    let model = Model::initialize(Prior::default(), 2, history.user_count() + 1, history.item_count(), 0).unwrap();
    assert!(matches!(
        engine.initialize_cache(&model, &history, &CacheConfig::default()),
        Err(PmfError::ShapeMismatch { .. })
    ));
    assert!(engine.evaluate(&model, &history).is_err());
}

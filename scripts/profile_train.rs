use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use rusket_pmf::{History, Model, Record, Result, TracingProgress, TrainConfig, TrainingEngine};

/// Train on a synthetic count history and print a per-iteration timing table.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value_t = 10_000)]
    users: usize,
    #[arg(long, default_value_t = 5_000)]
    items: usize,
    #[arg(long, default_value_t = 50)]
    nnz_per_user: usize,
    /// JSON training config; CLI flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    factors: Option<usize>,
    #[arg(long)]
    iterations: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    /// Keep phi on disk under a temporary directory.
    #[arg(long)]
    disk: bool,
    /// Write the trained model here.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn synthetic_history(n_users: usize, n_items: usize, nnz_per_user: usize, seed: u64) -> Result<History> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let per_user = nnz_per_user.min(n_items);
    let groups = (0..n_users)
        .map(|u| {
            (0..per_user)
                .map(|j| Record::new(((u + j * 97) % n_items) as u32, rng.random_range(1..=5)))
                .collect()
        })
        .collect();
    History::from_groups(groups, n_items)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => TrainConfig::default(),
    };
    if let Some(k) = args.factors {
        config.factors = k;
    }
    if let Some(n) = args.iterations {
        config.iterations = n;
    }
    if let Some(w) = args.workers {
        config.workers = w;
    }
    let scratch = tempfile::tempdir()?;
    if args.disk {
        config.cache.path = Some(scratch.path().join("phi"));
    }
    config.validate()?;

    let s0 = Instant::now();
    let mut history = synthetic_history(args.users, args.items, args.nnz_per_user, config.seed)?;
    let visits = history.check()?;
    let holdout = if config.holdout_fraction > 0.0 {
        Some(history.split_holdout(config.holdout_fraction, config.seed)?)
    } else {
        None
    };
    println!(
        "history: {} users, {} items, {} records, {} visits ({:.3}s)",
        history.user_count(),
        history.item_count(),
        history.nnz(),
        visits,
        s0.elapsed().as_secs_f64()
    );

    let engine = TrainingEngine::new(config.workers)?;
    let mut model = Model::initialize(
        config.prior,
        config.factors,
        history.user_count(),
        history.item_count(),
        config.seed,
    )?;
    let mut cache = engine.initialize_cache(&model, &history, &config.cache)?;

    let s0 = Instant::now();
    let reports = engine.fit(
        &mut model,
        &history,
        &mut cache,
        config.iterations,
        holdout.as_ref(),
        &mut TracingProgress,
    )?;
    let total = s0.elapsed().as_secs_f64();

    println!("{:>5} {:>10} {:>16} {:>16}", "iter", "secs", "train loss", "holdout loss");
    for r in &reports {
        let held = r.holdout_loss.map_or_else(|| "-".to_string(), |l| format!("{l:.4}"));
        println!(
            "{:>5} {:>10.3} {:>16.4} {:>16}",
            r.iteration,
            r.elapsed.as_secs_f64(),
            r.train_loss,
            held
        );
    }
    println!(
        "Total fit time: {:.3}s with {} workers ({} cache)",
        total,
        engine.workers(),
        if cache.is_disk() { "disk" } else { "memory" }
    );

    if let Some(path) = &args.snapshot {
        let mut out = BufWriter::new(File::create(path)?);
        model.write_to(&mut out)?;
        out.flush()?;
        println!("snapshot written to {}", path.display());
    }
    Ok(())
}

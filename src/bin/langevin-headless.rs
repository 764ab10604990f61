//! Runs the frame pipeline without a window and reports how far the
//! particle estimate is from the analytic density.
//!
//! Usage:
//!   langevin-headless [--config PATH] [--steps N] [--every N] [--seed N] [--gpu]
//!   langevin-headless --write-config PATH
//!
//! Run with: cargo run --release --bin langevin-headless -- --steps 5000

use anyhow::{Context, bail};
use langevin::{Config, Session, create_backend};
use std::time::Instant;

struct Args {
    config: Option<String>,
    write_config: Option<String>,
    steps: u64,
    every: u64,
    seed: Option<u64>,
    gpu: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        write_config: None,
        steps: 1000,
        every: 100,
        seed: None,
        gpu: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--config" => args.config = Some(value("--config")?),
            "--write-config" => args.write_config = Some(value("--write-config")?),
            "--steps" => args.steps = value("--steps")?.parse().context("--steps")?,
            "--every" => args.every = value("--every")?.parse().context("--every")?,
            "--seed" => args.seed = Some(value("--seed")?.parse().context("--seed")?),
            "--gpu" => args.gpu = true,
            "-h" | "--help" => {
                println!("langevin-headless [--config PATH] [--steps N] [--every N] [--seed N] [--gpu]");
                println!("langevin-headless --write-config PATH");
                std::process::exit(0);
            }
            other => bail!("unknown argument `{other}`"),
        }
    }
    args.every = args.every.max(1);
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = parse_args()?;

    if let Some(path) = &args.write_config {
        Config::default()
            .save(path)
            .with_context(|| format!("writing {path}"))?;
        println!("wrote default config to {path}");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate().context("invalid config")?;

    let backend = create_backend(&config, args.gpu).context("creating backend")?;
    let (width, height) = config.window.extent();
    let mut session = Session::new(&config, backend);

    println!(
        "{} backend, {} particles, {} components, dt {:e}",
        session.backend().name(),
        session.backend().particle_count(),
        session.mixture().count(),
        session.dt()
    );
    println!(
        "{:>8} {:>10} {:>10} {:>10} {:>12} {:>10}",
        "step", "mass", "clipped", "L1", "max |err|", "steps/s"
    );

    let start = Instant::now();
    for step in 1..=args.steps {
        session.advance()?;
        if step % args.every == 0 || step == args.steps {
            session.render(width, height)?;
            let stats = session.estimate_stats()?;
            let rate = step as f64 / start.elapsed().as_secs_f64().max(1e-9);
            println!(
                "{:>8} {:>10} {:>10} {:>10.4} {:>12.4} {:>10.1}",
                step, stats.total_mass, stats.clipped, stats.l1_error, stats.max_abs_error, rate
            );
        }
    }
    Ok(())
}

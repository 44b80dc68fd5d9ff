use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use candle::Device;
use ppg2mel::{Config, Solver, TrainArgs};

#[derive(Parser, Debug)]
#[command(about = "Train the PPG-to-mel decoder")]
struct Args {
    /// Path to the YAML experiment config.
    #[arg(long)]
    config: PathBuf,

    /// Run name; artifacts land under `{ckpdir,logdir}/{name}`.
    #[arg(long, default_value = "ppg2mel")]
    name: String,

    /// Directory for attention plots and other diagnostics.
    #[arg(long, default_value = "log")]
    logdir: PathBuf,

    /// Directory for checkpoints.
    #[arg(long, default_value = "ckpt")]
    ckpdir: PathBuf,

    /// Prefetch depth for the data loaders.
    #[arg(long, default_value_t = 2)]
    njobs: usize,

    /// Shuffle seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    let config = Config::from_yaml(&args.config)?;
    let train_args = TrainArgs {
        name: args.name,
        logdir: args.logdir,
        ckpdir: args.ckpdir,
        njobs: args.njobs,
        seed: args.seed,
    };

    let mut solver = Solver::new(config, train_args, device)?;
    solver.load_data()?;
    solver.set_model()?;
    solver.exec()?;
    Ok(())
}

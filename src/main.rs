// =============================================================================
// Adaptive Traffic-Signal Control — DQN Agent in Rust
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --steps 10000
//   cargo run --release -- eval --model checkpoints --steps 2000

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use traffic_rl::dqn::{AgentConfig, DqnAgent};
use traffic_rl::env::{EnvConfig, RewardConfig, TrafficEnv};
use traffic_rl::eval::run_eval;
use traffic_rl::microsim::MicroSim;
use traffic_rl::train::{TrainConfig, Trainer};

#[derive(Parser)]
#[command(name = "traffic-rl", about = "Adaptive traffic-signal control — DQN agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the signal controller
    Train(TrainArgs),
    /// Run a trained controller greedily and report waiting times
    Eval(EvalArgs),
}

#[derive(Parser)]
struct TrainArgs {
    #[arg(long, default_value = "10000")]
    steps: u64,
    #[arg(long, default_value = "10")]
    min_green: u32,
    #[arg(long, default_value = "3")]
    spawn_period: u64,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long)]
    resume: Option<PathBuf>,
}

#[derive(Parser)]
struct EvalArgs {
    /// Checkpoint directory written by `train`
    #[arg(long)]
    model: PathBuf,
    #[arg(long, default_value = "2000")]
    steps: u64,
    #[arg(long, default_value = "10")]
    min_green: u32,
    #[arg(long, default_value = "3")]
    spawn_period: u64,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — Traffic-Signal DQN Controller (Rust + candle)");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    let env_config = EnvConfig {
        min_green: args.min_green,
        spawn_period: args.spawn_period,
        seed: args.seed,
    };
    let env = TrafficEnv::new(MicroSim::new(), env_config, RewardConfig::default());
    let agent_config = AgentConfig {
        seed: args.seed,
        ..Default::default()
    };
    let agent = DqnAgent::new(&device, agent_config)?;
    let train_config = TrainConfig {
        total_steps: args.steps,
        checkpoint_dir: args.checkpoint_dir.clone(),
        ..Default::default()
    };

    let mut trainer = Trainer::new(env, agent, train_config);
    if let Some(dir) = args.resume.as_ref() {
        trainer.resume(dir)?;
    }
    let history = trainer.run()?;

    eprintln!(
        "✅ Training complete. {} steps, {} decisions, final total wait {:.2}",
        args.steps,
        trainer.decisions(),
        history.last().copied().unwrap_or(0.0)
    );
    Ok(())
}

fn eval(args: &EvalArgs) -> Result<()> {
    let device = select_device(args.cpu);

    let mut agent = DqnAgent::new(&device, AgentConfig::default())?;
    agent.load_from(&args.model)?;

    let env_config = EnvConfig {
        min_green: args.min_green,
        spawn_period: args.spawn_period,
        seed: args.seed,
    };
    let mut env = TrafficEnv::new(MicroSim::new(), env_config, RewardConfig::default());
    let stats = run_eval(&agent, &mut env, args.steps)?;

    eprintln!(
        "Avg total wait {:.2} (final {:.2}) over {} steps, {} decisions",
        stats.avg_total_wait, stats.final_total_wait, stats.steps, stats.decisions
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Eval(args) => eval(args),
    }
}

//! Vote Simulator CLI.
//!
//! Commands:
//! - run: Play battles with simulated viewers and save the results
//! - config: Print the effective kernel config (after scaling)

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vote_kernel::KernelConfig;
use vote_sim::simulation::{scale_config, BattleSimulator, SimulationConfig};

/// Generate a timestamped output path from the given path.
/// e.g., "results.json" -> "results-20260108-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(std::path::Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

#[derive(Parser)]
#[command(name = "vote-sim")]
#[command(version)]
#[command(about = "Simulated viewers voting and bidding through live battles")]
struct Cli {
    /// Kernel config file (.toml or .json); defaults apply otherwise
    #[arg(long, env = "VOTE_KERNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Divide every kernel duration by this
    #[arg(long, default_value = "100")]
    time_scale: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run battles
    Run {
        /// Number of factions
        #[arg(long, default_value = "3")]
        factions: usize,

        /// Viewers per faction
        #[arg(long, default_value = "5")]
        viewers: usize,

        /// Faction abilities per faction
        #[arg(long, default_value = "2")]
        abilities: usize,

        /// Battles to run back to back
        #[arg(long, default_value = "1")]
        battles: usize,

        /// Wall-clock seconds per battle
        #[arg(long, default_value = "3")]
        battle_secs: u64,

        /// Per-step chance a viewer contributes
        #[arg(long, default_value = "0.3")]
        contribute_chance: f64,

        /// Per-step chance a viewer votes while voting is open
        #[arg(long, default_value = "0.4")]
        vote_chance: f64,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Output file for results
        #[arg(long, default_value = "vote-sim.json")]
        output: PathBuf,
    },

    /// Print the kernel config the simulator would run with
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let kernel = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };

    match cli.command {
        Commands::Run {
            factions,
            viewers,
            abilities,
            battles,
            battle_secs,
            contribute_chance,
            vote_chance,
            seed,
            output,
        } => {
            info!(
                factions = factions,
                viewers = viewers,
                battles = battles,
                time_scale = cli.time_scale,
                "Starting simulation"
            );

            let config = SimulationConfig {
                factions,
                viewers_per_faction: viewers,
                abilities_per_faction: abilities,
                battles,
                battle_ms: battle_secs * 1_000,
                time_scale: cli.time_scale,
                contribute_chance: contribute_chance.clamp(0.0, 1.0),
                vote_chance: vote_chance.clamp(0.0, 1.0),
                kernel,
                ..Default::default()
            };
            let result = BattleSimulator::new(config).run(seed).await?;

            let output_path = timestamped_path(&output);
            result.save(&output_path)?;

            println!("\n=== Simulation Complete ===");
            println!("Results saved to: {}", output_path.display());
            println!("Abilities fired: {}", result.total_triggers());
            println!("\nPer-Battle:");
            for line in result.summary_lines() {
                println!("{line}");
            }

            if let Some(last) = result.battles.last() {
                println!("\nFactions (last battle):");
                println!(
                    "  {:>7} {:>12} {:>10} {:>6} {:>5}",
                    "Faction", "Spent", "VotePrice", "Fired", "Won"
                );
                for (index, tally) in &last.factions {
                    println!(
                        "  {:>7} {:>12.2} {:>10.4} {:>6} {:>5}",
                        index, tally.spent, tally.final_vote_price, tally.abilities_fired, tally.rounds_won
                    );
                }
            }
        }

        Commands::Config => {
            let scaled = scale_config(&kernel, cli.time_scale);
            println!("{}", serde_json::to_string_pretty(&scaled)?);
        }
    }

    Ok(())
}

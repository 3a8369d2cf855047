//! vla-synth: episode synthesis for VLA robot datasets
//!
//! Subcommands:
//!
//! - `generate`    -- Generate and archive episodes for a seed range
//! - `sample`      -- Print the tasks sampled for a seed range
//! - `inspect`     -- Summarize an episode archive
//! - `verify`      -- Replay archived episodes and check determinism
//! - `init-config` -- Write the default configuration

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vla_synth::archive::{verify_replay, DatasetInfo, EpisodeArchive};
use vla_synth::config::SynthesisConfig;
use vla_synth::orchestrator::run_generation;
use vla_synth::planner::InterpolatingPlanner;
use vla_synth::scene::{KinematicSim, SceneController};
use vla_synth::task::{TaskKind, TaskSampler};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// vla-synth: generate labeled robot-manipulation episodes
#[derive(Parser)]
#[command(name = "vla-synth", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum TaskChoice {
    Pick,
    PickAndPlace,
    Push,
}

impl From<TaskChoice> for TaskKind {
    fn from(choice: TaskChoice) -> Self {
        match choice {
            TaskChoice::Pick => TaskKind::Pick,
            TaskChoice::PickAndPlace => TaskKind::PickAndPlace,
            TaskChoice::Push => TaskKind::Push,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate episodes and append them to the archive.
    Generate {
        /// Number of episodes (one per seed).
        #[arg(long)]
        episodes: Option<u64>,

        /// First seed of the range.
        #[arg(long)]
        seed_start: Option<u64>,

        /// Dataset directory.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Parallel workers, each with its own engine.
        #[arg(long)]
        workers: Option<usize>,

        /// Restrict sampling to one task type.
        #[arg(long)]
        task_type: Option<TaskChoice>,

        /// Step budget per episode.
        #[arg(long)]
        max_steps: Option<usize>,

        /// Exit with an error when fewer episodes succeed.
        #[arg(long)]
        min_success_fraction: Option<f64>,
    },

    /// Print the tasks the sampler draws for a seed range.
    Sample {
        #[arg(long, default_value_t = 10)]
        count: u64,

        #[arg(long, default_value_t = 0)]
        seed_start: u64,

        #[arg(long)]
        task_type: Option<TaskChoice>,
    },

    /// Summarize an episode archive.
    Inspect {
        /// Dataset directory.
        #[arg(default_value = "data/vla_dataset")]
        path: PathBuf,

        /// Number of index entries to list.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Replay archived episodes and compare against the recording.
    Verify {
        /// Dataset directory.
        #[arg(default_value = "data/vla_dataset")]
        path: PathBuf,

        /// Episode to replay (all episodes if omitted).
        #[arg(long)]
        episode: Option<u64>,

        /// Maximum allowed deviation per joint or position.
        #[arg(long, default_value_t = 1e-9)]
        tolerance: f64,
    },

    /// Write the default configuration as JSON.
    InitConfig {
        #[arg(default_value = "vla_synth.json")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SynthesisConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SynthesisConfig::default(),
    };

    match cli.command {
        Commands::Generate {
            episodes,
            seed_start,
            output,
            workers,
            task_type,
            max_steps,
            min_success_fraction,
        } => {
            let mut config = config;
            if let Some(n) = episodes {
                config.run.num_episodes = n;
            }
            if let Some(s) = seed_start {
                config.run.seed_start = s;
            }
            if let Some(dir) = output {
                config.archive.output_dir = dir;
            }
            if let Some(w) = workers {
                config.run.workers = w;
            }
            if let Some(kind) = task_type {
                config.sampler.only(kind.into());
            }
            if let Some(m) = max_steps {
                config.episode.max_steps = m;
            }
            if let Some(f) = min_success_fraction {
                config.run.min_success_fraction = f;
            }
            cmd_generate(config).await
        }
        Commands::Sample {
            count,
            seed_start,
            task_type,
        } => cmd_sample(config, count, seed_start, task_type),
        Commands::Inspect { path, limit } => cmd_inspect(&path, limit),
        Commands::Verify {
            path,
            episode,
            tolerance,
        } => cmd_verify(&config, &path, episode, tolerance),
        Commands::InitConfig { output, force } => cmd_init_config(&output, force),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_generate(config: SynthesisConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let output = config.archive.output_dir.clone();
    let info = DatasetInfo::new(&config.scene.robot, &config.cameras());
    let archive = Arc::new(
        EpisodeArchive::open_or_create(&output, info)
            .with_context(|| format!("Failed to open archive at {}", output.display()))?,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current step");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let start = config.run.seed_start;
    let seeds = start..start.saturating_add(config.run.num_episodes);
    let robot = config.scene.robot.clone();
    let planner_config = config.clone();
    let summary = run_generation(
        &config,
        Arc::clone(&archive),
        move |_| KinematicSim::new(robot.clone()),
        move |_| InterpolatingPlanner::from_config(&planner_config),
        seeds,
        Arc::clone(&cancel),
    )
    .await
    .context("Generation failed to start")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if cancel.load(Ordering::Relaxed) {
        bail!("Generation interrupted after {} episodes", summary.attempted());
    }
    if summary.worker_failures > 0 || summary.archive_failures > 0 {
        bail!(
            "{} episodes could not be archived and {} workers failed",
            summary.archive_failures,
            summary.worker_failures
        );
    }
    let min = config.run.min_success_fraction;
    if !summary.meets(min) {
        bail!(
            "Success fraction {:.3} is below the required {:.3}",
            summary.success_fraction(),
            min
        );
    }
    tracing::info!(path = %output.display(), archived = summary.archived.len(), "Done");
    Ok(())
}

fn cmd_sample(
    mut config: SynthesisConfig,
    count: u64,
    seed_start: u64,
    task_type: Option<TaskChoice>,
) -> Result<()> {
    if let Some(kind) = task_type {
        config.sampler.only(kind.into());
    }
    let sampler = TaskSampler::new(config.sampler, config.scene.layout)
        .context("Invalid sampler configuration")?;

    for seed in seed_start..seed_start.saturating_add(count) {
        match sampler.sample(seed) {
            Ok(task) => {
                let goal = task.goal_pose().translation;
                println!(
                    "{seed:>6}  {:<14} {:<10} ({:.3}, {:.3}, {:.3})  {}",
                    task.kind(),
                    task.target_object_id(),
                    goal.x,
                    goal.y,
                    goal.z,
                    task.instruction()
                );
            }
            Err(e) => println!("{seed:>6}  <{e}>"),
        }
    }
    Ok(())
}

fn cmd_inspect(path: &Path, limit: usize) -> Result<()> {
    let archive = EpisodeArchive::open(path)
        .with_context(|| format!("Failed to open archive at {}", path.display()))?;
    let info = archive.info();
    let summary = archive.summary();

    println!("Archive: {}", path.display());
    println!("  Created: {}", info.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Joints: {}", info.joint_names.join(", "));
    for camera in &info.cameras {
        println!("  Camera {}: {}x{}", camera.name, camera.width, camera.height);
    }
    println!("  Episodes: {}", summary.episodes);
    println!("  Total steps: {}", summary.total_steps);
    println!();

    println!("By outcome:");
    for (outcome, count) in &summary.by_outcome {
        println!("  {outcome}: {count}");
    }
    println!("By task type:");
    for (kind, count) in &summary.by_kind {
        println!("  {kind}: {count}");
    }
    println!();

    let entries = archive.entries();
    if !entries.is_empty() {
        println!("Latest episodes:");
        for entry in entries.iter().rev().take(limit) {
            println!(
                "  [{:>6}] seed {:<8} {:<10} {:>4} steps  {}",
                entry.episode_id, entry.source_seed, entry.outcome, entry.length, entry.instruction
            );
        }
        if entries.len() > limit {
            println!("  ... and {} more", entries.len() - limit);
        }
    }
    Ok(())
}

fn cmd_verify(config: &SynthesisConfig, path: &Path, episode: Option<u64>, tolerance: f64) -> Result<()> {
    let archive = EpisodeArchive::open(path)
        .with_context(|| format!("Failed to open archive at {}", path.display()))?;
    let ids: Vec<u64> = match episode {
        Some(id) => vec![id],
        None => archive.entries().iter().map(|e| e.episode_id).collect(),
    };

    let mut scene = SceneController::from_config(KinematicSim::new(config.scene.robot.clone()), config);
    let mut diverged = 0usize;
    for id in &ids {
        let episode = archive
            .read_episode(*id)
            .with_context(|| format!("Failed to read episode {id}"))?;
        let report = verify_replay(&episode, &mut scene, tolerance)
            .with_context(|| format!("Replay of episode {id} failed"))?;
        match &report.divergence {
            None => println!("  [{id:>6}] ok ({} steps)", report.steps_checked),
            Some(d) => {
                diverged += 1;
                println!(
                    "  [{id:>6}] diverged at step {} in {} (deviation {:.3e})",
                    d.step, d.stream, d.deviation
                );
            }
        }
    }

    if diverged > 0 {
        bail!("{diverged} of {} episodes did not replay deterministically", ids.len());
    }
    tracing::info!(episodes = ids.len(), "All episodes replayed deterministically");
    Ok(())
}

fn cmd_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(&SynthesisConfig::default())?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::info!(path = %output.display(), "Wrote default configuration");
    Ok(())
}

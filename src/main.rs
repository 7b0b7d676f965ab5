//! oc-shader-tool - shader cache maintenance for oxidized-cell
//!
//! Inspects, compacts, locates and deletes the persistent shader caches the
//! renderer writes per game.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use oc_core::{logging, Config};
use oc_rsx::shader::disk_cache::{self, DiskCacheSummary};
use oc_rsx::shader::{cache_file_name, game_tag};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "oc-shader-tool")]
#[command(author, version, about = "Shader cache maintenance for oxidized-cell", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise a shader cache file
    Inspect {
        /// Cache file to read
        file: PathBuf,
    },

    /// Rewrite a cache file keeping the first record of each key
    Compact {
        /// Cache file to rewrite in place
        file: PathBuf,
    },

    /// Print the cache file path for a backend, device and game
    Path {
        /// Backend tag
        #[arg(long, default_value = "VK")]
        backend: String,

        /// Driver / device signature reported by the backend
        #[arg(long)]
        device: String,

        /// Game title ID
        #[arg(long)]
        game: String,

        /// Stage suffix: vs, fs, gs or prog
        #[arg(long, default_value = "vs")]
        stage: String,
    },

    /// Delete every cache file of a game from the configured directory
    Clear {
        /// Game title ID
        #[arg(long)]
        game: String,
    },
}

const STAGE_SUFFIXES: [&str; 4] = ["vs", "fs", "gs", "prog"];

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };
    logging::init(&config.debug).context("failed to initialise logging")?;
    if let Some(e) = load_error {
        warn!("Could not load {}: {}; using defaults", Config::config_path().display(), e);
    }

    match cli.command {
        Commands::Inspect { file } => {
            let summary = disk_cache::inspect(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            print_summary(&file, &summary);
        }
        Commands::Compact { file } => {
            let before = disk_cache::inspect(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let after = disk_cache::compact(&file)
                .with_context(|| format!("compacting {}", file.display()))?;
            info!("Compacted {}", file.display());
            println!(
                "{}: {} -> {} records ({} duplicates removed)",
                file.display(),
                before.records,
                after.records,
                before.records - after.records
            );
        }
        Commands::Path {
            backend,
            device,
            game,
            stage,
        } => {
            if !STAGE_SUFFIXES.contains(&stage.as_str()) {
                bail!("unknown stage '{}', expected one of {:?}", stage, STAGE_SUFFIXES);
            }
            let name = cache_file_name(&backend, &device, &game, &stage);
            println!("{}", config.paths.shader_cache.join(name).display());
        }
        Commands::Clear { game } => {
            let removed = clear_game(&config.paths.shader_cache, &game)?;
            println!("Removed {} cache files for {}", removed, game);
        }
    }

    Ok(())
}

fn print_summary(path: &Path, summary: &DiskCacheSummary) {
    println!("{}", path.display());
    println!(
        "  format {}  key size {}  generator {}",
        summary.header.version, summary.header.key_size, summary.header.generator_version
    );
    println!(
        "  {} records, {} unique keys, {} duplicates, {} skipped",
        summary.records, summary.unique_keys, summary.duplicates, summary.skipped
    );
    println!("  {} bytes of bytecode", summary.bytecode_bytes);
    if let Some(offset) = summary.truncated_at {
        println!("  damaged tail at offset {}", offset);
    }
}

/// Remove `<BACKEND>-<sig8>-<game>-<suffix>.cache` files for one game
fn clear_game(dir: &Path, game_id: &str) -> anyhow::Result<usize> {
    let tag = game_tag(game_id);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".cache") else {
            continue;
        };
        // backend and signature never contain '-', the game tag may
        let mut parts = stem.splitn(3, '-');
        let (Some(_backend), Some(_sig), Some(rest)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Some((game, suffix)) = rest.rsplit_once('-') else {
            continue;
        };
        if game == tag && STAGE_SUFFIXES.contains(&suffix) {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            info!("Removed {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

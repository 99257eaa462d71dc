//! `spatialvcs-cli` – SpatialVCS Command Line Interface
//!
//! This binary wires the perception and memory crates into an interactive
//! shell.  It:
//!
//! 1. Loads `~/.spatialvcs/config.toml`, writing the defaults on first run.
//! 2. Builds the frame pipeline (detector → frame processor → memory store).
//! 3. Drops the user into an **interactive REPL** (`/ingest`, `/search`,
//!    `/status`, `/reset`, `/help`).
//! 4. Intercepts **Ctrl-C** to flush the memory store and exit cleanly.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use spatialvcs_memory::SpatialMemory;
use spatialvcs_perception::{Detector, FrameProcessor};
use spatialvcs_runtime::SpatialPipeline;

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG sets the filter (default "info"); SPATIALVCS_LOG_FORMAT=json
    // switches to newline-delimited JSON.  Spans are exported over OTLP when
    // OTEL_EXPORTER_OTLP_ENDPOINT is set.  User-facing output stays println!.
    let _otel = spatialvcs_runtime::init_tracing("spatialvcs");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down after the current command …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Pipeline ──────────────────────────────────────────────────────────
    // No detection backend ships with the CLI; frames are stored whole.
    let detector = Detector::without_model(cfg.detector.clone());
    let processor = FrameProcessor::new(cfg.frames.clone(), detector);
    let memory = SpatialMemory::new(cfg.memory.clone());
    let pipeline = SpatialPipeline::new(processor, memory, None);

    print!(
        "\n  Opening memory store at {} … ",
        cfg.memory.database_path().display().to_string().dimmed()
    );
    if pipeline.memory().is_ready() {
        println!("{} ({} observation(s))", "ready".green(), pipeline.memory().len());
    } else {
        println!("{}", "unavailable".yellow());
        println!(
            "  {}",
            "Observations will not be stored; /search returns nothing.".dimmed()
        );
    }
    info!(
        frames_dir = %cfg.frames.frames_dir.display(),
        default_k = cfg.default_k,
        "spatialvcs started"
    );

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&pipeline, cfg.default_k, shutdown);
    pipeline.memory().save();
}

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

fn first_run() -> config::Config {
    println!();
    println!("  No configuration found.  Writing defaults.");

    let mut cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____          __  _      ___   _____________"#.bold().cyan());
    println!("{}", r#"  / __/__  ___ _/ /_(_)__ _/ / | / / ___/ __/"#.bold().cyan());
    println!("{}", r#" _\ \/ _ \/ _ `/ __/ / _ `/ /| |/ / /___\ \  "#.bold().cyan());
    println!("{}", r#"/___/ .__/\_,_/\__/_/\_,_/_/ |___/\___/___/  "#.bold().cyan());
    println!("{}", r#"   /_/                                       "#.bold().cyan());
    println!();
    println!("  {} {}",
        "SpatialVCS".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Version control for the physical world");
    println!();
}

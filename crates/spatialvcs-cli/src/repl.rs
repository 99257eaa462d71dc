//! REPL – the interactive SpatialVCS shell.
//!
//! Supported slash-commands:
//!   /ingest <image> <depth> <pose> <scan> [--no-detect]
//!   /search [k] [@scan] <query…>
//!   /note <scan> <text…>   – remember a free-text observation
//!   /records [scan]
//!   /snapshot <scan> – objects remembered for one scan
//!   /end <scan>     – forget tracker state for a finished scan
//!   /status
//!   /reset          – wipe the memory store (asks for confirmation)
//!   /help
//!   /quit | /exit

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use colored::Colorize;
use serde_json::Value;
use spatialvcs_memory::{AddOutcome, StoreStatus};
use spatialvcs_types::Metadata;
use spatialvcs_runtime::SpatialPipeline;

// ─────────────────────────────────────────────────────────────────────────────
// Command grammar
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ingest {
        image: PathBuf,
        depth: f64,
        pose: String,
        scan: String,
        detect: bool,
    },
    Search {
        k: Option<usize>,
        scan: Option<String>,
        query: String,
    },
    Note { scan: String, text: String },
    Records { scan: Option<String> },
    Snapshot { scan: String },
    EndScan { scan: String },
    Status,
    Reset,
    Help,
    Quit,
}

/// Parse one input line.  `Err` carries a usage message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let rest: Vec<&str> = words.collect();

    match head {
        "/ingest" => {
            let usage = || "usage: /ingest <image> <depth> <pose> <scan> [--no-detect]".to_string();
            let (args, detect) = match rest.split_last() {
                Some((&"--no-detect", args)) => (args, false),
                _ => (rest.as_slice(), true),
            };
            let [image, depth, pose, scan] = args else {
                return Err(usage());
            };
            let depth = depth
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d > 0.0)
                .ok_or_else(|| format!("depth must be a positive number, got '{depth}'"))?;
            Ok(Command::Ingest {
                image: PathBuf::from(image),
                depth,
                pose: (*pose).to_string(),
                scan: (*scan).to_string(),
                detect,
            })
        }
        "/search" => {
            let mut rest = rest.as_slice();
            let mut k = None;
            if let Some((first, tail)) = rest.split_first()
                && let Ok(n) = first.parse::<usize>()
            {
                k = Some(n);
                rest = tail;
            }
            let mut scan = None;
            if let Some((first, tail)) = rest.split_first()
                && let Some(id) = first.strip_prefix('@')
                && !id.is_empty()
            {
                scan = Some(id.to_string());
                rest = tail;
            }
            if rest.is_empty() {
                return Err("usage: /search [k] [@scan] <query…>".to_string());
            }
            Ok(Command::Search {
                k,
                scan,
                query: rest.join(" "),
            })
        }
        "/note" => match rest.split_first() {
            Some((scan, text)) if !text.is_empty() => Ok(Command::Note {
                scan: scan.to_string(),
                text: text.join(" "),
            }),
            _ => Err("usage: /note <scan> <text…>".to_string()),
        },
        "/records" => Ok(Command::Records {
            scan: rest.first().map(|s| s.to_string()),
        }),
        "/snapshot" => match rest.as_slice() {
            [scan] => Ok(Command::Snapshot {
                scan: scan.to_string(),
            }),
            _ => Err("usage: /snapshot <scan>".to_string()),
        },
        "/end" => match rest.as_slice() {
            [scan] => Ok(Command::EndScan {
                scan: scan.to_string(),
            }),
            _ => Err("usage: /end <scan>".to_string()),
        },
        "/status" => Ok(Command::Status),
        "/reset" => Ok(Command::Reset),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(pipeline: &SpatialPipeline, default_k: usize, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "spatialvcs>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Ingest {
                image,
                depth,
                pose,
                scan,
                detect,
            }) => cmd_ingest(pipeline, &image, depth, &pose, &scan, detect),
            Ok(Command::Search { k, scan, query }) => {
                cmd_search(pipeline, k.unwrap_or(default_k), scan.as_deref(), &query)
            }
            Ok(Command::Note { scan, text }) => cmd_note(pipeline, &scan, &text),
            Ok(Command::Records { scan }) => cmd_records(pipeline, scan.as_deref()),
            Ok(Command::Snapshot { scan }) => cmd_snapshot(pipeline, &scan),
            Ok(Command::EndScan { scan }) => {
                pipeline.end_scan(&scan);
                println!("{} tracker state for scan {} dropped", "✓".green(), scan.bold());
            }
            Ok(Command::Status) => cmd_status(pipeline),
            Ok(Command::Reset) => cmd_reset(pipeline),
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Quit) => {
                pipeline.memory().save();
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "SpatialVCS Commands".bold().underline());
    println!("  {}  – store and describe one frame", "/ingest <image> <depth> <pose> <scan> [--no-detect]".bold().cyan());
    println!("  {}                 – search memory, optionally within one scan", "/search [k] [@scan] <query>".bold().cyan());
    println!("  {}                    – remember a free-text observation", "/note <scan> <text>".bold().cyan());
    println!("  {}                          – list stored observations", "/records [scan]".bold().cyan());
    println!("  {}                        – objects remembered for a scan", "/snapshot <scan>".bold().cyan());
    println!("  {}                             – end a scan's tracking session", "/end <scan>".bold().cyan());
    println!("  {}                                 – detector and memory status", "/status".bold().cyan());
    println!("  {}                                  – wipe the memory store", "/reset".bold().cyan());
    println!("  {}                            – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_ingest(
    pipeline: &SpatialPipeline,
    image: &Path,
    depth: f64,
    pose: &str,
    scan: &str,
    detect: bool,
) {
    let bytes = match std::fs::read(image) {
        Ok(b) => b,
        Err(e) => {
            println!("{} {}: {}", "Cannot read".red(), image.display(), e);
            return;
        }
    };
    match pipeline.ingest_frame(&bytes, depth, pose, scan, detect) {
        Ok(report) => {
            let Some(path) = report.frame_path else {
                println!("{}", "Not a decodable image; nothing stored.".yellow());
                return;
            };
            println!("  frame      : {}", path.display().to_string().dimmed());
            if report.degraded {
                println!("  detections : {}", "no detector model (whole frame only)".yellow());
            } else {
                println!("  detections : {}", report.detections);
            }
            println!("  stored     : {}", report.stored.len().to_string().green());
            if report.skipped > 0 {
                println!("  skipped    : {}", report.skipped.to_string().yellow());
            }
        }
        Err(e) => println!("{}: {}", "Ingest failed".red(), e),
    }
}

fn cmd_search(pipeline: &SpatialPipeline, k: usize, scan: Option<&str>, query: &str) {
    match pipeline.ask(query, k, scan) {
        Ok(hits) if hits.is_empty() => {
            if pipeline.memory().is_ready() {
                println!("{}", "No matching observations.".dimmed());
            } else {
                println!("{}", "Memory store is not available.".yellow());
            }
        }
        Ok(hits) => {
            for (rank, hit) in hits.iter().enumerate() {
                let scan_id = hit.metadata.get("scan_id").and_then(Value::as_str).unwrap_or("?");
                let ts = hit.metadata.get("timestamp").and_then(Value::as_str).unwrap_or("");
                println!(
                    "  {}. [{:.3}] {}  {}",
                    rank + 1,
                    hit.score,
                    hit.text.bold(),
                    format!("scan={scan_id} {ts}").dimmed()
                );
            }
        }
        Err(e) => println!("{}: {}", "Search failed".red(), e),
    }
}

fn cmd_note(pipeline: &SpatialPipeline, scan: &str, text: &str) {
    let mut meta = Metadata::new();
    meta.insert("scan_id".into(), Value::from(scan));
    meta.insert("label".into(), Value::from("note"));
    meta.insert("kind".into(), Value::from("note"));
    meta.insert("timestamp".into(), Value::from(Utc::now().to_rfc3339()));
    match pipeline.memory().add_observation(text, &meta) {
        Ok(AddOutcome::Stored { id }) => println!("{} stored as {}", "✓".green(), id.bold()),
        Ok(AddOutcome::NotReady) => println!("{}", "Memory store is not available; note dropped.".yellow()),
        Err(e) => println!("{}: {}", "Note failed".red(), e),
    }
}

fn cmd_records(pipeline: &SpatialPipeline, scan: Option<&str>) {
    let records = pipeline.memory().records();
    let mut shown = 0;
    for r in &records {
        let rec_scan = r.metadata.get("scan_id").and_then(Value::as_str);
        if scan.is_some() && rec_scan != scan {
            continue;
        }
        shown += 1;
        println!("  {} {}", r.id.dimmed(), r.text);
    }
    println!("  {} of {} record(s)", shown, records.len());
}

fn cmd_snapshot(pipeline: &SpatialPipeline, scan: &str) {
    let objects = pipeline.snapshot(scan);
    if objects.is_empty() {
        println!("{}", format!("Nothing remembered for scan {scan}.").dimmed());
        return;
    }
    for obj in &objects {
        println!("  • {}", obj.to_text());
    }
}

fn cmd_status(pipeline: &SpatialPipeline) {
    let memory = pipeline.memory();
    let ready = memory.is_ready();
    println!("{}", "Status".bold().underline());
    let detector = if pipeline.processor().detector().is_available() {
        "available".green()
    } else {
        "unavailable (degraded)".yellow()
    };
    println!("  detector   : {detector}");
    let store = match memory.status() {
        StoreStatus::Ready => "ready".green(),
        StoreStatus::Degraded => "degraded".yellow(),
        StoreStatus::Uninitialized => "uninitialised".dimmed(),
    };
    println!("  memory     : {store}");
    if ready {
        println!("  records    : {}", memory.len());
        println!(
            "  index      : {}",
            memory.config().database_path().display().to_string().dimmed()
        );
    }
    let describer = if pipeline.has_describer() {
        "configured".green()
    } else {
        "none (labels only)".dimmed()
    };
    println!("  describer  : {describer}");
}

fn cmd_reset(pipeline: &SpatialPipeline) {
    print!("  {} ", "Delete every stored observation? [y/N]".red().bold());
    io::stdout().flush().ok();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() || !line.trim().eq_ignore_ascii_case("y") {
        println!("  Aborted.");
        return;
    }
    match pipeline.memory().reset_database() {
        Ok(()) => println!("{}", "✓ Memory store reset.".green()),
        Err(e) => println!("{}: {}", "Reset failed".red(), e),
    }
}

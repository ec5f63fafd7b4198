//! CLI binary for edgequake-docpipe.
//!
//! A thin shim over the library crate: loads a pipeline file, maps CLI
//! flags to `ExecuteOptions` and collaborators, and renders lifecycle
//! events as a progress bar.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docpipe::{
    EventKind, EventPayload, ExecuteOptions, FileCheckpointStore, Metadata, PipelineDefinition,
    PipelineEvent, PipelineManager, PipelineRun, RunStatus, StageRegistry, StageStatus,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress rendering from the event stream ─────────────────────────────────

/// Drains lifecycle events and renders one log line per finished stage
/// above a bar anchored at the bottom of the terminal. Stages may finish
/// out of order; the bar only counts terminal events.
fn spawn_progress(mut events: UnboundedReceiver<PipelineEvent>, total: usize) -> JoinHandle<()> {
    let bar = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  \
         [{bar:42.green/238}] {pos:>3}/{len} stages  \
         ⏱ {elapsed_precise}  {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(TICKS);
    bar.set_style(style);
    bar.set_prefix("Running");
    bar.enable_steady_tick(Duration::from_millis(80));

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let stage = event.stage_name.clone().unwrap_or_default();
            match (&event.kind, &event.payload) {
                (EventKind::PipelineStarted, EventPayload::Pipeline { document_id, .. }) => {
                    bar.println(format!(
                        "{} {}",
                        cyan("◆"),
                        bold(&format!("Processing {document_id} ({total} stages)…"))
                    ));
                }
                (EventKind::StageStarted, _) => bar.set_message(stage),
                (EventKind::TaskProgress, EventPayload::Progress { fraction, message, .. }) => {
                    let note = message.clone().unwrap_or_default();
                    bar.set_message(format!("{stage} {:.0}% {note}", fraction * 100.0));
                }
                (
                    EventKind::StageCompleted,
                    EventPayload::Stage {
                        duration_ms,
                        detail,
                        ..
                    },
                ) => {
                    let took = duration_ms
                        .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                        .or_else(|| detail.clone())
                        .unwrap_or_default();
                    bar.println(format!("  {} {:<24}  {}", green("✓"), stage, dim(&took)));
                    bar.inc(1);
                }
                (EventKind::StageFailed, EventPayload::Stage { detail, .. }) => {
                    let msg = truncate(detail.as_deref().unwrap_or("failed"), 80);
                    bar.println(format!("  {} {:<24}  {}", red("✗"), stage, red(&msg)));
                    bar.inc(1);
                }
                (EventKind::StageSkipped, EventPayload::Stage { detail, .. }) => {
                    let msg = truncate(detail.as_deref().unwrap_or("skipped"), 80);
                    bar.println(format!("  {} {:<24}  {}", dim("○"), stage, dim(&msg)));
                    bar.inc(1);
                }
                (
                    EventKind::PipelineCompleted
                    | EventKind::PipelineFailed
                    | EventKind::PipelineCancelled,
                    _,
                ) => break,
                _ => {}
            }
        }
        bar.finish_and_clear();
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run a pipeline against a document
  docpipe ingest.yaml report-2024.pdf

  # Attach metadata visible to stage conditions
  docpipe ingest.yaml scan.pdf --meta language=fr --meta pages=120

  # Validate the definition and print the execution order
  docpipe ingest.yaml --validate-only

  # Exercise validate()/dry_run() of every stage without side effects
  docpipe ingest.yaml report.pdf --dry-run

  # Persist checkpoints on disk so an interrupted run resumes
  docpipe ingest.yaml report.pdf --checkpoint-dir .docpipe/checkpoints

  # Print the full run record as JSON
  docpipe ingest.yaml report.pdf --json > run.json

BUILT-IN STAGE TYPES:
  noop       completes immediately, echoes its params as output
  command    runs params.program with params.args, fails on non-zero exit

ENVIRONMENT VARIABLES:
  RUST_LOG                 tracing filter (overrides --verbose / --quiet)
  DOCPIPE_CHECKPOINT_DIR   default for --checkpoint-dir
"#;

/// Run a DAG document pipeline from a YAML or JSON definition.
#[derive(Parser, Debug)]
#[command(
    name = "docpipe",
    version,
    about = "Run a DAG document processing pipeline",
    long_about = "Run a document processing pipeline described as a DAG of stages. Independent \
stages run concurrently under resource admission control; progress is checkpointed after every \
stage so an interrupted run resumes where it stopped.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Pipeline definition file (.yaml, .yml or .json).
    pipeline: PathBuf,

    /// Document identifier; also the checkpoint key.
    #[arg(required_unless_present = "validate_only")]
    document: Option<String>,

    /// Document metadata as key=value (repeatable). Values are parsed as
    /// JSON when possible, otherwise kept as strings.
    #[arg(short, long = "meta", value_name = "KEY=VALUE")]
    meta: Vec<String>,

    /// Call validate()/dry_run() on every stage; never execute().
    #[arg(long)]
    dry_run: bool,

    /// Neither restore nor persist checkpoints for this run.
    #[arg(long)]
    no_checkpoint: bool,

    /// Directory for file-backed checkpoints (in-memory when unset).
    #[arg(long, env = "DOCPIPE_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Validate the definition, print the topological order and exit.
    #[arg(long)]
    validate_only: bool,

    /// Print the PipelineRun as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-stage feedback, so library INFO logs
    // are muted while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.validate_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let definition = PipelineDefinition::load(&cli.pipeline)
        .with_context(|| format!("Failed to load pipeline from {:?}", cli.pipeline))?;

    // ── Validate-only mode ───────────────────────────────────────────────
    if cli.validate_only {
        print_plan(&definition, cli.json)?;
        return Ok(());
    }

    let document = cli
        .document
        .clone()
        .context("A document id is required unless --validate-only is set")?;
    let metadata = parse_meta(&cli.meta)?;

    // ── Build manager ────────────────────────────────────────────────────
    let total = definition.stages().len();
    let mut builder = PipelineManager::builder(definition).registry(StageRegistry::with_builtins());
    if let Some(ref dir) = cli.checkpoint_dir {
        let store = FileCheckpointStore::open(dir)
            .await
            .with_context(|| format!("Failed to open checkpoint directory {:?}", dir))?;
        builder = builder.checkpoint_store(Arc::new(store));
    }
    let manager = builder.build().context("Failed to build pipeline manager")?;

    let renderer = if show_progress {
        Some(spawn_progress(manager.subscribe(&[]), total))
    } else {
        None
    };

    // Ctrl-C asks the active run to stop cooperatively.
    let control = manager.control();
    let quiet = cli.quiet;
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && control.cancel() && !quiet {
            eprintln!("{} cancelling…", cyan("⚠"));
        }
    });

    let options = if cli.dry_run {
        ExecuteOptions::dry_run()
    } else if cli.no_checkpoint {
        ExecuteOptions::without_checkpoint()
    } else {
        ExecuteOptions::default()
    };

    // ── Run ──────────────────────────────────────────────────────────────
    let outcome = manager.execute(&document, metadata, options).await;

    interrupt.abort();
    if let Some(renderer) = renderer {
        // The renderer stops on the terminal pipeline event; a run rejected
        // before it started never sends one.
        if tokio::time::timeout(Duration::from_secs(1), renderer)
            .await
            .is_err()
        {
            tracing::debug!("progress renderer did not see a terminal event");
        }
    }
    manager.shutdown().await;

    match outcome {
        Ok(run) => {
            report(&run, &cli, show_progress)?;
            match run.status {
                RunStatus::Completed => Ok(()),
                status => anyhow::bail!("Pipeline run {} finished {}", run.run_id, status),
            }
        }
        Err(err) => {
            if let Some(run) = err.run() {
                report(run, &cli, show_progress)?;
            }
            Err(anyhow::Error::new(err)
                .context(format!("Pipeline failed for document '{document}'")))
        }
    }
}

/// Print the run either as JSON on stdout or as a summary on stderr.
fn report(run: &PipelineRun, cli: &Cli, show_progress: bool) -> Result<()> {
    if cli.json {
        let json = serde_json::to_string_pretty(run).context("Failed to serialise run")?;
        println!("{json}");
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    let completed = run.count(StageStatus::Completed);
    let failed = run.count(StageStatus::Failed);
    let skipped = run.count(StageStatus::Skipped);
    let icon = match run.status {
        RunStatus::Completed => green("✔"),
        RunStatus::Cancelled => cyan("⚠"),
        _ => red("✘"),
    };
    let elapsed_ms = run
        .finished_at
        .map(|end| (end - run.created_at).num_milliseconds().max(0))
        .unwrap_or(0);
    eprintln!(
        "{icon}  {}  {}  {} completed / {} failed / {} skipped  {}ms",
        bold(&run.document_id),
        run.status,
        completed,
        red(&failed.to_string()),
        dim(&skipped.to_string()),
        elapsed_ms,
    );
    if !run.resumed_stages.is_empty() {
        eprintln!(
            "   {} resumed from checkpoint: {}",
            dim("↺"),
            run.resumed_stages.join(", ")
        );
    }
    if run.dry_run {
        eprintln!("   {}", dim("dry run: no stage executed, nothing persisted"));
    }
    if !show_progress {
        let mut names: Vec<_> = run.stage_results.keys().collect();
        names.sort();
        for name in names {
            let r = &run.stage_results[name];
            let detail = r.error.clone().unwrap_or_default();
            eprintln!("   {:<24} {:<10} {}", name, r.status, dim(&detail));
        }
    }
    Ok(())
}

/// `--validate-only`: the stage list in execution order.
fn print_plan(definition: &PipelineDefinition, json: bool) -> Result<()> {
    let order = definition.topological_order();
    if json {
        let plan = serde_json::json!({
            "name": definition.name(),
            "version": definition.version(),
            "order": order,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&plan).context("Failed to serialise plan")?
        );
        return Ok(());
    }

    println!(
        "Pipeline:  {} {}",
        bold(definition.name()),
        dim(definition.version())
    );
    for (i, name) in order.iter().enumerate() {
        let deps = definition.graph().dependencies(name);
        let after = if deps.is_empty() {
            String::new()
        } else {
            dim(&format!("after {}", deps.join(", ")))
        };
        println!("  {:>2}. {:<24} {}", i + 1, name, after);
    }
    println!("{} valid, {} stages", green("✔"), order.len());
    Ok(())
}

/// Parse repeated `--meta key=value` into document metadata.
fn parse_meta(pairs: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --meta '{pair}': expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid --meta '{}': empty key", pair);
        }
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::EnvFilter;

use residue::{CleanAction, CleanOutcome, Config, RunReport, ScanDepth, ScanFinding, Sweep};

#[derive(Parser)]
#[command(version, about = "Find and safely remove what an application left behind")]
struct Opts {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Decrease verbosity (-q)
    #[arg(short = 'q', action = clap::ArgAction::Count, global = true)]
    quiet: u8,
    /// Configuration file (default: <config dir>/residue/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List traces of an application
    Scan(ScanArgs),
    /// Scan, back up and remove traces of an application
    Clean {
        #[command(flatten)]
        scan: ScanArgs,
        /// Report what would be removed without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Also remove low-confidence findings and kill busy processes
        #[arg(long)]
        force: bool,
        /// Skip the backup snapshot
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        min_confidence: Option<f32>,
    },
    /// Re-create what a clean session removed
    Restore { session: String },
    /// List backup sessions
    Sessions,
    /// Apply deletions deferred by earlier cleans
    FlushDeferred,
}

#[derive(Args)]
struct ScanArgs {
    /// Application name or identifier
    target: String,
    #[arg(long, value_enum)]
    depth: Option<ScanDepth>,
    /// Filesystem root (repeatable; replaces the defaults)
    #[arg(long = "root")]
    roots: Vec<PathBuf>,
    /// Configuration-store root (repeatable; replaces the defaults)
    #[arg(long = "store-root")]
    store_roots: Vec<String>,
    /// JSON hive document backing the configuration store
    #[arg(long)]
    store_file: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
}

impl ScanArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(depth) = self.depth {
            config.depth = depth;
        }
        if !self.roots.is_empty() {
            config.roots.filesystem = self.roots.clone();
        }
        if !self.store_roots.is_empty() {
            config.roots.store = self.store_roots.clone();
        }
        if let Some(file) = &self.store_file {
            config.store_file = Some(file.clone());
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
    }
}

fn init_tracing(verbosity: i16) {
    let level = match verbosity {
        i16::MIN..=-1 => Level::ERROR,
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .finish();

    let _ = set_global_default(subscriber);
}

fn main() {
    let opts = Opts::parse();
    init_tracing(i16::from(opts.verbose) - i16::from(opts.quiet));
    if let Err(e) = run(opts) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    let mut config =
        Config::load_or_default(opts.config.as_deref()).context("Failed to load configuration")?;

    match opts.command {
        Command::Scan(args) => {
            args.apply(&mut config);
            let sweep = Sweep::from_config(config, &args.target).context("Invalid configuration")?;
            let mut report = RunReport::new(&args.target);
            let findings = collect_findings(&sweep, opts.json, &mut report)?;
            sweep.collect_stats(&mut report);
            report.finish();

            if opts.json {
                print_json(&serde_json::json!({ "findings": findings, "report": report }))?;
            } else {
                print_findings(&findings);
                print_report(&report);
            }
        }
        Command::Clean {
            scan,
            dry_run,
            force,
            no_backup,
            min_confidence,
        } => {
            scan.apply(&mut config);
            config.dry_run |= dry_run;
            config.force |= force;
            if no_backup {
                config.create_backup = false;
            }
            if let Some(min) = min_confidence {
                config.min_confidence = min;
            }
            let sweep = Sweep::from_config(config, &scan.target).context("Invalid configuration")?;
            let mut report = RunReport::new(&scan.target);
            let findings = collect_findings(&sweep, opts.json, &mut report)?;

            let mut run = sweep.clean(findings).context("Cannot start cleaning")?;
            let mut outcomes = Vec::new();
            for outcome in run.by_ref() {
                report.record_outcome(&outcome);
                if !opts.json {
                    print_outcome(&outcome);
                }
                outcomes.push(outcome);
            }
            report.session_id = run.session().map(|s| s.id().to_string());
            sweep.collect_stats(&mut report);
            report.finish();

            if opts.json {
                print_json(&serde_json::json!({ "outcomes": outcomes, "report": report }))?;
            } else {
                print_report(&report);
            }
        }
        Command::Restore { session } => {
            let sweep = Sweep::from_config(config, "restore").context("Invalid configuration")?;
            let restored = sweep
                .restore(&session)
                .with_context(|| format!("Cannot restore session {}", session))?;
            if opts.json {
                print_json(&restored)?;
            } else {
                println!(
                    "{} {} entries restored, {} failed, {} nodes re-created",
                    "Restore:".bold(),
                    restored.restored.to_string().green(),
                    restored.failed.to_string().red(),
                    restored.nodes_created
                );
            }
        }
        Command::Sessions => {
            let sweep = Sweep::from_config(config, "sessions").context("Invalid configuration")?;
            let sessions = sweep.sessions().context("Cannot list backup sessions")?;
            if opts.json {
                print_json(&sessions)?;
            } else if sessions.is_empty() {
                println!("No backup sessions in {}", sweep.config().backup_dir.display());
            } else {
                for session in sessions {
                    println!(
                        "{}  {}  {} entries",
                        session.id.bold(),
                        session.created.format("%Y-%m-%d %H:%M:%S"),
                        session.entries
                    );
                }
            }
        }
        Command::FlushDeferred => {
            let sweep = Sweep::from_config(config, "flush").context("Invalid configuration")?;
            let flushed = sweep.flush_deferred().context("Cannot flush deferred deletions")?;
            if opts.json {
                print_json(&flushed)?;
            } else {
                println!(
                    "{} {} removed, {} still pending",
                    "Deferred:".bold(),
                    flushed.removed.len(),
                    flushed.remaining.len()
                );
            }
        }
    }
    Ok(())
}

fn collect_findings(sweep: &Sweep, quiet: bool, report: &mut RunReport) -> Result<Vec<ScanFinding>> {
    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% | {msg}")?
                .progress_chars("=>-"),
        );
        pb
    };
    let observer_bar = progress.clone();
    sweep.set_observer(Arc::new(move |fraction: f32, message: &str| {
        observer_bar.set_position((fraction * 100.0) as u64);
        observer_bar.set_message(message.to_string());
    }));

    let mut scan = sweep.scan().context("Cannot start scan")?;
    let mut findings = Vec::new();
    for finding in scan.by_ref() {
        progress.set_message(finding.path.clone());
        findings.push(finding);
    }
    progress.finish_and_clear();

    report.findings = findings.len();
    report.set_tasks(scan.report());
    Ok(findings)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Cannot encode output")?);
    Ok(())
}

fn print_findings(findings: &[ScanFinding]) {
    if findings.is_empty() {
        println!("{}", "No traces found.".green());
        return;
    }
    for finding in findings {
        let risk = match finding.risk_level {
            0 | 1 => "low".green(),
            2 => "medium".yellow(),
            _ => "high".red(),
        };
        let lock = if finding.can_delete { "" } else { " [protected]" };
        println!(
            "{:>5.0}%  {:<6}  {:<14} {}{}  ({})",
            finding.confidence * 100.0,
            risk,
            finding.item_type,
            finding.path,
            lock.red(),
            format_size(finding.size, BINARY)
        );
    }
}

fn print_outcome(outcome: &CleanOutcome) {
    let action = match outcome.action {
        CleanAction::Deleted | CleanAction::AlreadyGone => outcome.action.as_str().green(),
        CleanAction::Simulated | CleanAction::Deferred => outcome.action.as_str().cyan(),
        CleanAction::Skip => outcome.action.as_str().yellow(),
        CleanAction::Failed => outcome.action.as_str().red(),
    };
    println!("{:<12} {}  {}", action, outcome.target, outcome.message.dimmed());
}

fn print_report(report: &RunReport) {
    println!();
    println!("{}", "Summary".bold());
    println!(
        "  scanned {}, found {}, cleaned {}, failed {}",
        report.items_scanned(),
        report.items_found(),
        report.items_cleaned(),
        report.items_failed()
    );
    println!(
        "  freed {} in {:.1}s",
        format_size(report.bytes_freed, BINARY).bold(),
        report.duration.as_secs_f64()
    );
    let incomplete = report.incomplete_roots();
    if incomplete > 0 {
        println!("  {} root(s) did not finish", incomplete.to_string().yellow());
    }
    if let Some(id) = &report.session_id {
        println!("  backup session {}", id.bold());
    }
    if !report.errors.is_empty() {
        println!("  {} error(s) recorded", report.errors.len().to_string().red());
    }
}
